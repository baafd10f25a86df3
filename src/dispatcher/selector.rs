//! Candidate scoring for dispatch (pure functions)
//!
//! `score = w_load * (1 - cpu) + w_tasks * (1 - running/max_concurrent)
//!        + w_recent * recency(last_heartbeat)`
//!
//! Ties break on the lexicographically smallest agent_id so repeated
//! runs over the same fleet pick the same Agent.

use chrono::{DateTime, Utc};

use crate::config::ScoringWeights;
use crate::domain_types::{AgentKey, MaxConcurrentTasks, StaleAfterSecs};

/// Everything the scorer needs to know about one eligible Agent
#[derive(Debug, Clone)]
pub struct Candidate {
    pub agent_id: AgentKey,
    /// 0..=1; Agents without a snapshot are treated as fully loaded
    pub cpu_usage: f64,
    pub running_tasks: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Candidate {
    /// Conservative defaults for an Agent that never reported metrics
    pub fn without_snapshot(agent_id: AgentKey, last_heartbeat: Option<DateTime<Utc>>) -> Self {
        Self {
            agent_id,
            cpu_usage: 1.0,
            running_tasks: 0,
            last_heartbeat,
        }
    }
}

/// Freshness of the last heartbeat on a 0..=1 scale: 1 right now, 0 at
/// the staleness boundary (or for an Agent that never reported)
pub fn recency(
    last_heartbeat: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    stale_after: StaleAfterSecs,
) -> f64 {
    let Some(last) = last_heartbeat else {
        return 0.0;
    };
    let age = (now - last).num_milliseconds().max(0) as f64 / 1000.0;
    let bound = stale_after.as_u64() as f64;
    (1.0 - age / bound).clamp(0.0, 1.0)
}

/// Scores one candidate under the configured weights
pub fn score(
    candidate: &Candidate,
    weights: ScoringWeights,
    max_concurrent: MaxConcurrentTasks,
    now: DateTime<Utc>,
    stale_after: StaleAfterSecs,
) -> f64 {
    let load = 1.0 - candidate.cpu_usage.clamp(0.0, 1.0);
    let slots = 1.0
        - (f64::from(candidate.running_tasks) / f64::from(max_concurrent.as_u16())).clamp(0.0, 1.0);
    let freshness = recency(candidate.last_heartbeat, now, stale_after);
    weights.load * load + weights.tasks * slots + weights.recency * freshness
}

/// Orders candidates best first; equal scores fall back to agent_id
pub fn rank(
    mut candidates: Vec<Candidate>,
    weights: ScoringWeights,
    max_concurrent: MaxConcurrentTasks,
    now: DateTime<Utc>,
    stale_after: StaleAfterSecs,
) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        let score_a = score(a, weights, max_concurrent, now, stale_after);
        let score_b = score(b, weights, max_concurrent, now, stale_after);
        score_b
            .partial_cmp(&score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.agent_id.cmp(&b.agent_id))
    });
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, cpu: f64, running: u32, heartbeat_age_secs: i64) -> Candidate {
        Candidate {
            agent_id: AgentKey::try_new(id.to_string()).unwrap(),
            cpu_usage: cpu,
            running_tasks: running,
            last_heartbeat: Some(Utc::now() - chrono::Duration::seconds(heartbeat_age_secs)),
        }
    }

    fn defaults() -> (ScoringWeights, MaxConcurrentTasks, StaleAfterSecs) {
        (
            ScoringWeights::default(),
            MaxConcurrentTasks::try_new(4).unwrap(),
            StaleAfterSecs::try_new(90).unwrap(),
        )
    }

    #[test]
    fn test_should_prefer_less_loaded_agent_when_ranking() {
        let (weights, max_concurrent, stale) = defaults();
        let ranked = rank(
            vec![candidate("a3", 0.8, 0, 0), candidate("a4", 0.2, 0, 0)],
            weights,
            max_concurrent,
            Utc::now(),
            stale,
        );
        assert_eq!(ranked[0].agent_id.as_str(), "a4");
    }

    #[test]
    fn test_should_break_ties_on_smallest_agent_id() {
        let (weights, max_concurrent, stale) = defaults();
        let ranked = rank(
            vec![candidate("b", 0.5, 1, 10), candidate("a", 0.5, 1, 10)],
            weights,
            max_concurrent,
            Utc::now(),
            stale,
        );
        assert_eq!(ranked[0].agent_id.as_str(), "a");
        assert_eq!(ranked[1].agent_id.as_str(), "b");
    }

    #[test]
    fn test_should_scale_recency_from_fresh_to_stale() {
        let stale = StaleAfterSecs::try_new(90).unwrap();
        let now = Utc::now();
        assert!((recency(Some(now), now, stale) - 1.0).abs() < 1e-9);
        let half = recency(Some(now - chrono::Duration::seconds(45)), now, stale);
        assert!((half - 0.5).abs() < 0.01);
        assert!(recency(Some(now - chrono::Duration::seconds(200)), now, stale).abs() < 1e-9);
        assert!(recency(None, now, stale).abs() < 1e-9);
    }

    #[test]
    fn test_should_penalize_agents_near_their_task_cap() {
        let (weights, _, stale) = defaults();
        let max_concurrent = MaxConcurrentTasks::try_new(2).unwrap();
        let now = Utc::now();
        let idle = score(&candidate("a", 0.5, 0, 0), weights, max_concurrent, now, stale);
        let busy = score(&candidate("a", 0.5, 2, 0), weights, max_concurrent, now, stale);
        assert!(idle > busy);
    }
}
