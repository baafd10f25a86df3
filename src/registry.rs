//! Agent registry service (identity & capability store front)
//!
//! Registration is keyed on `(hostname, port)`: re-registering a known
//! endpoint updates the row in place and keeps its identity and status.
//! Capability and tag edits validate against the catalog and are
//! idempotent. Deleting an Agent cascades to its metrics snapshot and
//! fails every task it still owns.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::catalog::CatalogResolver;
use crate::domain_types::{
    Agent, AgentKey, AgentStatus, CapabilityId, HostName, MetricsSnapshot, PageNumber, PageSize,
    PortNumber, TagId,
};
use crate::error::{FleetError, FleetResult};
use crate::storage::{AgentListFilter, AgentStore, MetricsStore, PagedRows, TaskStore};
use crate::time_provider::SharedTimeProvider;

/// Reason stamped on tasks orphaned by Agent deletion
const OWNER_LOST: &str = "owner_lost";

/// Registration payload from an Agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub agent_id: AgentKey,
    pub hostname: HostName,
    pub port: PortNumber,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub remark: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<CapabilityId>,
    #[serde(default)]
    pub tags: Vec<TagId>,
}

/// Whether `register` created a new row or refreshed a known endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterOutcome {
    Created,
    Updated,
}

/// An Agent joined with its latest metrics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentWithMetrics {
    #[serde(flatten)]
    pub agent: Agent,
    pub metrics: Option<MetricsSnapshot>,
}

/// Service front over the agent registry
pub struct AgentRegistry {
    agents: Arc<dyn AgentStore>,
    metrics: Arc<dyn MetricsStore>,
    tasks: Arc<dyn TaskStore>,
    catalog: Arc<CatalogResolver>,
    time: SharedTimeProvider,
}

impl AgentRegistry {
    /// Creates the registry service
    pub fn new(
        agents: Arc<dyn AgentStore>,
        metrics: Arc<dyn MetricsStore>,
        tasks: Arc<dyn TaskStore>,
        catalog: Arc<CatalogResolver>,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            agents,
            metrics,
            tasks,
            catalog,
            time,
        }
    }

    async fn validate_capabilities(&self, ids: &[CapabilityId]) -> FleetResult<()> {
        for id in ids {
            if !self.catalog.validate_capability(id).await? {
                return Err(FleetError::invalid_reference("capability", id.as_str()));
            }
        }
        Ok(())
    }

    async fn validate_tags(&self, ids: &[TagId]) -> FleetResult<()> {
        for id in ids {
            if !self.catalog.validate_tag(id).await? {
                return Err(FleetError::invalid_reference("tag", id.as_str()));
            }
        }
        Ok(())
    }

    /// Registers an Agent or refreshes an existing endpoint.
    ///
    /// # Errors
    ///
    /// Returns `invalid_reference` for unknown capability or tag IDs and
    /// `invalid_input` when the agent_id is already bound to a different
    /// endpoint.
    #[instrument(skip(self, request), fields(agent_id = %request.agent_id))]
    pub async fn register(
        &self,
        request: RegisterRequest,
    ) -> FleetResult<(RegisterOutcome, Agent)> {
        self.validate_capabilities(&request.capabilities).await?;
        self.validate_tags(&request.tags).await?;

        let now = self.time.now();
        let capabilities: HashSet<CapabilityId> = request.capabilities.into_iter().collect();
        let tags: HashSet<TagId> = request.tags.into_iter().collect();

        if let Some(mut existing) = self
            .agents
            .get_by_hostname_port(request.hostname.as_str(), request.port.as_u16())
            .await?
        {
            // The endpoint identifies the row; its agent_id stays stable
            // across repeated registrations.
            existing.ip_address = request.ip_address;
            existing.version = request.version;
            existing.remark = request.remark;
            existing.capabilities = capabilities;
            existing.tags = tags;
            existing.updated_at = now;
            self.agents.update(&existing).await?;
            info!(agent_id = %existing.agent_id, "agent registration refreshed");
            return Ok((RegisterOutcome::Updated, existing));
        }

        if self.agents.get(&request.agent_id).await?.is_some() {
            return Err(FleetError::invalid_input(format!(
                "agent_id {} is already registered at a different endpoint",
                request.agent_id
            )));
        }

        let agent = Agent {
            agent_id: request.agent_id,
            hostname: request.hostname,
            port: request.port,
            ip_address: request.ip_address,
            version: request.version,
            remark: request.remark,
            status: AgentStatus::default(),
            capabilities,
            tags,
            last_heartbeat: None,
            created_at: now,
            updated_at: now,
        };
        self.agents.insert(&agent).await?;
        info!(agent_id = %agent.agent_id, hostname = %agent.hostname, "agent registered");
        Ok((RegisterOutcome::Created, agent))
    }

    /// Fetches one Agent joined with its snapshot
    ///
    /// # Errors
    ///
    /// Returns `not_found` for an unknown Agent.
    pub async fn get(&self, agent_id: &AgentKey) -> FleetResult<AgentWithMetrics> {
        let agent = self
            .agents
            .get(agent_id)
            .await?
            .ok_or_else(|| FleetError::not_found("agent", agent_id.as_str()))?;
        let metrics = self.metrics.get(agent_id).await?;
        Ok(AgentWithMetrics { agent, metrics })
    }

    /// Fetches one Agent by endpoint
    pub async fn get_by_hostname_port(
        &self,
        hostname: &str,
        port: u16,
    ) -> FleetResult<Option<Agent>> {
        self.agents.get_by_hostname_port(hostname, port).await
    }

    /// Paged, filtered listing joined with snapshots
    pub async fn list(
        &self,
        filter: &AgentListFilter,
        page: PageNumber,
        page_size: PageSize,
    ) -> FleetResult<PagedRows<AgentWithMetrics>> {
        let rows = self.agents.list(filter, page, page_size).await?;
        let ids: Vec<AgentKey> = rows.items.iter().map(|a| a.agent_id.clone()).collect();
        let snapshots = self.metrics.by_agent_ids(&ids).await?;
        let mut by_agent: std::collections::HashMap<AgentKey, MetricsSnapshot> = snapshots
            .into_iter()
            .map(|s| (s.agent_id.clone(), s))
            .collect();

        Ok(PagedRows {
            total: rows.total,
            items: rows
                .items
                .into_iter()
                .map(|agent| {
                    let metrics = by_agent.remove(&agent.agent_id);
                    AgentWithMetrics { agent, metrics }
                })
                .collect(),
        })
    }

    /// Adds a capability; adding one the Agent already holds is a no-op.
    #[instrument(skip(self), fields(agent_id = %agent_id, capability = %capability))]
    pub async fn add_capability(
        &self,
        agent_id: &AgentKey,
        capability: CapabilityId,
    ) -> FleetResult<()> {
        if !self.catalog.validate_capability(&capability).await? {
            return Err(FleetError::invalid_reference(
                "capability",
                capability.as_str(),
            ));
        }
        let mut agent = self
            .agents
            .get(agent_id)
            .await?
            .ok_or_else(|| FleetError::not_found("agent", agent_id.as_str()))?;
        if agent.capabilities.insert(capability) {
            self.agents
                .set_capabilities(agent_id, &agent.capabilities, self.time.now())
                .await?;
        }
        Ok(())
    }

    /// Removes a capability; removing an absent one is a no-op.
    #[instrument(skip(self), fields(agent_id = %agent_id, capability = %capability))]
    pub async fn remove_capability(
        &self,
        agent_id: &AgentKey,
        capability: &CapabilityId,
    ) -> FleetResult<()> {
        let mut agent = self
            .agents
            .get(agent_id)
            .await?
            .ok_or_else(|| FleetError::not_found("agent", agent_id.as_str()))?;
        if agent.capabilities.remove(capability) {
            self.agents
                .set_capabilities(agent_id, &agent.capabilities, self.time.now())
                .await?;
        }
        Ok(())
    }

    /// Adds a tag; idempotent like `add_capability`.
    #[instrument(skip(self), fields(agent_id = %agent_id, tag = %tag))]
    pub async fn add_tag(&self, agent_id: &AgentKey, tag: TagId) -> FleetResult<()> {
        if !self.catalog.validate_tag(&tag).await? {
            return Err(FleetError::invalid_reference("tag", tag.as_str()));
        }
        let mut agent = self
            .agents
            .get(agent_id)
            .await?
            .ok_or_else(|| FleetError::not_found("agent", agent_id.as_str()))?;
        if agent.tags.insert(tag) {
            self.agents
                .set_tags(agent_id, &agent.tags, self.time.now())
                .await?;
        }
        Ok(())
    }

    /// Removes a tag; removing an absent one is a no-op.
    #[instrument(skip(self), fields(agent_id = %agent_id, tag = %tag))]
    pub async fn remove_tag(&self, agent_id: &AgentKey, tag: &TagId) -> FleetResult<()> {
        let mut agent = self
            .agents
            .get(agent_id)
            .await?
            .ok_or_else(|| FleetError::not_found("agent", agent_id.as_str()))?;
        if agent.tags.remove(tag) {
            self.agents
                .set_tags(agent_id, &agent.tags, self.time.now())
                .await?;
        }
        Ok(())
    }

    /// Deletes an Agent, its snapshot, and fails its owned tasks.
    ///
    /// Ownership is a soft reference, so the cascade nulls owners here
    /// rather than relying on referential actions in storage.
    #[instrument(skip(self), fields(agent_id = %agent_id))]
    pub async fn delete(&self, agent_id: &AgentKey) -> FleetResult<()> {
        let now = self.time.now();
        if !self.agents.delete(agent_id).await? {
            return Err(FleetError::not_found("agent", agent_id.as_str()));
        }
        self.metrics.delete(agent_id).await?;
        let orphaned = self.tasks.fail_owned_by(agent_id, OWNER_LOST, now).await?;
        if orphaned > 0 {
            info!(agent_id = %agent_id, orphaned, "failed tasks of deleted agent");
        }
        Ok(())
    }
}
