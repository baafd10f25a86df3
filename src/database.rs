//! Embedded SQLite storage bootstrap
//!
//! Owns pool construction, connection pragmas, and the embedded migration
//! run. Every store in `crate::storage` borrows the pool from here; nothing
//! else opens connections.

use nutype::nutype;
use sqlx::{Pool, Sqlite, migrate::Migrator};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Static migrator for embedded `SQLite` migrations
static MIGRATOR: Migrator = sqlx::migrate!();

/// Database bootstrap errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Error from `SQLx`
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error while preparing the database location
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid database location
    #[error("invalid database path: {0}")]
    InvalidPath(String),

    /// Migration failure
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Database result type
pub type DatabaseResult<T> = Result<T, DatabaseError>;

#[nutype(
    validate(predicate = |path| !path.as_os_str().is_empty() && path.extension().is_some_and(|ext| ext == "db")),
    derive(Clone, Debug, Eq, PartialEq)
)]
pub struct DatabasePath(PathBuf);

impl DatabasePath {
    /// Create a new database path with validation
    ///
    /// # Errors
    ///
    /// Returns an error if the path is empty or lacks a `.db` extension.
    pub fn new<P: AsRef<Path>>(path: P) -> DatabaseResult<Self> {
        let path_buf = path.as_ref().to_path_buf();
        Self::try_new(path_buf).map_err(|_| {
            DatabaseError::InvalidPath(format!(
                "{} (must be a non-empty path ending in .db)",
                path.as_ref().display()
            ))
        })
    }

    /// Get the path as `PathBuf`
    pub fn as_path(&self) -> PathBuf {
        self.clone().into_inner()
    }

    /// Parent directory, if any, for file creation
    pub fn parent_directory(&self) -> Option<PathBuf> {
        self.as_path().parent().map(Path::to_path_buf)
    }
}

impl std::fmt::Display for DatabasePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_path().display())
    }
}

/// Database configuration with connection pool settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseConfig {
    path: DatabasePath,
    pool_size: u32,
    enable_wal_mode: bool,
}

impl DatabaseConfig {
    /// Create new database config with default settings
    pub fn new(path: DatabasePath) -> Self {
        Self {
            path,
            pool_size: 20,
            enable_wal_mode: true,
        }
    }

    /// Minimal settings for tests: one connection, no WAL
    pub fn for_testing(path: DatabasePath) -> Self {
        Self {
            path,
            pool_size: 1,
            enable_wal_mode: false,
        }
    }

    /// Builder: set connection pool size
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    /// Get the database path
    pub fn path(&self) -> &DatabasePath {
        &self.path
    }

    /// Get the connection pool size
    pub fn pool_size(&self) -> u32 {
        self.pool_size
    }
}

/// Database connection with managed pool
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: Pool<Sqlite>,
    config: DatabaseConfig,
}

impl DatabaseConnection {
    fn create_connect_options(config: &DatabaseConfig) -> sqlx::sqlite::SqliteConnectOptions {
        use sqlx::ConnectOptions;
        use sqlx::sqlite::SqliteConnectOptions;

        let mut options = SqliteConnectOptions::new()
            .filename(config.path().as_path())
            .create_if_missing(true)
            .pragma("foreign_keys", "ON")
            // busy_timeout turns writer contention into bounded lock waits
            // instead of immediate SQLITE_BUSY failures.
            .pragma("busy_timeout", "5000");

        if config.enable_wal_mode {
            options = options.pragma("journal_mode", "WAL");
        }

        options.disable_statement_logging()
    }

    /// Initialize the database: directory, pool, pragmas, migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if any step of initialization fails.
    pub async fn initialize(config: DatabaseConfig) -> DatabaseResult<Self> {
        if let Some(parent) = config.path().parent_directory() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(&parent).await?;
            }
        }

        let options = Self::create_connect_options(&config);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(config.pool_size())
            .connect_with(options)
            .await?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;

        info!(path = %config.path(), "running embedded migrations");
        MIGRATOR.run(&pool).await?;

        Ok(Self { pool, config })
    }

    /// Probe the connection with a trivial query.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe query fails.
    pub async fn ping(&self) -> DatabaseResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Access the connection pool
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Access the configuration
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }
}

/// Convenience: open a throwaway database for tests.
///
/// # Panics
///
/// Panics on any initialization failure; only for test use.
#[doc(hidden)]
pub async fn connect_for_testing(dir: &Path) -> DatabaseConnection {
    let path = DatabasePath::new(dir.join("test.db")).expect("valid test db path");
    DatabaseConnection::initialize(DatabaseConfig::for_testing(path))
        .await
        .expect("test database should initialize")
}
