//! # docket-db
//!
//! SQLite job store for docket.
//!
//! This crate provides:
//! - Connection pool management (WAL mode, busy timeout)
//! - Embedded schema migrations
//! - [`SqliteJobRepository`], the durable implementation of [`JobRepository`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use docket_db::{Database, JobRepository};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("sqlite://docket.db").await?;
//!     db.migrate().await?;
//!
//!     let mut payload = docket_db::Document::new();
//!     payload.insert("n".into(), 3.into());
//!     let job_id = db.jobs.submit("double", payload, 0).await?;
//!
//!     println!("Submitted job: {}", job_id);
//!     Ok(())
//! }
//! ```

pub mod jobs;
pub mod pool;

// Re-export core types
pub use docket_core::*;

pub use jobs::SqliteJobRepository;
pub use pool::{
    create_pool, create_pool_with_config, is_memory_url, log_pool_metrics, PoolConfig,
};

/// Combined database context.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::SqlitePool,
    /// Job repository for background processing.
    pub jobs: SqliteJobRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self {
            jobs: SqliteJobRepository::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::SqlitePool {
        &self.pool
    }

    /// Close all pooled connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
