pub mod cache_cards;
pub mod cards;
pub mod error;
pub mod hydrator;
pub mod kyc;
pub mod migrations;
pub mod notifications;
pub mod store;
pub mod tokens;
pub mod transactions;
pub mod users;

use sqlx::any::{install_default_drivers, AnyPoolOptions};
use sqlx::AnyPool;
use std::time::Duration;
use tracing::{info, warn};

use self::error::{StoreError, StoreResult};
use crate::config::DatabaseConfig;

pub use self::store::Store;

/// SQL dialect behind the pool, detected from the connection URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(Dialect::Postgres)
        } else if url.starts_with("sqlite:") {
            Some(Dialect::Sqlite)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
        }
    }
}

/// Database pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 1,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// Initialize the connection pool for either supported dialect
pub async fn init_pool(
    database_url: &str,
    config: Option<PoolConfig>,
) -> StoreResult<(AnyPool, Dialect)> {
    let config = config.unwrap_or_default();
    let dialect = Dialect::from_url(database_url).ok_or_else(|| {
        StoreError::invalid_input("DATABASE_URL must start with postgres://, postgresql:// or sqlite:")
    })?;

    install_default_drivers();

    info!(
        dialect = dialect.as_str(),
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        connection_timeout = ?config.connection_timeout,
        "Initializing database pool"
    );

    let pool = AnyPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connection_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .connect(database_url)
        .await
        .map_err(StoreError::from_sqlx)?;

    health_check(&pool).await?;

    info!(dialect = dialect.as_str(), "Database pool initialized successfully");
    Ok((pool, dialect))
}

/// Initialize the pool from application configuration
pub async fn init_pool_from_config(config: &DatabaseConfig) -> StoreResult<(AnyPool, Dialect)> {
    let pool_config = PoolConfig {
        max_connections: config.max_connections,
        min_connections: config.min_connections,
        connection_timeout: Duration::from_secs(config.connection_timeout),
        idle_timeout: Duration::from_secs(config.idle_timeout.unwrap_or(600)),
        max_lifetime: Duration::from_secs(1800),
    };

    init_pool(&config.url, Some(pool_config)).await
}

/// Connection pool health check
pub async fn health_check(pool: &AnyPool) -> StoreResult<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(|e| {
            warn!("Health check failed: {}", e);
            StoreError::from_sqlx(e)
        })?;

    Ok(())
}
