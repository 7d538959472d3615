use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

/// Database pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(n) = std::env::var("DB_MAX_CONNECTIONS").map(|v| v.parse()) {
            if let Ok(n) = n {
                config.max_connections = n;
            }
        }
        if let Ok(n) = std::env::var("DB_MIN_CONNECTIONS").map(|v| v.parse()) {
            if let Ok(n) = n {
                config.min_connections = n;
            }
        }
        if let Ok(n) = std::env::var("DB_ACQUIRE_TIMEOUT").map(|v| v.parse()) {
            if let Ok(n) = n {
                config.acquire_timeout = Duration::from_secs(n);
            }
        }

        config
    }
}

/// Create the document-store connection pool. Failure here is fatal: the
/// bridge does not run without its store.
pub async fn create_pool(database_url: &str) -> CoreResult<PgPool> {
    let config = PoolConfig::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .test_before_acquire(true)
        .connect(database_url)
        .await
        .map_err(|e| CoreError::Fatal(format!("document store unreachable: {}", e)))?;

    tracing::info!(
        max = config.max_connections,
        min = config.min_connections,
        "document store pool created"
    );

    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> CoreResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| CoreError::Fatal(format!("migration failed: {}", e)))?;
    tracing::info!("store migrations completed");
    Ok(())
}

/// Check store health
pub async fn health_check(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}

#[derive(Debug, serde::Serialize)]
pub struct PoolStats {
    pub size: u32,
    pub idle: u32,
    pub in_use: u32,
}

pub fn get_pool_stats(pool: &PgPool) -> PoolStats {
    PoolStats {
        size: pool.size(),
        idle: pool.num_idle() as u32,
        in_use: pool.size() - pool.num_idle() as u32,
    }
}
