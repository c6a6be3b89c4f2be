//! # Database
//!
//! Connection pool construction and the embedded schema migrator.
//!
//! ```rust,ignore
//! #[sqlx::test(migrator = "pod_provisioner::database::MIGRATOR")]
//! async fn test_something(pool: PgPool) { /* ... */ }
//! ```

use crate::config::DatabaseConfig;
use crate::error::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// All migrations under `migrations/`, embedded at compile time.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Build a connection pool from configuration
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout())
        .connect(&config.url)
        .await?;

    info!(
        max_connections = config.max_connections,
        "🗄️ DATABASE: Connection pool established"
    );
    Ok(pool)
}

/// Apply pending migrations
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    info!("Running provisioning schema migrations");
    MIGRATOR.run(pool).await?;
    info!("Migrations complete");
    Ok(())
}

/// Round-trip a trivial query
pub async fn health_check(pool: &PgPool) -> Result<bool> {
    let (one,): (i32,) = sqlx::query_as("SELECT 1").fetch_one(pool).await?;
    Ok(one == 1)
}
