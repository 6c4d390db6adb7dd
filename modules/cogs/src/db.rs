use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Initialize a connection pool to the PostgreSQL database.
///
/// Connection limits are env-tunable so test runs can cap them
/// (`DB_MAX_CONNECTIONS=1`) without touching production defaults.
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let max_connections = std::env::var("DB_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(10);

    let acquire_timeout_secs = std::env::var("DB_ACQUIRE_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(3);

    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(acquire_timeout_secs))
        .connect(database_url)
        .await
}

/// Apply the schema migrations under `db/migrations`.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./db/migrations").run(pool).await
}
