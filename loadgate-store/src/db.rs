use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

/// Open the relational pool. WAL keeps readers off the writer's lock,
/// which matters because the log consumer writes batches while the
/// proxy path reads stat rows.
pub async fn connect(dsn: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(dsn)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect_with(options)
        .await?;

    info!(dsn, "Database pool ready");
    Ok(pool)
}

/// Apply embedded migrations. Master-only at startup.
pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied");
    Ok(())
}

/// In-memory database for tests.
#[doc(hidden)]
pub async fn connect_ephemeral() -> anyhow::Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}
