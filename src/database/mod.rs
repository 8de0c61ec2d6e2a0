use crate::errors::{DbError, DbResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

/// SQLite connection handling for the local store.
///
/// WAL journaling plus NORMAL synchronous gives crash safety for committed
/// transactions without paying a full fsync per statement.
pub struct DbConnection;

impl DbConnection {
    /// Open (creating if needed) the database at `db_path`.
    pub async fn open(db_path: &str) -> DbResult<SqlitePool> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path))
            .map_err(|e| DbError::ConnectionPool(format!("Invalid database path: {}", e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        Self::build_pool(options).await
    }

    /// Open an in-memory database (used by tests).
    pub async fn open_in_memory() -> DbResult<SqlitePool> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| DbError::ConnectionPool(e.to_string()))?
            .foreign_keys(true);

        // A single connection so every handle sees the same in-memory db.
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| DbError::ConnectionPool(format!("Failed to open in-memory db: {}", e)))
    }

    async fn build_pool(options: SqliteConnectOptions) -> DbResult<SqlitePool> {
        SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| DbError::ConnectionPool(format!("Failed to open database: {}", e)))
    }
}
