use crate::errors::{DbError, DbResult};
use sqlx::SqlitePool;

// Embed all migration SQL files at compile time
const MIGRATION_PHOTOS: &str = include_str!("../migrations/20250601000000_photos.sql");
const MIGRATION_SYNC_QUEUE: &str = include_str!("../migrations/20250601000001_sync_queue.sql");
const MIGRATION_SYNC_CONFLICTS: &str = include_str!("../migrations/20250601000002_sync_conflicts.sql");

// List of migrations with their names and SQL content
const MIGRATIONS: &[(&str, &str)] = &[
    ("20250601000000_photos.sql", MIGRATION_PHOTOS),
    ("20250601000001_sync_queue.sql", MIGRATION_SYNC_QUEUE),
    ("20250601000002_sync_conflicts.sql", MIGRATION_SYNC_CONFLICTS),
];

/// Initialize the database schema, applying any migrations not yet recorded
/// in the `migrations` table.
pub async fn initialize_database(pool: &SqlitePool) -> DbResult<()> {
    create_migrations_table(pool).await?;

    let applied = applied_migrations(pool).await?;

    let pending: Vec<&(&str, &str)> = MIGRATIONS
        .iter()
        .filter(|(name, _)| !applied.iter().any(|a| a == name))
        .collect();

    if pending.is_empty() {
        log::debug!("No pending migrations");
        return Ok(());
    }

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| DbError::Transaction(format!("Failed to begin migration transaction: {}", e)))?;

    for (name, sql) in pending {
        log::info!("Applying migration: {}", name);

        sqlx::raw_sql(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| DbError::Migration(format!("Failed to apply {}: {}", name, e)))?;

        sqlx::query("INSERT INTO migrations (name, applied_at) VALUES (?, datetime('now'))")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(|e| DbError::Migration(format!("Failed to record {}: {}", name, e)))?;
    }

    tx.commit()
        .await
        .map_err(|e| DbError::Transaction(format!("Failed to commit migrations: {}", e)))?;

    Ok(())
}

async fn create_migrations_table(pool: &SqlitePool) -> DbResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| DbError::Migration(format!("Failed to create migrations table: {}", e)))?;

    Ok(())
}

async fn applied_migrations(pool: &SqlitePool) -> DbResult<Vec<String>> {
    sqlx::query_scalar::<_, String>("SELECT name FROM migrations ORDER BY id ASC")
        .fetch_all(pool)
        .await
        .map_err(|e| DbError::Migration(format!("Failed to read applied migrations: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DbConnection;

    #[tokio::test]
    async fn migrations_apply_once() {
        let pool = DbConnection::open_in_memory().await.unwrap();
        initialize_database(&pool).await.unwrap();
        // Second run is a no-op
        initialize_database(&pool).await.unwrap();

        let applied = applied_migrations(&pool).await.unwrap();
        assert_eq!(applied.len(), MIGRATIONS.len());
    }
}
