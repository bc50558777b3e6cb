//! Schema management: base migrations plus additive column upgrades.
//!
//! The base schema comes from `sqlx::migrate!`. Columns that arrived after
//! the first deployments (`binary_data_base64`, `content_sha256`,
//! `size_bytes`) are added by idempotent `ALTER TABLE` statements so the
//! engine can open databases created before they existed. Both passes run
//! once per process start.

use rocket_db_pools::sqlx::{self, Row, SqlitePool};
use std::collections::{HashMap, HashSet};

use super::StoreError;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Run base migrations, the additive column upgrade pass, and the hash
/// indexes.
///
/// Databases that accumulated hash duplicates before the unique index
/// existed must run the attachment cleanup between the column upgrades and
/// [`ensure_hash_indexes`]; the boot fairing does exactly that.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
    log::info!("running database migrations");

    MIGRATOR
        .run(pool)
        .await
        .map_err(|err| StoreError::Integrity(format!("migration failed: {err}")))?;

    apply_column_upgrades(pool).await?;

    log::info!("database migrations completed");
    Ok(())
}

/// Additive, idempotent ALTERs for late columns.
/// "duplicate column name" is the expected error when already applied.
pub async fn apply_column_upgrades(pool: &SqlitePool) -> Result<(), StoreError> {
    let mut cache = ColumnCache::load(pool, &["attachments"]).await?;

    let alters = [
        ("attachments", "binary_data_base64", "ALTER TABLE attachments ADD COLUMN binary_data_base64 TEXT"),
        ("attachments", "content_sha256", "ALTER TABLE attachments ADD COLUMN content_sha256 TEXT"),
        ("attachments", "size_bytes", "ALTER TABLE attachments ADD COLUMN size_bytes INTEGER"),
    ];

    for (table, column, ddl) in alters {
        if cache.has_column(table, column) {
            continue;
        }
        match sqlx::query(ddl).execute(pool).await {
            Ok(_) => cache.insert(table, column),
            Err(err) if err.to_string().contains("duplicate column") => {
                cache.insert(table, column);
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

/// Unique indexes backing the dedup contract: one global per content hash,
/// one per (message, filename, mime, hash). Partial so NULL-hash legacy rows
/// do not collide. Must run after duplicate cleanup on legacy databases.
pub async fn ensure_hash_indexes(pool: &SqlitePool) -> Result<(), StoreError> {
    let indexes = [
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_attachments_content_sha
             ON attachments (content_sha256)
             WHERE content_sha256 IS NOT NULL",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_attachments_message_file
             ON attachments (message_id, filename, mime_type, content_sha256)",
    ];
    for ddl in indexes {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

/// Table → column-set cache built from `PRAGMA table_info`, so feature
/// detection does not re-query the schema on every check.
#[derive(Debug, Default)]
pub struct ColumnCache {
    columns: HashMap<String, HashSet<String>>,
}

impl ColumnCache {
    pub async fn load(pool: &SqlitePool, tables: &[&str]) -> Result<Self, StoreError> {
        let mut cache = ColumnCache::default();
        for table in tables {
            let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
                .fetch_all(pool)
                .await?;
            let names: HashSet<String> = rows
                .iter()
                .map(|row| row.get::<String, _>("name"))
                .collect();
            cache.columns.insert(table.to_string(), names);
        }
        Ok(cache)
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.columns
            .get(table)
            .map(|cols| cols.contains(column))
            .unwrap_or(false)
    }

    fn insert(&mut self, table: &str, column: &str) {
        self.columns
            .entry(table.to_string())
            .or_default()
            .insert(column.to_string());
    }
}
