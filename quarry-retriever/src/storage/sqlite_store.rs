//! SQLite implementation of [`DocumentStore`].
//!
//! ```sql
//! CREATE TABLE documents (
//!     external_id    TEXT PRIMARY KEY,
//!     source_id      TEXT NOT NULL,
//!     sequence_index INTEGER NOT NULL,
//!     char_start     INTEGER NOT NULL,
//!     char_end       INTEGER NOT NULL,
//!     text           TEXT NOT NULL
//! );
//! CREATE TABLE store_metadata (
//!     key   TEXT PRIMARY KEY,
//!     value TEXT NOT NULL
//! );
//! ```

use super::{DocumentEntry, DocumentLookup, DocumentStore, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// SQLite limits the number of bound parameters per statement.
const MAX_IDS_PER_QUERY: usize = 500;

const EMBEDDING_MODEL_KEY: &str = "embedding_model";

/// Document store persisted in a single SQLite file.
#[derive(Clone, Debug)]
pub struct SqliteDocumentStore {
    path: Option<PathBuf>,
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    /// Opens (creating if needed) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(path)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .create_if_missing(true),
        )
        .await?;

        tracing::debug!("Opened document store at {}", path.display());
        Self::new_with_pool(Some(path.to_path_buf()), pool).await
    }

    /// Opens a private in-memory database, mainly for tests.
    pub async fn open_memory() -> Result<Self> {
        // Every connection to :memory: is a separate database, so keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::new_with_pool(None, pool).await
    }

    async fn new_with_pool(path: Option<PathBuf>, pool: SqlitePool) -> Result<Self> {
        Self::create_tables(&pool).await?;
        Ok(Self { path, pool })
    }

    /// Database file, or `None` for an in-memory store
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn create_tables(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                external_id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                sequence_index INTEGER NOT NULL,
                char_start INTEGER NOT NULL,
                char_end INTEGER NOT NULL,
                text TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source_id, sequence_index)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS store_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    fn row_to_entry(row: &SqliteRow) -> DocumentEntry {
        let sequence_index: i64 = row.get("sequence_index");
        let char_start: i64 = row.get("char_start");
        let char_end: i64 = row.get("char_end");
        DocumentEntry {
            external_id: row.get("external_id"),
            text: row.get("text"),
            source_id: row.get("source_id"),
            sequence_index: sequence_index as usize,
            char_start: char_start as usize,
            char_end: char_end as usize,
        }
    }

    fn placeholders(count: usize) -> String {
        vec!["?"; count].join(", ")
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn put_many(&self, entries: Vec<DocumentEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        for entry in &entries {
            sqlx::query(
                r#"
                INSERT INTO documents (external_id, source_id, sequence_index, char_start, char_end, text)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(external_id) DO UPDATE SET
                    source_id = excluded.source_id,
                    sequence_index = excluded.sequence_index,
                    char_start = excluded.char_start,
                    char_end = excluded.char_end,
                    text = excluded.text
                "#,
            )
            .bind(&entry.external_id)
            .bind(&entry.source_id)
            .bind(entry.sequence_index as i64)
            .bind(entry.char_start as i64)
            .bind(entry.char_end as i64)
            .bind(&entry.text)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::debug!("Stored {} document entries", entries.len());
        Ok(())
    }

    async fn get(&self, external_id: &str) -> Result<Option<DocumentEntry>> {
        let row = sqlx::query(
            "SELECT external_id, source_id, sequence_index, char_start, char_end, text FROM documents WHERE external_id = ?1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::row_to_entry))
    }

    async fn get_many(&self, external_ids: &[String]) -> Result<DocumentLookup> {
        let mut found: HashMap<String, DocumentEntry> = HashMap::new();

        for ids in external_ids.chunks(MAX_IDS_PER_QUERY) {
            let sql = format!(
                "SELECT external_id, source_id, sequence_index, char_start, char_end, text FROM documents WHERE external_id IN ({})",
                Self::placeholders(ids.len())
            );
            let mut query = sqlx::query(&sql);
            for id in ids {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await? {
                let entry = Self::row_to_entry(&row);
                found.insert(entry.external_id.clone(), entry);
            }
        }

        let missing = external_ids
            .iter()
            .filter(|id| !found.contains_key(id.as_str()))
            .cloned()
            .collect();

        Ok(DocumentLookup { found, missing })
    }

    async fn delete_many(&self, external_ids: &[String]) -> Result<usize> {
        let mut deleted = 0;
        let mut tx = self.pool.begin().await?;

        for ids in external_ids.chunks(MAX_IDS_PER_QUERY) {
            let sql = format!(
                "DELETE FROM documents WHERE external_id IN ({})",
                Self::placeholders(ids.len())
            );
            let mut query = sqlx::query(&sql);
            for id in ids {
                query = query.bind(id);
            }
            deleted += query.execute(&mut *tx).await?.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(deleted)
    }

    async fn delete_source_from(
        &self,
        source_id: &str,
        first_stale_sequence: usize,
    ) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        let stale: Vec<String> = sqlx::query(
            "SELECT external_id FROM documents WHERE source_id = ?1 AND sequence_index >= ?2 ORDER BY sequence_index",
        )
        .bind(source_id)
        .bind(first_stale_sequence as i64)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| row.get("external_id"))
        .collect();

        if !stale.is_empty() {
            sqlx::query("DELETE FROM documents WHERE source_id = ?1 AND sequence_index >= ?2")
                .bind(source_id)
                .bind(first_stale_sequence as i64)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(stale)
    }

    async fn source_ids(&self, source_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT external_id FROM documents WHERE source_id = ?1 ORDER BY sequence_index",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("external_id")).collect())
    }

    async fn count(&self) -> Result<usize> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM documents")
            .fetch_one(&self.pool)
            .await?
            .get("count");
        Ok(count as usize)
    }

    async fn embedding_model(&self) -> Result<Option<String>> {
        let value = sqlx::query("SELECT value FROM store_metadata WHERE key = ?1")
            .bind(EMBEDDING_MODEL_KEY)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.get("value"));
        Ok(value)
    }

    async fn set_embedding_model(&self, model_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO store_metadata (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(EMBEDDING_MODEL_KEY)
        .bind(model_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
