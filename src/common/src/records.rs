//! Read-only access to the system-of-record's file rows.
//!
//! The whitelist oracle never writes these rows; it only reads a snapshot of
//! every non-deleted file (storage reference, content hash, size, thumbnail
//! references) through the [`RecordStore`] trait.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{PgPool, Row, SqlitePool, query};

/// A single legitimate file as known by the system-of-record.
///
/// `expected_hash` is `None` for legacy rows written before content hashes
/// were recorded; such files are accepted without a hash check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Storage reference used as the on-disk / object-key file id
    pub file_id: String,
    /// Hex-encoded sha256 of the encrypted content
    pub expected_hash: Option<String>,
    /// Size of the encrypted content in bytes
    pub expected_size: u64,
    /// Relative thumbnail paths derived from the row's thumbnail map
    pub thumbnail_paths: Vec<String>,
}

impl FileRecord {
    pub fn new(
        file_id: String,
        expected_hash: Option<String>,
        expected_size: u64,
        thumbnail_paths: Vec<String>,
    ) -> Result<Self> {
        if file_id.is_empty() {
            anyhow::bail!("file record has an empty storage reference");
        }
        Ok(Self {
            file_id,
            expected_hash: expected_hash.filter(|h| !h.is_empty()),
            expected_size,
            thumbnail_paths,
        })
    }
}

/// Read-only query surface over the system-of-record.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch every non-deleted file record.
    async fn fetch_file_records(&self) -> Result<Vec<FileRecord>>;
}

/// sqlx-backed record store (PostgreSQL or SQLite, selected by DSN).
#[derive(Clone)]
pub enum SqlRecordStore {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl SqlRecordStore {
    /// Connect to the system-of-record.
    pub async fn connect(dsn: &str) -> Result<Self, sqlx::Error> {
        log::info!("Connecting to system-of-record with DSN: {dsn}");

        let store = if dsn.starts_with("sqlite:") {
            let pool = SqlitePool::connect(dsn).await.map_err(|e| {
                log::error!("Failed to connect to SQLite database with DSN '{dsn}': {e}");
                e
            })?;
            SqlRecordStore::Sqlite(pool)
        } else {
            let pool = PgPool::connect(dsn).await.map_err(|e| {
                log::error!("Failed to connect to PostgreSQL database with DSN '{dsn}': {e}");
                e
            })?;
            SqlRecordStore::Postgres(pool)
        };

        Ok(store)
    }

    fn record_from_row(
        storage_ref: String,
        encrypted_hash: Option<String>,
        encrypted_size: i64,
        thumbnails_json: Option<String>,
    ) -> Result<FileRecord> {
        let thumbnail_paths = match thumbnails_json.as_deref() {
            Some(raw) if !raw.is_empty() => {
                // Thumbnail references are stored as a size-name -> path map
                let map: HashMap<String, String> = serde_json::from_str(raw)?;
                map.into_values().collect()
            }
            _ => Vec::new(),
        };

        FileRecord::new(
            storage_ref,
            encrypted_hash,
            encrypted_size.max(0) as u64,
            thumbnail_paths,
        )
    }
}

const SELECT_FILE_ROWS: &str = r#"
SELECT storage_ref, encrypted_hash, encrypted_size, thumbnails
FROM files
WHERE deleted_at IS NULL
"#;

#[async_trait]
impl RecordStore for SqlRecordStore {
    async fn fetch_file_records(&self) -> Result<Vec<FileRecord>> {
        let raw_rows: Vec<(String, Option<String>, i64, Option<String>)> = match self {
            SqlRecordStore::Postgres(pool) => {
                let rows = query(SELECT_FILE_ROWS).fetch_all(pool).await?;
                rows.iter()
                    .map(|row| {
                        (
                            row.get::<String, _>("storage_ref"),
                            row.get::<Option<String>, _>("encrypted_hash"),
                            row.get::<i64, _>("encrypted_size"),
                            row.get::<Option<String>, _>("thumbnails"),
                        )
                    })
                    .collect()
            }
            SqlRecordStore::Sqlite(pool) => {
                let rows = query(SELECT_FILE_ROWS).fetch_all(pool).await?;
                rows.iter()
                    .map(|row| {
                        (
                            row.get::<String, _>("storage_ref"),
                            row.get::<Option<String>, _>("encrypted_hash"),
                            row.get::<i64, _>("encrypted_size"),
                            row.get::<Option<String>, _>("thumbnails"),
                        )
                    })
                    .collect()
            }
        };

        let mut records = Vec::with_capacity(raw_rows.len());
        for (storage_ref, hash, size, thumbnails) in raw_rows {
            match Self::record_from_row(storage_ref, hash, size, thumbnails) {
                Ok(record) => records.push(record),
                Err(e) => {
                    // A malformed row must not poison the whole snapshot
                    tracing::warn!(error = %e, "Skipping malformed file row");
                }
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_record_rejects_empty_id() {
        let result = FileRecord::new(String::new(), None, 10, vec![]);
        assert!(result.is_err());
    }

    #[test]
    fn test_file_record_drops_empty_hash() {
        let record =
            FileRecord::new("f1".to_string(), Some(String::new()), 10, vec![]).unwrap();
        assert!(record.expected_hash.is_none());
    }

    #[test]
    fn test_record_from_row_parses_thumbnail_map() {
        let record = SqlRecordStore::record_from_row(
            "f1".to_string(),
            Some("abc".to_string()),
            42,
            Some(r#"{"small": "thumbnails/f1_small.enc", "large": "thumbnails/f1_large.enc"}"#.to_string()),
        )
        .unwrap();

        assert_eq!(record.expected_size, 42);
        assert_eq!(record.thumbnail_paths.len(), 2);
        assert!(
            record
                .thumbnail_paths
                .contains(&"thumbnails/f1_small.enc".to_string())
        );
    }

    #[test]
    fn test_record_from_row_clamps_negative_size() {
        let record =
            SqlRecordStore::record_from_row("f1".to_string(), None, -1, None).unwrap();
        assert_eq!(record.expected_size, 0);
    }

    #[tokio::test]
    async fn test_sqlite_store_roundtrip() {
        let store = SqlRecordStore::connect("sqlite::memory:").await.unwrap();

        let pool = match &store {
            SqlRecordStore::Sqlite(pool) => pool.clone(),
            _ => unreachable!(),
        };
        query(
            r#"CREATE TABLE files (
                id INTEGER PRIMARY KEY,
                storage_ref TEXT NOT NULL,
                encrypted_hash TEXT,
                encrypted_size INTEGER NOT NULL,
                thumbnails TEXT,
                deleted_at TEXT
            )"#,
        )
        .execute(&pool)
        .await
        .unwrap();
        query(
            "INSERT INTO files (storage_ref, encrypted_hash, encrypted_size, thumbnails, deleted_at)
             VALUES ('f1', 'aa', 3, NULL, NULL),
                    ('f2', NULL, 5, '{\"small\": \"thumbnails/f2_s.enc\"}', NULL),
                    ('gone', 'bb', 9, NULL, '2026-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let mut records = store.fetch_file_records().await.unwrap();
        records.sort_by(|a, b| a.file_id.cmp(&b.file_id));

        assert_eq!(records.len(), 2, "deleted rows are excluded");
        assert_eq!(records[0].file_id, "f1");
        assert_eq!(records[0].expected_hash.as_deref(), Some("aa"));
        assert_eq!(records[1].file_id, "f2");
        assert!(records[1].expected_hash.is_none());
        assert_eq!(records[1].thumbnail_paths, vec!["thumbnails/f2_s.enc"]);
    }
}
