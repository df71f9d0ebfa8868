//! Test doubles shared across crates.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::records::{FileRecord, RecordStore};

/// Record store backed by an in-memory vector, optionally failing every
/// fetch to exercise degraded-oracle paths.
pub struct StaticRecordStore {
    records: Mutex<Vec<FileRecord>>,
    failure: Option<String>,
}

impl StaticRecordStore {
    pub fn new(records: Vec<FileRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            failure: None,
        }
    }

    /// A store whose every fetch fails with the given message.
    pub fn failing(message: &str) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            failure: Some(message.to_string()),
        }
    }

    /// Add a record; visible to callers only after the next reload.
    pub fn push(&self, record: FileRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }
}

#[async_trait]
impl RecordStore for StaticRecordStore {
    async fn fetch_file_records(&self) -> Result<Vec<FileRecord>> {
        if let Some(message) = &self.failure {
            anyhow::bail!("{message}");
        }
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}

/// Build a whitelisted record for arbitrary content.
pub fn whitelisted_record(file_id: &str, content: &[u8]) -> FileRecord {
    FileRecord {
        file_id: file_id.to_string(),
        expected_hash: Some(crate::whitelist::sha256_hex(content)),
        expected_size: content.len() as u64,
        thumbnail_paths: Vec::new(),
    }
}
