//! In-memory whitelist of legitimate files.
//!
//! The whitelist is the sole basis for deciding that a file found in any
//! storage tier is legitimate. It is a point-in-time snapshot of the
//! system-of-record: lazily loaded, explicitly reloadable, and fully replaced
//! on each reload so readers never observe a partial update.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::records::{FileRecord, RecordStore};

/// Why a file failed whitelist validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("file '{0}' not found in whitelist")]
    UnknownFile(String),
    #[error("file '{file_id}' hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        file_id: String,
        expected: String,
        actual: String,
    },
    #[error("file '{file_id}' size mismatch: expected {expected}, got {actual}")]
    SizeMismatch {
        file_id: String,
        expected: u64,
        actual: u64,
    },
    #[error("thumbnail '{0}' not found in whitelist")]
    UnknownThumbnail(String),
}

#[derive(Debug, Default)]
struct Snapshot {
    records: HashMap<String, FileRecord>,
    thumbnails: HashSet<String>,
}

/// Whitelist oracle over an injected [`RecordStore`].
pub struct FileWhitelist {
    store: Arc<dyn RecordStore>,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
}

impl FileWhitelist {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(None),
        }
    }

    /// Load the whitelist if it has not been loaded yet.
    pub async fn load(&self) {
        let loaded = self
            .snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some();
        if !loaded {
            self.reload().await;
        }
    }

    /// Discard any cached snapshot and fetch a fresh one.
    ///
    /// If the backing store is unreachable an empty snapshot is installed so
    /// that dependent sweeps degrade to rejecting everything rather than
    /// crashing.
    pub async fn reload(&self) {
        let snapshot = match self.store.fetch_file_records().await {
            Ok(records) => {
                let mut map = HashMap::with_capacity(records.len());
                let mut thumbnails = HashSet::new();
                for record in records {
                    for path in &record.thumbnail_paths {
                        thumbnails.insert(normalize_thumbnail_path(path));
                    }
                    map.insert(record.file_id.clone(), record);
                }
                tracing::debug!(
                    files = map.len(),
                    thumbnails = thumbnails.len(),
                    "Loaded whitelist snapshot"
                );
                Snapshot {
                    records: map,
                    thumbnails,
                }
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Failed to load whitelist from system-of-record, using empty snapshot"
                );
                Snapshot::default()
            }
        };

        *self
            .snapshot
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(snapshot));
    }

    fn current(&self) -> Option<Arc<Snapshot>> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Look up the whitelist record for a file id in the current snapshot.
    pub fn record(&self, file_id: &str) -> Option<FileRecord> {
        self.current()
            .and_then(|s| s.records.get(file_id).cloned())
    }

    /// Number of files in the current snapshot (0 when unloaded).
    pub fn len(&self) -> usize {
        self.current().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check a file's content against its whitelist record.
    ///
    /// A file passes only if its id is a known key, the sha256 of `content`
    /// matches the recorded hash, and the length matches the recorded size.
    /// Records without a hash are accepted on size alone.
    pub fn validate(&self, file_id: &str, content: &[u8]) -> Result<(), ValidationError> {
        let snapshot = self
            .current()
            .ok_or_else(|| ValidationError::UnknownFile(file_id.to_string()))?;

        let record = snapshot
            .records
            .get(file_id)
            .ok_or_else(|| ValidationError::UnknownFile(file_id.to_string()))?;

        if content.len() as u64 != record.expected_size {
            return Err(ValidationError::SizeMismatch {
                file_id: file_id.to_string(),
                expected: record.expected_size,
                actual: content.len() as u64,
            });
        }

        match &record.expected_hash {
            Some(expected) => {
                let actual = sha256_hex(content);
                if &actual != expected {
                    return Err(ValidationError::HashMismatch {
                        file_id: file_id.to_string(),
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
            None => {
                tracing::warn!(
                    file_id = %file_id,
                    "Whitelist record has no content hash, accepting on size alone"
                );
            }
        }

        Ok(())
    }

    /// Check a thumbnail path for whitelist membership.
    ///
    /// Thumbnails are derived data, so there is no hash check.
    pub fn validate_thumbnail(&self, path: &str) -> Result<(), ValidationError> {
        let normalized = normalize_thumbnail_path(path);
        let snapshot = self
            .current()
            .ok_or_else(|| ValidationError::UnknownThumbnail(normalized.clone()))?;

        if snapshot.thumbnails.contains(&normalized) {
            Ok(())
        } else {
            Err(ValidationError::UnknownThumbnail(normalized))
        }
    }
}

/// Normalize a thumbnail reference to its tier-relative form.
///
/// Separators are normalized to `/`, leading `./` and `/` are stripped, and
/// any tier-root prefix before the `thumbnails/` component is dropped so the
/// same path compares equal regardless of which tier it was observed in.
pub fn normalize_thumbnail_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let trimmed = unified
        .trim_start_matches("./")
        .trim_start_matches('/');

    match trimmed.find("thumbnails/") {
        Some(idx) => trimmed[idx..].to_string(),
        None => trimmed.to_string(),
    }
}

/// Hex-encoded sha256 of a byte slice.
pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}
