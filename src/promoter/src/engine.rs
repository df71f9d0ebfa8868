//! Atomic single-file promotion from the ephemeral to the durable tier.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use common::FileWhitelist;
use common::storage::{PROMOTE_TMP_PREFIX, tier_file_path};
use common::whitelist::ValidationError;

/// Why a single promotion failed.
#[derive(Debug, Error)]
pub enum PromoteError {
    #[error("source file not found: {}", .0.display())]
    NotFound(PathBuf),
    /// The file failed whitelist validation and was deleted.
    #[error(transparent)]
    Rejected(#[from] ValidationError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result of a successful promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// The file was copied and renamed into the durable tier.
    Promoted,
    /// A destination at least as fresh as the source already exists; no I/O
    /// was performed.
    AlreadyPromoted,
}

/// Aggregated result of a batch of promotions.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub promoted: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Validates files against the whitelist oracle and copies them atomically
/// into a durable tier root.
pub struct PromotionEngine {
    whitelist: Arc<FileWhitelist>,
}

impl PromotionEngine {
    pub fn new(whitelist: Arc<FileWhitelist>) -> Self {
        Self { whitelist }
    }

    pub fn whitelist(&self) -> &Arc<FileWhitelist> {
        &self.whitelist
    }

    /// Promote one file from `source_path` into `<target_root>/files/`.
    ///
    /// The whitelist is reloaded first so that files whose rows were inserted
    /// moments earlier by the upload path are visible. A file that fails
    /// validation is deleted immediately and never promoted. The durable
    /// write is staged to a temp file in the destination directory, the
    /// staged bytes are re-validated, and only then is the temp file renamed
    /// onto the final path, so readers never observe a partial write.
    pub async fn promote(
        &self,
        file_id: &str,
        source_path: &Path,
        target_root: &Path,
    ) -> Result<PromoteOutcome, PromoteError> {
        if !source_path.is_file() {
            return Err(PromoteError::NotFound(source_path.to_path_buf()));
        }

        self.whitelist.reload().await;

        let content = fs::read(source_path)?;
        if let Err(reason) = self.whitelist.validate(file_id, &content) {
            // Fail closed: an invalid file must never linger in any tier
            if let Err(e) = fs::remove_file(source_path) {
                tracing::warn!(
                    file_id = %file_id,
                    error = %e,
                    "Failed to delete rejected source file"
                );
            }
            tracing::warn!(
                file_id = %file_id,
                reason = %reason,
                "Rejected promotion of invalid file, source deleted"
            );
            return Err(PromoteError::Rejected(reason));
        }

        let destination = tier_file_path(target_root, file_id);
        let dest_dir = destination
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| target_root.to_path_buf());
        fs::create_dir_all(&dest_dir)?;

        if destination.is_file() && !is_older(&destination, source_path)? {
            tracing::debug!(file_id = %file_id, "Destination already current, skipping copy");
            return Ok(PromoteOutcome::AlreadyPromoted);
        }

        // Staged in the destination directory so the rename stays on one
        // filesystem and is atomic.
        let staging = dest_dir.join(format!(
            "{PROMOTE_TMP_PREFIX}{}.tmp",
            Uuid::new_v4().simple()
        ));

        let result = self.stage_and_rename(file_id, source_path, &staging, &destination);
        if result.is_err() {
            let _ = fs::remove_file(&staging);
        } else {
            tracing::info!(
                file_id = %file_id,
                destination = %destination.display(),
                "Promoted file to durable tier"
            );
        }
        result
    }

    fn stage_and_rename(
        &self,
        file_id: &str,
        source: &Path,
        staging: &Path,
        destination: &Path,
    ) -> Result<PromoteOutcome, PromoteError> {
        // fs::copy carries permissions along with the bytes
        fs::copy(source, staging)?;

        // The source can change between the first validation and the copy;
        // only the staged bytes are trusted.
        let staged = fs::read(staging)?;
        self.whitelist.validate(file_id, &staged)?;

        fs::rename(staging, destination)?;
        Ok(PromoteOutcome::Promoted)
    }

    /// Promote a set of files by id, isolating per-item failures.
    pub async fn promote_batch(
        &self,
        file_ids: &[String],
        source_root: &Path,
        target_root: &Path,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        for file_id in file_ids {
            let source = tier_file_path(source_root, file_id);
            match self.promote(file_id, &source, target_root).await {
                Ok(_) => outcome.promoted += 1,
                Err(e) => {
                    outcome.failed += 1;
                    outcome.errors.push(format!("{file_id}: {e}"));
                    tracing::warn!(file_id = %file_id, error = %e, "Batch item failed");
                }
            }
        }

        tracing::info!(
            promoted = outcome.promoted,
            failed = outcome.failed,
            "Batch promotion complete"
        );
        outcome
    }
}

/// Whether `path` is older (by mtime) than `reference`.
fn is_older(path: &Path, reference: &Path) -> std::io::Result<bool> {
    let path_mtime = fs::metadata(path)?.modified()?;
    let reference_mtime = fs::metadata(reference)?.modified()?;
    Ok(path_mtime < reference_mtime)
}
