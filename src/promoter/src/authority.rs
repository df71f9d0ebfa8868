//! Promote-files RPC between a rotating node and its Promotion Authority.
//!
//! Both sides derive the same bearer token from a shared secret, so no token
//! ever travels out-of-band:
//! `hex(HMAC_SHA256(shared_secret, "promote-files-token-context"))`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    routing::post,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use common::config::PromoterConfig;

use crate::batch::PromotionTask;
use crate::engine::{PromoteError, PromotionEngine};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_CONTEXT: &[u8] = b"promote-files-token-context";
const PROMOTE_FILES_PATH: &str = "/api/promote-files";

/// Derive the promote-files bearer token from the shared secret.
pub fn derive_promotion_token(shared_secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(shared_secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(TOKEN_CONTEXT);
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PromoteFileEntry {
    pub file_id: String,
    /// Base64-encoded encrypted payload
    pub file_data: String,
    pub expected_hash: Option<String>,
    pub expected_size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PromoteFilesRequest {
    pub files: Vec<PromoteFileEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PromoteFilesResponse {
    pub promoted: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Client side of the promote-files RPC.
pub struct AuthorityClient {
    http: reqwest::Client,
    base_url: String,
    shared_secret: Option<String>,
}

impl AuthorityClient {
    pub fn new(config: &PromoterConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build authority HTTP client")?;
        Ok(Self {
            http,
            base_url: config.authority_url.trim_end_matches('/').to_string(),
            shared_secret: config.shared_secret.clone(),
        })
    }

    /// Whether a shared secret is configured; without one no authority call
    /// can be authenticated.
    pub fn has_shared_secret(&self) -> bool {
        self.shared_secret.is_some()
    }

    /// Forward one batch of promotion tasks. A non-200 response is a total
    /// batch failure with no partial credit.
    pub async fn promote_files(&self, tasks: &[PromotionTask]) -> Result<PromoteFilesResponse> {
        let secret = self
            .shared_secret
            .as_deref()
            .context("promoter.shared_secret is not configured")?;

        let request = PromoteFilesRequest {
            files: tasks
                .iter()
                .map(|task| PromoteFileEntry {
                    file_id: task.file_id.clone(),
                    file_data: BASE64.encode(&task.payload),
                    expected_hash: task.expected_hash.clone(),
                    expected_size: task.expected_size,
                })
                .collect(),
        };

        let response = self
            .http
            .post(format!("{}{PROMOTE_FILES_PATH}", self.base_url))
            .bearer_auth(derive_promotion_token(secret))
            .json(&request)
            .send()
            .await
            .context("promote-files request failed")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("promote-files returned status {status}");
        }

        response
            .json::<PromoteFilesResponse>()
            .await
            .context("promote-files response was not valid JSON")
    }
}

#[derive(Clone)]
struct AuthorityState {
    engine: Arc<PromotionEngine>,
    durable_root: PathBuf,
    expected_token: String,
}

/// Serving side of the promote-files RPC, run by nodes holding the durable
/// tier. Each accepted payload is staged to disk and pushed through the same
/// promotion pipeline used for local files.
pub fn authority_router(
    engine: Arc<PromotionEngine>,
    durable_root: PathBuf,
    shared_secret: &str,
) -> Router {
    Router::new()
        .route(PROMOTE_FILES_PATH, post(promote_files_handler))
        .with_state(AuthorityState {
            engine,
            durable_root,
            expected_token: derive_promotion_token(shared_secret),
        })
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// File ids become path components; anything that could escape the tier
/// root is refused outright.
fn is_safe_file_id(file_id: &str) -> bool {
    !file_id.is_empty()
        && !file_id.contains('/')
        && !file_id.contains('\\')
        && file_id != "."
        && file_id != ".."
}

async fn promote_files_handler(
    State(state): State<AuthorityState>,
    headers: HeaderMap,
    Json(request): Json<PromoteFilesRequest>,
) -> Result<Json<PromoteFilesResponse>, StatusCode> {
    match bearer_token(&headers) {
        Some(token) if token == state.expected_token => {}
        _ => {
            tracing::warn!("Rejected promote-files call with missing or bad token");
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    let staging_dir = state.durable_root.join("incoming");
    if let Err(e) = std::fs::create_dir_all(&staging_dir) {
        tracing::error!(error = %e, "Cannot create staging directory");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    let mut response = PromoteFilesResponse {
        promoted: 0,
        failed: 0,
        errors: Vec::new(),
    };

    for entry in &request.files {
        if !is_safe_file_id(&entry.file_id) {
            response.failed += 1;
            response
                .errors
                .push(format!("{}: unsafe file id", entry.file_id));
            continue;
        }

        let payload = match BASE64.decode(&entry.file_data) {
            Ok(bytes) => bytes,
            Err(e) => {
                response.failed += 1;
                response
                    .errors
                    .push(format!("{}: invalid base64 payload: {e}", entry.file_id));
                continue;
            }
        };

        let staging = staging_dir.join(&entry.file_id);
        if let Err(e) = std::fs::write(&staging, &payload) {
            response.failed += 1;
            response
                .errors
                .push(format!("{}: staging write failed: {e}", entry.file_id));
            continue;
        }

        match state
            .engine
            .promote(&entry.file_id, &staging, &state.durable_root)
            .await
        {
            Ok(_) => {
                response.promoted += 1;
                remove_staging(&staging);
            }
            Err(e) => {
                response.failed += 1;
                response.errors.push(format!("{}: {e}", entry.file_id));
                // Rejection already deleted the staged file; I/O failures
                // leave it behind, so clean up here.
                if !matches!(e, PromoteError::Rejected(_)) {
                    remove_staging(&staging);
                }
            }
        }
    }

    tracing::info!(
        promoted = response.promoted,
        failed = response.failed,
        "Handled promote-files batch"
    );
    Ok(Json(response))
}

fn remove_staging(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove staging file");
        }
    }
}
