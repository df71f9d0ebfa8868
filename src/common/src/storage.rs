//! Object-store construction and tier layout.
//!
//! Every storage tier uses the same layout: encrypted blobs under `files/`
//! keyed by their storage reference, derived thumbnails under `thumbnails/`.
//! The remote tier is any `object_store`-backed store built from a DSN.

use anyhow::Result;
use object_store::{ObjectStore, aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

/// Subdirectory / key prefix holding encrypted file blobs.
pub const FILES_PREFIX: &str = "files";
/// Subdirectory / key prefix holding derived thumbnails.
pub const THUMBNAILS_PREFIX: &str = "thumbnails";
/// Name prefix of in-flight atomic-rename staging files.
pub const PROMOTE_TMP_PREFIX: &str = ".promote_";

/// Path of a file blob inside a tier root.
pub fn tier_file_path(root: &Path, file_id: &str) -> PathBuf {
    root.join(FILES_PREFIX).join(file_id)
}

/// Remote object key of a file blob.
pub fn remote_file_key(file_id: &str) -> String {
    format!("{FILES_PREFIX}/{file_id}")
}

/// Whether a file name is an in-flight promotion staging artifact.
pub fn is_promote_tmp(name: &str) -> bool {
    name.starts_with(PROMOTE_TMP_PREFIX) && name.ends_with(".tmp")
}

/// Create an object store from a DSN string
///
/// # Examples
/// ```
/// use common::storage::create_object_store_from_dsn;
///
/// assert!(create_object_store_from_dsn("memory://").is_ok());
/// assert!(create_object_store_from_dsn("not-a-url").is_err());
/// ```
pub fn create_object_store_from_dsn(dsn: &str) -> Result<Arc<dyn ObjectStore>> {
    let url =
        Url::parse(dsn).map_err(|e| anyhow::anyhow!("Invalid storage DSN '{}': {}", dsn, e))?;

    match url.scheme() {
        "file" => {
            let path = url.path();
            if path.is_empty() || path == "/" {
                return Err(anyhow::anyhow!(
                    "File DSN must specify a path: file:///path/to/storage"
                ));
            }
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        "memory" => Ok(Arc::new(InMemory::new())),
        "s3" => {
            let builder = create_s3_builder_from_dsn(&url)?;
            Ok(Arc::new(builder.build()?))
        }
        scheme => Err(anyhow::anyhow!(
            "Unsupported storage scheme: {}. Supported: file, memory, s3",
            scheme
        )),
    }
}

/// Create an S3 builder from a DSN
/// DSN format: s3://[access_key:secret_key@]host[:port]/bucket
pub fn create_s3_builder_from_dsn(dsn: &Url) -> Result<AmazonS3Builder> {
    let host = dsn
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("Missing S3 host in DSN"))?;
    let port = dsn.port();
    let bucket = dsn.path().trim_start_matches('/');

    if bucket.is_empty() {
        return Err(anyhow::anyhow!(
            "S3 DSN must specify a bucket: s3://host/bucket"
        ));
    }

    let mut builder = AmazonS3Builder::new()
        .with_bucket_name(bucket)
        .with_region("us-east-1"); // Default region

    // Extract credentials from DSN if present
    let access_key = dsn.username();
    let secret_key = dsn.password().unwrap_or("");

    if !access_key.is_empty() {
        builder = builder
            .with_access_key_id(access_key)
            .with_secret_access_key(secret_key);
    }

    // Determine if this is real S3 or S3-compatible (MinIO, etc)
    let endpoint = if host.contains("amazonaws.com") {
        None
    } else {
        let scheme = if port == Some(443) { "https" } else { "http" };
        Some(match port {
            Some(p) => format!("{scheme}://{host}:{p}"),
            None => format!("{scheme}://{host}"),
        })
    };

    if let Some(endpoint) = endpoint {
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(true)
            .with_virtual_hosted_style_request(false); // MinIO requires path-style URLs
    }

    // Check environment for AWS credentials if not in DSN
    if access_key.is_empty() {
        if let Ok(env_key) = std::env::var("AWS_ACCESS_KEY_ID") {
            builder = builder.with_access_key_id(env_key);
        }
        if let Ok(env_secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
            builder = builder.with_secret_access_key(env_secret);
        }
        if let Ok(env_region) = std::env::var("AWS_DEFAULT_REGION") {
            builder = builder.with_region(env_region);
        }
    }

    Ok(builder)
}
