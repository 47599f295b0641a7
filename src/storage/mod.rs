//! Object storage: a flat namespace of named blobs inside one bucket.
//!
//! Names use `/` as a pseudo-directory separator. Every stage talks to storage
//! through the [`ObjectStore`] trait; [`gcs::GcsObjectStore`] is the
//! production backend and [`fs::FsObjectStore`] mirrors the same namespace on
//! a local directory for offline runs and tests.

pub mod fs;
pub mod gcs;

use crate::error::PipelineError;
use async_trait::async_trait;

pub use fs::FsObjectStore;
pub use gcs::GcsObjectStore;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket name used when rendering URIs.
    fn bucket(&self) -> &str;

    /// Names of every object starting with `prefix`, in lexical order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, PipelineError>;

    /// Full content of one object.
    async fn get(&self, name: &str) -> Result<Vec<u8>, PipelineError>;

    /// Create or replace one object.
    async fn put(&self, name: &str, data: Vec<u8>, content_type: &str)
        -> Result<(), PipelineError>;

    /// Remove one object. Removing a missing object is not an error.
    async fn delete(&self, name: &str) -> Result<(), PipelineError>;

    /// Canonical `gs://bucket/name` URI, stored in warehouse rows.
    fn uri(&self, name: &str) -> String {
        format!("gs://{}/{}", self.bucket(), name)
    }

    /// Browser-facing URL for an object.
    fn browser_url(&self, name: &str) -> String {
        format!("https://storage.cloud.google.com/{}/{}", self.bucket(), name)
    }
}

/// MIME type for an object name, by extension.
pub fn content_type_for(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "json" => "application/json",
        "jsonl" => "application/x-ndjson",
        "csv" => "text/csv",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "txt" => "text/plain",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Last path component of an object name.
pub fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}
