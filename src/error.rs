//! Error types for the docpipe library.
//!
//! Three error types reflect three distinct failure modes:
//!
//! * [`PipelineError`]: **Fatal** for the current stage: a required
//!   configuration value is missing, the bucket or warehouse is unreachable,
//!   credentials cannot be loaded. Returned as `Err(PipelineError)` and halts
//!   every downstream stage of the run.
//!
//! * [`FileError`]: **Non-fatal**: a single file failed (corrupt PDF,
//!   undecodable JSON, extraction-service rejection) but the rest of the
//!   batch is fine. Stored in [`crate::report::StageReport`] so callers can
//!   inspect partial success.
//!
//! * [`ServiceError`]: the failure kinds of the cloud document-extraction
//!   service. The cloud stage turns these into [`FileError::Service`].

use std::path::PathBuf;
use thiserror::Error;

/// All stage-level and configuration errors returned by docpipe.
///
/// Per-file failures use [`FileError`] and are stored in
/// [`crate::report::StageReport`] rather than propagated here.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Config errors ─────────────────────────────────────────────────────
    /// A required configuration value is missing or empty.
    #[error("Missing required configuration value '{key}'\nSet it with the matching flag or environment variable.")]
    MissingConfig { key: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Cloud-extraction credentials could not be loaded.
    #[error("Failed to load credentials from '{path}': {detail}")]
    Credentials { path: PathBuf, detail: String },

    /// Google Cloud credentials could not be discovered or refreshed.
    #[error("Google Cloud authentication failed: {0}\nRun `gcloud auth application-default login` or set GOOGLE_APPLICATION_CREDENTIALS.")]
    GoogleAuth(String),

    // ── Remote collaborators ──────────────────────────────────────────────
    /// An object-storage operation failed.
    #[error("Object storage {op} failed for '{name}': {detail}")]
    Storage {
        op: &'static str,
        name: String,
        detail: String,
    },

    /// Listing or downloading from the dataset hub failed.
    #[error("Dataset hub error for '{repo}': {detail}")]
    Hub { repo: String, detail: String },

    /// A warehouse query, table creation or load job failed.
    #[error("Warehouse error on '{table}': {detail}")]
    Warehouse { table: String, detail: String },

    /// A warehouse load job did not finish within the poll timeout.
    #[error("Warehouse job '{job_id}' did not complete within {secs}s")]
    WarehouseTimeout { job_id: String, secs: u64 },

    // ── Local errors ──────────────────────────────────────────────────────
    /// Reading or writing local scratch storage failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH to the directory containing libpdfium, or install\n\
pdfium system-wide.\n"
    )]
    PdfiumBindingFailed(String),

    /// The PDF engine could not open or read a document. Stages record this
    /// as a per-file [`FileError`].
    #[error("PDF '{path}' could not be read: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    // ── Orchestration ─────────────────────────────────────────────────────
    /// A stage failed; downstream stages were not run.
    #[error("Stage '{stage}' failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: Box<PipelineError>,
    },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn storage(op: &'static str, name: impl Into<String>, detail: impl ToString) -> Self {
        PipelineError::Storage {
            op,
            name: name.into(),
            detail: detail.to_string(),
        }
    }

    pub(crate) fn warehouse(table: impl Into<String>, detail: impl ToString) -> Self {
        PipelineError::Warehouse {
            table: table.into(),
            detail: detail.to_string(),
        }
    }
}

/// A non-fatal error for a single file.
///
/// Stored in [`crate::report::StageReport::failed`]. The stage continues
/// with the next file.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum FileError {
    /// The PDF failed the magic-byte or open check and was discarded.
    #[error("{name}: invalid PDF: {detail}")]
    InvalidPdf { name: String, detail: String },

    /// Text or image extraction failed; an empty artifact was written.
    #[error("{name}: extraction failed: {detail}")]
    Extraction { name: String, detail: String },

    /// The cloud extraction service rejected or lost the job.
    #[error("{name}: {kind} error: {detail}")]
    Service {
        name: String,
        kind: String,
        detail: String,
    },

    /// The result archive could not be unpacked.
    #[error("{name}: archive error: {detail}")]
    Archive { name: String, detail: String },

    /// A JSON artifact could not be decoded.
    #[error("{name}: JSON decode error: {detail}")]
    Decode { name: String, detail: String },

    /// An artifact could not be read from storage.
    #[error("{name}: read error: {detail}")]
    Read { name: String, detail: String },

    /// An artifact could not be written to storage.
    #[error("{name}: upload error: {detail}")]
    Upload { name: String, detail: String },

    /// A metadata file contained a malformed line; nothing was emitted for it.
    #[error("{name}: malformed JSON on line {line}: {detail}")]
    MalformedMetadata {
        name: String,
        line: usize,
        detail: String,
    },
}

/// Failure kinds reported by the cloud document-extraction service.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// The service answered with an error status for the request.
    #[error("service API error (HTTP {status}): {message}")]
    ServiceApi { status: u16, message: String },

    /// Quota or rate limit exhausted.
    #[error("service usage limit reached: {message}")]
    ServiceUsage { message: String },

    /// Transport, encoding or protocol failure on the client side.
    #[error("client error: {0}")]
    Sdk(String),

    /// The service reported the job as failed.
    #[error("job failed: {0}")]
    JobFailed(String),

    /// The job did not reach a terminal state before the poll deadline.
    #[error("job did not complete within {secs}s")]
    TimedOut { secs: u64 },
}

impl ServiceError {
    /// Short label used in logs and [`FileError::Service`].
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::ServiceApi { .. } => "service-api",
            ServiceError::ServiceUsage { .. } => "service-usage",
            ServiceError::Sdk(_) => "sdk",
            ServiceError::JobFailed(_) => "job-failed",
            ServiceError::TimedOut { .. } => "timed-out",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_display() {
        let e = PipelineError::MissingConfig {
            key: "BUCKET_NAME".into(),
        };
        assert!(e.to_string().contains("BUCKET_NAME"));
    }

    #[test]
    fn stage_failed_wraps_source() {
        let e = PipelineError::StageFailed {
            stage: "load-cloud".into(),
            source: Box::new(PipelineError::warehouse("cloud_extracted", "quota")),
        };
        let msg = e.to_string();
        assert!(msg.contains("load-cloud"), "got: {msg}");
        assert!(msg.contains("quota"), "got: {msg}");
    }

    #[test]
    fn service_error_kinds() {
        assert_eq!(ServiceError::TimedOut { secs: 5 }.kind(), "timed-out");
        assert_eq!(ServiceError::Sdk("x".into()).kind(), "sdk");
        assert!(ServiceError::TimedOut { secs: 5 }.to_string().contains("5s"));
    }

    #[test]
    fn file_error_display() {
        let e = FileError::MalformedMetadata {
            name: "metadata.jsonl".into(),
            line: 2,
            detail: "expected value".into(),
        };
        assert!(e.to_string().contains("line 2"));
    }
}
