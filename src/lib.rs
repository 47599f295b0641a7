//! # docpipe
//!
//! Ingest a document-heavy question-answering benchmark into an analytical
//! warehouse, extracting every PDF attachment twice: once with an
//! open-source engine (pdfium) and once with a cloud extraction service.
//!
//! ## Pipeline Overview
//!
//! ```text
//! dataset hub
//!  │
//!  ├─ 1. stage-dataset        mirror benchmark files into the bucket
//!  ├─ 2. normalize-metadata   metadata JSONL → CSV (+ dataset_source)
//!  ├─ 3. opensource-extract   validate PDFs, pdfium text + PNG images
//!  ├─ 4. load-metadata        overwrite the combined metadata table
//!  ├─ 5. load-opensource      normalize + overwrite the open-source table
//!  ├─ 6. cloud-extract        submit/poll/download result archives
//!  ├─ 7. cloud-upload         publish unpacked results to the bucket
//!  ├─ 8. load-cloud           normalize + overwrite the cloud table
//!  └─ 9. ensure-users         create the users table if missing
//! ```
//!
//! Every table load is a full overwrite, so re-running a stage is safe.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docpipe::{Pipeline, PipelineConfig, PipelineContext};
//! use docpipe::cloud_service::AdobeExtractService;
//! use docpipe::hub::HfDatasetHub;
//! use docpipe::pdf::PdfiumBackend;
//! use docpipe::storage::FsObjectStore;
//! use docpipe::warehouse::SqliteWarehouse;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .bucket("benchmark-docs")
//!         .hub_token(std::env::var("HUGGINGFACE_TOKEN")?)
//!         .repo_id("gaia-benchmark/GAIA")
//!         .output_dir("adobe_output")
//!         .cloud_extracted_folder("adobe_extracted")
//!         .build()?;
//!
//!     let ctx = PipelineContext::new(
//!         config.clone(),
//!         Arc::new(FsObjectStore::new("bucket", "benchmark-docs")),
//!         Arc::new(SqliteWarehouse::open("warehouse.db")?),
//!         Arc::new(HfDatasetHub::new(config.hub_token.clone().unwrap_or_default())),
//!         Arc::new(PdfiumBackend::default()),
//!         Arc::new(AdobeExtractService::new(&config)?),
//!     );
//!     let report = Pipeline::new(ctx).run().await?;
//!     eprintln!("{} per-file failures", report.total_failed());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docpipe` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! docpipe = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod auth;
pub mod cloud_service;
pub mod config;
pub mod error;
pub mod http;
pub mod hub;
pub mod orchestrator;
pub mod pdf;
pub mod pipeline;
pub mod progress;
pub mod record;
pub mod report;
pub mod storage;
pub mod warehouse;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{MetadataSource, PipelineConfig, PipelineConfigBuilder, RepoKind, TableNames};
pub use error::{FileError, PipelineError, ServiceError};
pub use orchestrator::{Pipeline, Stage};
pub use pipeline::PipelineContext;
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use record::{CloudRecord, ExtractionMethod, ExtractionResult, OpenSourceRecord, Question, TaskRecord};
pub use report::{PipelineReport, StageReport};
pub use warehouse::{fetch_extracted, list_questions};
