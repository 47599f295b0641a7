//! Progress-callback trait for stage and per-item pipeline events.
//!
//! Pass an [`Arc<dyn PipelineProgressCallback>`] to
//! [`crate::pipeline::PipelineContext`] to receive events as the
//! pipeline works through its stages. The CLI drives a terminal progress bar
//! from it; a scheduler integration could forward the same events to its own
//! task log.
//!
//! # Example
//!
//! ```rust
//! use docpipe::{PipelineProgressCallback, StageReport};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     items: Arc<AtomicUsize>,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_item(&self, stage: &str, name: &str) {
//!         self.items.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("[{stage}] {name}");
//!     }
//! }
//!
//! let cb: Arc<dyn PipelineProgressCallback> = Arc::new(CountingCallback {
//!     items: Arc::new(AtomicUsize::new(0)),
//! });
//! cb.on_stage_start("opensource-extract", 1, 9);
//! cb.on_item("opensource-extract", "2023/test/a.pdf");
//!
//! fn attach(
//!     ctx: docpipe::pipeline::PipelineContext,
//!     cb: Arc<dyn PipelineProgressCallback>,
//! ) -> docpipe::pipeline::PipelineContext {
//!     ctx.with_progress(cb)
//! }
//! ```

use crate::report::StageReport;
use std::sync::Arc;

/// Called by the orchestrator and the stages as work progresses.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once before the first stage runs.
    ///
    /// # Arguments
    /// * `total_stages` - number of stages this run will attempt
    fn on_pipeline_start(&self, total_stages: usize) {
        let _ = total_stages;
    }

    /// Called before a stage starts.
    ///
    /// # Arguments
    /// * `stage`        - stage name
    /// * `index`        - 1-indexed position within this run
    /// * `total_stages` - number of stages this run will attempt
    fn on_stage_start(&self, stage: &str, index: usize, total_stages: usize) {
        let _ = (stage, index, total_stages);
    }

    /// Called once per file or object a stage finishes with, successful or not.
    fn on_item(&self, stage: &str, name: &str) {
        let _ = (stage, name);
    }

    /// Called when a stage returns its report.
    fn on_stage_complete(&self, report: &StageReport) {
        let _ = report;
    }

    /// Called when a stage fails; no further stages run.
    fn on_stage_error(&self, stage: &str, error: &str) {
        let _ = (stage, error);
    }

    /// Called after the last stage of a successful run.
    ///
    /// # Arguments
    /// * `completed_stages` - stages that returned a report
    fn on_pipeline_complete(&self, completed_stages: usize) {
        let _ = completed_stages;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias for the type stored in the pipeline context.
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
