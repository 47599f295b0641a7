//! Pipeline stages.
//!
//! Each stage is a plain async function over a shared [`PipelineContext`]
//! that returns a [`StageReport`]. Stages process one item at a time; a
//! per-file failure is recorded in the report and the stage moves on,
//! while an `Err(PipelineError)` aborts the stage and the run.
//!
//! ```text
//! stage-dataset ─► normalize-metadata ─► opensource-extract ─► load-metadata
//!        ─► load-opensource ─► cloud-extract ─► cloud-upload ─► load-cloud
//!        ─► ensure-users
//! ```

pub mod cloud;
pub mod dataset;
pub mod encode;
pub mod load;
pub mod metadata;
pub mod normalize;
pub mod opensource;
pub mod text;
pub mod validate;

use crate::cloud_service::ExtractionService;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::hub::DatasetHub;
use crate::pdf::PdfBackend;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::storage::ObjectStore;
use crate::warehouse::Warehouse;
use std::sync::Arc;

pub use crate::report::StageReport;

/// Client handles and configuration shared by every stage.
///
/// Built once by the caller and handed to [`crate::orchestrator::Pipeline`];
/// nothing in the crate keeps global clients.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<PipelineConfig>,
    pub store: Arc<dyn ObjectStore>,
    pub warehouse: Arc<dyn Warehouse>,
    pub hub: Arc<dyn DatasetHub>,
    pub pdf: Arc<dyn PdfBackend>,
    pub extractor: Arc<dyn ExtractionService>,
    pub progress: ProgressCallback,
}

impl PipelineContext {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
        hub: Arc<dyn DatasetHub>,
        pdf: Arc<dyn PdfBackend>,
        extractor: Arc<dyn ExtractionService>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            warehouse,
            hub,
            pdf,
            extractor,
            progress: Arc::new(NoopProgressCallback),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("config", &self.config)
            .field("bucket", &self.store.bucket())
            .finish_non_exhaustive()
    }
}

/// Run a blocking closure off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PipelineError::Internal(format!("spawn_blocking panicked: {e}")))?
}

/// File stem of an object or file name: `2023/test/abc.pdf` → `abc`.
pub(crate) fn stem_of(name: &str) -> String {
    let base = crate::storage::basename(name);
    match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => base.to_string(),
    }
}
