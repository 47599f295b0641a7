//! Linear stage orchestration.
//!
//! [`Pipeline`] runs the nine stages in their fixed order, one at a time.
//! A stage that returns an error is wrapped in
//! [`PipelineError::StageFailed`] and nothing after it runs.

use crate::error::PipelineError;
use crate::pipeline::{cloud, dataset, load, metadata, opensource, PipelineContext};
use crate::report::{PipelineReport, StageReport};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tracing::{error, info};

/// One pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    StageDataset,
    NormalizeMetadata,
    OpenSourceExtract,
    LoadMetadata,
    LoadOpenSource,
    CloudExtract,
    CloudUpload,
    LoadCloud,
    EnsureUsers,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::StageDataset,
        Stage::NormalizeMetadata,
        Stage::OpenSourceExtract,
        Stage::LoadMetadata,
        Stage::LoadOpenSource,
        Stage::CloudExtract,
        Stage::CloudUpload,
        Stage::LoadCloud,
        Stage::EnsureUsers,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::StageDataset => dataset::STAGE,
            Stage::NormalizeMetadata => metadata::STAGE,
            Stage::OpenSourceExtract => opensource::STAGE,
            Stage::LoadMetadata => load::METADATA_STAGE,
            Stage::LoadOpenSource => load::OPENSOURCE_STAGE,
            Stage::CloudExtract => cloud::EXTRACT_STAGE,
            Stage::CloudUpload => cloud::UPLOAD_STAGE,
            Stage::LoadCloud => load::CLOUD_STAGE,
            Stage::EnsureUsers => load::USERS_STAGE,
        }
    }

    /// One-line description for `docpipe stages`.
    pub fn description(self) -> &'static str {
        match self {
            Stage::StageDataset => "Copy benchmark files from the dataset hub into the bucket",
            Stage::NormalizeMetadata => "Convert metadata JSONL to CSV with a dataset_source column",
            Stage::OpenSourceExtract => "Validate PDFs and extract text and images with pdfium",
            Stage::LoadMetadata => "Overwrite the combined metadata table",
            Stage::LoadOpenSource => "Normalize and load open-source extraction records",
            Stage::CloudExtract => "Run each PDF through the cloud extraction service",
            Stage::CloudUpload => "Publish unpacked cloud results to the bucket",
            Stage::LoadCloud => "Normalize and load cloud extraction records",
            Stage::EnsureUsers => "Create the users table if it is missing",
        }
    }

    fn index(self) -> usize {
        Stage::ALL.iter().position(|s| *s == self).unwrap_or(0)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Stage::ALL
            .into_iter()
            .find(|stage| stage.name() == wanted)
            .ok_or_else(|| {
                let names: Vec<&str> = Stage::ALL.iter().map(|s| s.name()).collect();
                PipelineError::InvalidConfig(format!(
                    "unknown stage '{s}' (expected one of: {})",
                    names.join(", ")
                ))
            })
    }
}

/// The pipeline: a context plus the stage sequence.
#[derive(Debug, Clone)]
pub struct Pipeline {
    ctx: PipelineContext,
}

impl Pipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Run every stage.
    pub async fn run(&self) -> Result<PipelineReport, PipelineError> {
        self.run_stages(&Stage::ALL).await
    }

    /// Run `from` and every stage after it.
    pub async fn run_from(&self, from: Stage) -> Result<PipelineReport, PipelineError> {
        self.run_stages(&Stage::ALL[from.index()..]).await
    }

    /// Run one stage on its own.
    pub async fn run_stage(&self, stage: Stage) -> Result<StageReport, PipelineError> {
        let start = Instant::now();
        info!("── Stage {} ──", stage);

        let result = match stage {
            Stage::StageDataset => dataset::stage_dataset(&self.ctx).await,
            Stage::NormalizeMetadata => metadata::normalize_metadata(&self.ctx).await,
            Stage::OpenSourceExtract => opensource::extract_opensource(&self.ctx).await,
            Stage::LoadMetadata => load::load_metadata(&self.ctx).await,
            Stage::LoadOpenSource => load::load_opensource(&self.ctx).await,
            Stage::CloudExtract => cloud::extract_cloud(&self.ctx).await,
            Stage::CloudUpload => cloud::upload_cloud_outputs(&self.ctx).await,
            Stage::LoadCloud => load::load_cloud(&self.ctx).await,
            Stage::EnsureUsers => load::ensure_users(&self.ctx).await,
        };

        match result {
            Ok(mut report) => {
                report.duration_ms = start.elapsed().as_millis() as u64;
                info!(
                    "Stage {} done in {}ms: {} processed, {} skipped, {} rejected, {} failed",
                    stage,
                    report.duration_ms,
                    report.processed,
                    report.skipped,
                    report.rejected,
                    report.failed.len()
                );
                Ok(report)
            }
            Err(e) => {
                error!("Stage {} failed: {}", stage, e);
                Err(PipelineError::StageFailed {
                    stage: stage.name().to_string(),
                    source: Box::new(e),
                })
            }
        }
    }

    async fn run_stages(&self, stages: &[Stage]) -> Result<PipelineReport, PipelineError> {
        let start = Instant::now();
        let progress = &self.ctx.progress;
        let total = stages.len();
        progress.on_pipeline_start(total);

        let mut report = PipelineReport::default();
        for (idx, stage) in stages.iter().enumerate() {
            progress.on_stage_start(stage.name(), idx, total);
            match self.run_stage(*stage).await {
                Ok(stage_report) => {
                    progress.on_stage_complete(&stage_report);
                    report.stages.push(stage_report);
                }
                Err(e) => {
                    progress.on_stage_error(stage.name(), &e.to_string());
                    progress.on_pipeline_complete(report.stages.len());
                    return Err(e);
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        progress.on_pipeline_complete(report.stages.len());
        info!(
            "Pipeline finished: {} stages in {}ms, {} per-file failures",
            report.stages.len(),
            report.duration_ms,
            report.total_failed()
        );
        Ok(report)
    }
}
