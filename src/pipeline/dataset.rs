//! Dataset stager: mirror the benchmark's files from the hub into the bucket.
//!
//! Every hub file whose path starts with the configured prefix is downloaded
//! and uploaded unchanged under the same relative path. Any failure aborts
//! the stage; there is no partial-success mode here.

use super::{PipelineContext, StageReport};
use crate::error::PipelineError;
use crate::storage::content_type_for;
use tracing::{debug, info};

pub const STAGE: &str = "stage-dataset";

pub async fn stage_dataset(ctx: &PipelineContext) -> Result<StageReport, PipelineError> {
    let config = &ctx.config;
    let mut report = StageReport::new(STAGE);

    // Both checks happen before any network call.
    config.require_hub_token()?;
    let repo_id = config.require_repo_id()?;

    let files = ctx.hub.list_files(repo_id, config.repo_type).await?;
    info!("Hub repository {} lists {} files", repo_id, files.len());

    for path in files {
        if !path.starts_with(&config.dataset_prefix) {
            debug!("Skipping {} (outside {})", path, config.dataset_prefix);
            report.skipped += 1;
            continue;
        }

        ctx.progress.on_item(STAGE, &path);
        let local = ctx.hub.download(repo_id, config.repo_type, &path).await?;
        let data = tokio::fs::read(&local)
            .await
            .map_err(|e| PipelineError::io(&local, e))?;

        info!("Uploading {} ({} bytes)", path, data.len());
        ctx.store.put(&path, data, content_type_for(&path)).await?;
        report.processed += 1;
    }

    info!(
        "Staged {} files into bucket {} ({} skipped)",
        report.processed,
        ctx.store.bucket(),
        report.skipped
    );
    Ok(report)
}
