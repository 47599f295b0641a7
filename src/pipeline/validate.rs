//! PDF validator: stage every `*.pdf` object locally and keep only files the
//! PDF engine can open.

use super::{blocking, PipelineContext, StageReport};
use crate::error::{FileError, PipelineError};
use crate::pdf::has_pdf_magic;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// A PDF that passed validation, staged under the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPdf {
    /// Object name in the bucket (or the relative path under scratch).
    pub object: String,
    pub local_path: PathBuf,
}

impl ValidatedPdf {
    pub fn file_name(&self) -> &str {
        crate::storage::basename(&self.object)
    }

    pub fn stem(&self) -> String {
        super::stem_of(&self.object)
    }
}

fn is_pdf_name(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".pdf")
}

/// Mirrored scratch path for an object, or `None` when the name would
/// escape the scratch directory.
fn scratch_path(scratch: &Path, object: &str) -> Option<PathBuf> {
    let rel = Path::new(object);
    if rel.components().all(|c| matches!(c, Component::Normal(_))) {
        Some(scratch.join(rel))
    } else {
        None
    }
}

/// Where a download sits until it passes; not matched by [`is_pdf_name`].
fn partial_path(local_path: &Path) -> PathBuf {
    let mut name = OsString::from(local_path.as_os_str());
    name.push(".partial");
    PathBuf::from(name)
}

/// Signature check, then an open check on the blocking pool.
///
/// The outer error is an unusable PDF engine; the inner one is why this
/// file is not a PDF.
async fn check_pdf(
    ctx: &PipelineContext,
    path: &Path,
    head: &[u8],
) -> Result<Result<(), String>, PipelineError> {
    if !has_pdf_magic(head) {
        return Ok(Err("missing %PDF signature".to_string()));
    }
    let pdf = ctx.pdf.clone();
    let path = path.to_path_buf();
    match blocking(move || pdf.open_check(&path)).await {
        Ok(()) => Ok(Ok(())),
        Err(e @ PipelineError::PdfiumBindingFailed(_)) => Err(e),
        Err(e) => Ok(Err(e.to_string())),
    }
}

async fn bucket_pdfs(ctx: &PipelineContext) -> Result<Vec<String>, PipelineError> {
    Ok(ctx
        .store
        .list("")
        .await?
        .into_iter()
        .filter(|name| is_pdf_name(name))
        .collect())
}

/// Download, check and stage every PDF in the bucket.
///
/// Each download lands in a `.partial` file and only takes its staged name
/// once it passes, so the scratch directory never holds an unchecked PDF.
/// Files that fail the `%PDF` signature check or cannot be opened are
/// deleted locally, counted in `report.rejected` and listed as
/// [`FileError::InvalidPdf`]. A storage listing failure or an unusable PDF
/// engine aborts the stage.
pub async fn validate_pdfs(
    ctx: &PipelineContext,
    report: &mut StageReport,
) -> Result<Vec<ValidatedPdf>, PipelineError> {
    let scratch = ctx.config.scratch_dir.clone();
    tokio::fs::create_dir_all(&scratch)
        .await
        .map_err(|e| PipelineError::io(&scratch, e))?;

    let objects = bucket_pdfs(ctx).await?;
    info!("Found {} PDF objects in bucket {}", objects.len(), ctx.store.bucket());

    let mut validated = Vec::new();
    for object in objects {
        ctx.progress.on_item(&report.stage, &object);

        let Some(local_path) = scratch_path(&scratch, &object) else {
            reject(report, &object, "object name is not a relative path");
            continue;
        };

        let data = match ctx.store.get(&object).await {
            Ok(d) => d,
            Err(e) => {
                warn!("Could not download {}: {}", object, e);
                report.record_failure(FileError::Read {
                    name: object,
                    detail: e.to_string(),
                });
                continue;
            }
        };

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::io(parent, e))?;
        }
        remove_quietly(&local_path).await;
        let partial = partial_path(&local_path);
        tokio::fs::write(&partial, &data)
            .await
            .map_err(|e| PipelineError::io(&partial, e))?;

        let verdict = match check_pdf(ctx, &partial, &data).await {
            Ok(v) => v,
            Err(e) => {
                remove_quietly(&partial).await;
                return Err(e);
            }
        };

        match verdict {
            Ok(()) => {
                tokio::fs::rename(&partial, &local_path)
                    .await
                    .map_err(|e| PipelineError::io(&local_path, e))?;
                debug!("Validated {}", object);
                validated.push(ValidatedPdf { object, local_path });
            }
            Err(detail) => {
                remove_quietly(&partial).await;
                reject(report, &object, &detail);
            }
        }
    }

    info!(
        "{} PDFs validated, {} rejected",
        validated.len(),
        report.rejected
    );
    Ok(validated)
}

/// PDFs already staged by an earlier validation in this scratch directory.
///
/// Returns `None` when the directory does not exist, so the caller knows to
/// run [`validate_pdfs`] instead.
pub async fn staged_pdfs(scratch: &Path) -> Result<Option<Vec<ValidatedPdf>>, PipelineError> {
    if !tokio::fs::try_exists(scratch)
        .await
        .map_err(|e| PipelineError::io(scratch, e))?
    {
        return Ok(None);
    }

    let root = scratch.to_path_buf();
    let found = blocking(move || -> Result<Vec<ValidatedPdf>, PipelineError> {
        let mut out = Vec::new();
        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                PipelineError::io(path, std::io::Error::other(e.to_string()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&root) else {
                continue;
            };
            let object = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if is_pdf_name(&object) {
                out.push(ValidatedPdf {
                    object,
                    local_path: entry.path().to_path_buf(),
                });
            }
        }
        Ok(out)
    })
    .await?;

    Ok(Some(found))
}

/// Re-check PDFs found in the scratch directory before reuse.
///
/// Files whose object is gone from the bucket are deleted and counted as
/// skipped. Files that no longer pass the signature or open check are
/// deleted and rejected like in [`validate_pdfs`].
pub async fn revalidate_staged(
    ctx: &PipelineContext,
    staged: Vec<ValidatedPdf>,
    report: &mut StageReport,
) -> Result<Vec<ValidatedPdf>, PipelineError> {
    let in_bucket: BTreeSet<String> = bucket_pdfs(ctx).await?.into_iter().collect();

    let mut kept = Vec::with_capacity(staged.len());
    for pdf in staged {
        if !in_bucket.contains(&pdf.object) {
            info!("Dropping {}: no longer in bucket {}", pdf.object, ctx.store.bucket());
            remove_quietly(&pdf.local_path).await;
            report.skipped += 1;
            continue;
        }

        let data = tokio::fs::read(&pdf.local_path)
            .await
            .map_err(|e| PipelineError::io(&pdf.local_path, e))?;
        match check_pdf(ctx, &pdf.local_path, &data).await? {
            Ok(()) => kept.push(pdf),
            Err(detail) => {
                remove_quietly(&pdf.local_path).await;
                reject(report, &pdf.object, &detail);
            }
        }
    }
    Ok(kept)
}

fn reject(report: &mut StageReport, object: &str, detail: &str) {
    warn!("Rejected {}: {}", object, detail);
    report.rejected += 1;
    report.record_failure(FileError::InvalidPdf {
        name: object.to_string(),
        detail: detail.to_string(),
    });
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove {}: {}", path.display(), e);
        }
    }
}
