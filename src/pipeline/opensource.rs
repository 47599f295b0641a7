//! Open-source extractor: pdfium text and embedded images per validated PDF.
//!
//! Artifacts per PDF, under `<extraction_prefix><stem>/`:
//!
//! | Object                | Content                                          |
//! |-----------------------|--------------------------------------------------|
//! | `<stem>_img<N>.png`   | N-th uploaded image, 1-based in extraction order |
//! | `<stem>.json`         | [`ExtractionArtifact`]                           |
//! | `<stem>.csv`          | `Extracted Text` header + one row (non-empty text only) |

use super::encode::encode_png;
use super::validate::{revalidate_staged, staged_pdfs, validate_pdfs, ValidatedPdf};
use super::{blocking, PipelineContext, StageReport};
use crate::error::{FileError, PipelineError};
use crate::pdf::PageContent;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{info, warn};

pub const STAGE: &str = "opensource-extract";

/// JSON summary written next to the extracted images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionArtifact {
    pub pdf_filename: String,
    /// Length of `extracted_text` in characters.
    pub extracted_text_length: usize,
    /// Number of uploaded images; always `image_paths.len()`.
    pub image_count: usize,
    /// Storage URIs of the uploaded images, in extraction order.
    pub image_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
}

impl ExtractionArtifact {
    pub fn new(pdf_filename: &str, text: String, image_paths: Vec<String>) -> Self {
        Self {
            pdf_filename: pdf_filename.to_string(),
            extracted_text_length: text.chars().count(),
            image_count: image_paths.len(),
            image_paths,
            extracted_text: (!text.is_empty()).then_some(text),
        }
    }
}

/// Page texts concatenated with no separator.
pub fn join_page_text(pages: &[PageContent]) -> String {
    pages.iter().map(|p| p.text.as_str()).collect()
}

/// Single-column CSV holding the full text.
pub fn text_csv(text: &str) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["Extracted Text"])?;
    writer.write_record([text])?;
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

pub async fn extract_opensource(ctx: &PipelineContext) -> Result<StageReport, PipelineError> {
    let mut report = StageReport::new(STAGE);

    let pdfs = validate_pdfs(ctx, &mut report).await?;
    for pdf in &pdfs {
        ctx.progress.on_item(STAGE, &pdf.object);
        extract_one(ctx, pdf, &mut report).await?;
        report.processed += 1;
    }

    info!(
        "Open-source extraction: {} processed, {} rejected, {} failures",
        report.processed,
        report.rejected,
        report.failed.len()
    );
    Ok(report)
}

/// PDFs for a later stage: reuse the scratch directory when an earlier
/// validation populated it, re-checking each file first, otherwise
/// validate now.
pub(crate) async fn validated_or_staged(
    ctx: &PipelineContext,
    report: &mut StageReport,
) -> Result<Vec<ValidatedPdf>, PipelineError> {
    match staged_pdfs(&ctx.config.scratch_dir).await? {
        Some(pdfs) if !pdfs.is_empty() => {
            info!(
                "Reusing {} staged PDFs from {}",
                pdfs.len(),
                ctx.config.scratch_dir.display()
            );
            revalidate_staged(ctx, pdfs, report).await
        }
        _ => validate_pdfs(ctx, report).await,
    }
}

async fn extract_one(
    ctx: &PipelineContext,
    pdf: &ValidatedPdf,
    report: &mut StageReport,
) -> Result<(), PipelineError> {
    let start = Instant::now();
    let stem = pdf.stem();
    let prefix = format!("{}{}/", ctx.config.extraction_prefix, stem);

    // ── Step 1: Extract text and images ──────────────────────────────────
    let backend = ctx.pdf.clone();
    let path = pdf.local_path.clone();
    let pages = match blocking(move || backend.extract(&path)).await {
        Ok(pages) => pages,
        Err(e @ PipelineError::PdfiumBindingFailed(_)) => return Err(e),
        Err(e) => {
            warn!("Extraction failed for {}: {}", pdf.object, e);
            report.record_failure(FileError::Extraction {
                name: pdf.object.clone(),
                detail: e.to_string(),
            });
            Vec::new()
        }
    };
    let text = join_page_text(&pages);
    let images: Vec<_> = pages.into_iter().flat_map(|p| p.images).collect();

    // ── Step 2: Upload images ────────────────────────────────────────────
    // Names follow upload order so a skipped image leaves no gap.
    let mut image_paths = Vec::with_capacity(images.len());
    for (idx, img) in images.iter().enumerate() {
        let png = match encode_png(img) {
            Ok(png) => png,
            Err(e) => {
                warn!("Failed to encode image {} of {}: {}", idx + 1, pdf.object, e);
                report.record_failure(FileError::Extraction {
                    name: format!("{} (image {})", pdf.object, idx + 1),
                    detail: e.to_string(),
                });
                continue;
            }
        };
        let name = format!("{prefix}{stem}_img{}.png", image_paths.len() + 1);
        ctx.store.put(&name, png, "image/png").await?;
        image_paths.push(ctx.store.uri(&name));
    }

    // ── Step 3: Upload JSON summary ──────────────────────────────────────
    let artifact = ExtractionArtifact::new(pdf.file_name(), text, image_paths);
    let json = serde_json::to_vec_pretty(&artifact)
        .map_err(|e| PipelineError::Internal(format!("artifact serialization: {e}")))?;
    ctx.store
        .put(&format!("{prefix}{stem}.json"), json, "application/json")
        .await?;

    // ── Step 4: Upload text CSV ──────────────────────────────────────────
    if let Some(text) = &artifact.extracted_text {
        let csv_bytes = text_csv(text)
            .map_err(|e| PipelineError::Internal(format!("text CSV: {e}")))?;
        ctx.store
            .put(&format!("{prefix}{stem}.csv"), csv_bytes, "text/csv")
            .await?;
    }

    info!(
        "Extracted {}: {} chars, {} images in {}ms",
        pdf.object,
        artifact.extracted_text_length,
        artifact.image_count,
        start.elapsed().as_millis()
    );
    Ok(())
}
