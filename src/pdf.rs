//! PDF engine seam: open checks and text + embedded-image extraction.
//!
//! [`PdfiumBackend`] is blocking; callers run it inside
//! `tokio::task::spawn_blocking` because pdfium is CPU-bound and keeps
//! thread-local state.

use crate::error::PipelineError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Text and embedded images of one page.
#[derive(Debug, Clone, Default)]
pub struct PageContent {
    pub text: String,
    /// Raster images in the page's object order.
    pub images: Vec<DynamicImage>,
}

impl PageContent {
    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

pub trait PdfBackend: Send + Sync {
    /// Open the document and fail if it cannot be parsed.
    fn open_check(&self, path: &Path) -> Result<(), PipelineError>;

    /// Every page's text and images, in page order.
    fn extract(&self, path: &Path) -> Result<Vec<PageContent>, PipelineError>;
}

/// `true` when `head` starts with the `%PDF` signature.
pub fn has_pdf_magic(head: &[u8]) -> bool {
    head.starts_with(b"%PDF")
}

/// pdfium-backed engine.
///
/// Binding order: `lib_dir` (from `PDFIUM_LIB_PATH`), the working directory,
/// then the system library.
#[derive(Debug, Clone, Default)]
pub struct PdfiumBackend {
    lib_dir: Option<PathBuf>,
}

impl PdfiumBackend {
    pub fn new(lib_dir: Option<PathBuf>) -> Self {
        Self { lib_dir }
    }

    fn bind(&self) -> Result<Pdfium, PipelineError> {
        let mut tried = Vec::new();

        let mut dirs: Vec<PathBuf> = Vec::new();
        if let Some(dir) = &self.lib_dir {
            dirs.push(dir.clone());
        }
        dirs.push(PathBuf::from("./"));

        for dir in dirs {
            match Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&dir)) {
                Ok(bindings) => {
                    debug!("Bound pdfium from {}", dir.display());
                    return Ok(Pdfium::new(bindings));
                }
                Err(e) => tried.push(format!("{}: {e:?}", dir.display())),
            }
        }

        match Pdfium::bind_to_system_library() {
            Ok(bindings) => Ok(Pdfium::new(bindings)),
            Err(e) => {
                tried.push(format!("system: {e:?}"));
                Err(PipelineError::PdfiumBindingFailed(tried.join("; ")))
            }
        }
    }
}

fn corrupt(path: &Path, e: PdfiumError) -> PipelineError {
    PipelineError::CorruptPdf {
        path: path.to_path_buf(),
        detail: format!("{e:?}"),
    }
}

impl PdfBackend for PdfiumBackend {
    fn open_check(&self, path: &Path) -> Result<(), PipelineError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| corrupt(path, e))?;
        debug!("{}: {} pages", path.display(), document.pages().len());
        Ok(())
    }

    fn extract(&self, path: &Path) -> Result<Vec<PageContent>, PipelineError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| corrupt(path, e))?;

        let mut pages = Vec::new();
        for (idx, page) in document.pages().iter().enumerate() {
            let text = page.text().map(|t| t.all()).map_err(|e| corrupt(path, e))?;

            let mut images = Vec::new();
            for object in page.objects().iter() {
                let Some(image) = object.as_image_object() else {
                    continue;
                };
                match image.get_raw_image() {
                    Ok(img) => images.push(img),
                    Err(e) => warn!(
                        "{}: page {}: skipping unreadable image: {e:?}",
                        path.display(),
                        idx + 1
                    ),
                }
            }

            debug!(
                "{}: page {} → {} chars, {} images",
                path.display(),
                idx + 1,
                text.chars().count(),
                images.len()
            );
            pages.push(PageContent { text, images });
        }
        Ok(pages)
    }
}
