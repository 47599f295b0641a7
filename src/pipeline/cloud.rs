//! Cloud extractor: submit each validated PDF to the extraction service,
//! keep the result archives locally, and publish their contents.

use super::opensource::validated_or_staged;
use super::validate::ValidatedPdf;
use super::{blocking, PipelineContext, StageReport};
use crate::cloud_service::{ExtractJob, ExtractionService, JobLocation, JobStatus, ResultAsset};
use crate::error::{FileError, PipelineError, ServiceError};
use crate::storage::content_type_for;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

pub const EXTRACT_STAGE: &str = "cloud-extract";
pub const UPLOAD_STAGE: &str = "cloud-upload";

/// Name of the element file inside every result archive.
pub const STRUCTURED_DATA: &str = "structuredData.json";

/// Local folder (and archive stem) for one PDF's results.
pub fn result_folder_name(stem: &str) -> String {
    format!("extract_{stem}")
}

/// Destination object for one unpacked result file. Nested files are
/// flattened onto their basename.
pub fn cloud_object_name(root: &str, folder: &str, file_name: &str) -> String {
    format!("{}/{folder}/{folder}_{file_name}", root.trim_end_matches('/'))
}

/// Upload, submit and poll one document, returning the result archive.
///
/// Polling is bounded by `timeout`; a job still in progress at the deadline
/// yields [`ServiceError::TimedOut`].
pub async fn run_extract_job(
    service: &dyn ExtractionService,
    data: Vec<u8>,
    interval: Duration,
    timeout: Duration,
) -> Result<Vec<u8>, ServiceError> {
    let asset = service.upload(data, "application/pdf").await?;
    let location = service.submit(&ExtractJob::text_tables_figures(&asset)).await?;
    debug!("Submitted job {}", location.0);

    let result = tokio::time::timeout(timeout, poll_until_done(service, &location, interval))
        .await
        .map_err(|_| ServiceError::TimedOut {
            secs: timeout.as_secs(),
        })??;

    service.get_content(&result).await
}

async fn poll_until_done(
    service: &dyn ExtractionService,
    location: &JobLocation,
    interval: Duration,
) -> Result<ResultAsset, ServiceError> {
    loop {
        match service.poll(location).await? {
            JobStatus::InProgress => tokio::time::sleep(interval).await,
            JobStatus::Done(result) => return Ok(result),
            JobStatus::Failed(message) => return Err(ServiceError::JobFailed(message)),
        }
    }
}

/// Unpack `archive` into `dest`, refusing entries that would land outside it.
pub fn unzip_archive(archive: &Path, dest: &Path) -> Result<Vec<PathBuf>, String> {
    let file = std::fs::File::open(archive).map_err(|e| e.to_string())?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| e.to_string())?;
    std::fs::create_dir_all(dest).map_err(|e| e.to_string())?;

    let mut written = Vec::new();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| e.to_string())?;
        let Some(rel) = entry.enclosed_name() else {
            return Err(format!("unsafe entry path '{}'", entry.name()));
        };
        let target = dest.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| e.to_string())?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let mut out = std::fs::File::create(&target).map_err(|e| e.to_string())?;
        std::io::copy(&mut entry, &mut out).map_err(|e| e.to_string())?;
        written.push(target);
    }
    Ok(written)
}

/// Texts of the top-level headings in a structured-data document.
pub fn h1_headings(structured: &Value) -> Vec<String> {
    structured
        .get("elements")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|el| {
            el.get("Path")
                .and_then(Value::as_str)
                .is_some_and(|p| p.ends_with("/H1"))
        })
        .filter_map(|el| el.get("Text").and_then(Value::as_str))
        .map(|t| t.trim().to_string())
        .collect()
}

// ── cloud-extract ────────────────────────────────────────────────────────

pub async fn extract_cloud(ctx: &PipelineContext) -> Result<StageReport, PipelineError> {
    let mut report = StageReport::new(EXTRACT_STAGE);

    let pdfs = validated_or_staged(ctx, &mut report).await?;
    if pdfs.is_empty() {
        info!("No validated PDFs to submit");
        return Ok(report);
    }

    ctx.extractor.authenticate().await?;

    let output_dir = &ctx.config.output_dir;
    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(|e| PipelineError::io(output_dir, e))?;

    for pdf in &pdfs {
        ctx.progress.on_item(EXTRACT_STAGE, &pdf.object);
        match extract_one(ctx, pdf).await? {
            Ok(()) => report.processed += 1,
            Err(e) => {
                error!("{}", e);
                report.record_failure(e);
            }
        }
    }

    info!(
        "Cloud extraction: {} processed, {} failures",
        report.processed,
        report.failed.len()
    );
    Ok(report)
}

async fn extract_one(
    ctx: &PipelineContext,
    pdf: &ValidatedPdf,
) -> Result<Result<(), FileError>, PipelineError> {
    let config = &ctx.config;
    let folder = result_folder_name(&pdf.stem());

    let data = match tokio::fs::read(&pdf.local_path).await {
        Ok(d) => d,
        Err(e) => {
            return Ok(Err(FileError::Read {
                name: pdf.object.clone(),
                detail: e.to_string(),
            }))
        }
    };

    info!("Submitting {} to the extraction service", pdf.object);
    let archive = match run_extract_job(
        ctx.extractor.as_ref(),
        data,
        Duration::from_millis(config.poll_interval_ms),
        Duration::from_secs(config.poll_timeout_secs),
    )
    .await
    {
        Ok(bytes) => bytes,
        Err(e) => {
            return Ok(Err(FileError::Service {
                name: pdf.object.clone(),
                kind: e.kind().to_string(),
                detail: e.to_string(),
            }))
        }
    };

    let zip_path = config.output_dir.join(format!("{folder}.zip"));
    tokio::fs::write(&zip_path, &archive)
        .await
        .map_err(|e| PipelineError::io(&zip_path, e))?;
    info!("Saved result archive to {}", zip_path.display());

    let dest = config.output_dir.join(&folder);
    let unpack = {
        let (zip_path, dest) = (zip_path.clone(), dest.clone());
        blocking(move || Ok(unzip_archive(&zip_path, &dest))).await?
    };
    let files = match unpack {
        Ok(files) => files,
        Err(detail) => {
            return Ok(Err(FileError::Archive {
                name: zip_path.display().to_string(),
                detail,
            }))
        }
    };
    debug!("Unpacked {} files into {}", files.len(), dest.display());

    log_headings(&pdf.object, &dest.join(STRUCTURED_DATA)).await;
    Ok(Ok(()))
}

async fn log_headings(object: &str, structured: &Path) {
    let raw = match tokio::fs::read(structured).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!("{}: no {} in result ({})", object, STRUCTURED_DATA, e);
            return;
        }
    };
    match serde_json::from_slice::<Value>(&raw) {
        Ok(doc) => {
            for heading in h1_headings(&doc) {
                info!("{}: H1 {}", object, heading);
            }
        }
        Err(e) => warn!("{}: unreadable {}: {}", object, STRUCTURED_DATA, e),
    }
}

// ── cloud-upload ─────────────────────────────────────────────────────────

pub async fn upload_cloud_outputs(ctx: &PipelineContext) -> Result<StageReport, PipelineError> {
    let mut report = StageReport::new(UPLOAD_STAGE);
    let output_dir = ctx.config.output_dir.clone();

    let present = tokio::fs::try_exists(&output_dir)
        .await
        .map_err(|e| PipelineError::io(&output_dir, e))?;
    if !present {
        info!("No result archives: {} does not exist", output_dir.display());
        return Ok(report);
    }

    let mut archives = Vec::new();
    let mut entries = tokio::fs::read_dir(&output_dir)
        .await
        .map_err(|e| PipelineError::io(&output_dir, e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PipelineError::io(&output_dir, e))?
    {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "zip") {
            archives.push(path);
        }
    }
    archives.sort();
    info!("Found {} result archives in {}", archives.len(), output_dir.display());

    for archive in archives {
        let Some(folder) = archive.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        let dir = output_dir.join(&folder);

        if !tokio::fs::try_exists(&dir)
            .await
            .map_err(|e| PipelineError::io(&dir, e))?
        {
            let (a, d) = (archive.clone(), dir.clone());
            if let Err(detail) = blocking(move || Ok(unzip_archive(&a, &d))).await? {
                warn!("Could not unpack {}: {}", archive.display(), detail);
                report.record_failure(FileError::Archive {
                    name: archive.display().to_string(),
                    detail,
                });
                continue;
            }
        }

        let walk_root = dir.clone();
        let files = blocking(move || -> Result<Vec<PathBuf>, PipelineError> {
            let mut out = Vec::new();
            for entry in WalkDir::new(&walk_root).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    PipelineError::io(&walk_root, std::io::Error::other(e.to_string()))
                })?;
                if entry.file_type().is_file() {
                    out.push(entry.into_path());
                }
            }
            Ok(out)
        })
        .await?;

        for file in files {
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let object = cloud_object_name(&ctx.config.cloud_extracted_folder, &folder, &file_name);
            ctx.progress.on_item(UPLOAD_STAGE, &object);

            let data = match tokio::fs::read(&file).await {
                Ok(d) => d,
                Err(e) => {
                    report.record_failure(FileError::Read {
                        name: file.display().to_string(),
                        detail: e.to_string(),
                    });
                    continue;
                }
            };
            match ctx.store.put(&object, data, content_type_for(&file_name)).await {
                Ok(()) => {
                    debug!("Uploaded {} → {}", file.display(), object);
                    report.processed += 1;
                }
                Err(e) => {
                    error!("Failed to upload {}: {}", file.display(), e);
                    report.record_failure(FileError::Upload {
                        name: object,
                        detail: e.to_string(),
                    });
                }
            }
        }
    }

    info!("Uploaded {} cloud result files", report.processed);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, data) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn object_names_flatten_into_folder() {
        assert_eq!(
            cloud_object_name("adobe_extracted/", "extract_abc", "fileoutpart0.png"),
            "adobe_extracted/extract_abc/extract_abc_fileoutpart0.png"
        );
        assert_eq!(result_folder_name("abc"), "extract_abc");
    }

    #[test]
    fn headings_are_h1_only() {
        let doc = json!({
            "elements": [
                {"Path": "//Document/H1", "Text": "Title "},
                {"Path": "//Document/P", "Text": "Body"},
                {"Path": "//Document/Sect/H1", "Text": "Second"},
                {"Path": "//Document/H2", "Text": "Sub"}
            ]
        });
        assert_eq!(h1_headings(&doc), ["Title", "Second"]);
        assert!(h1_headings(&json!({})).is_empty());
    }

    #[test]
    fn unzip_writes_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("extract_a.zip");
        write_zip(
            &archive,
            &[
                ("structuredData.json", b"{}"),
                ("figures/fileoutpart0.png", b"png"),
            ],
        );
        let dest = dir.path().join("extract_a");
        let files = unzip_archive(&archive, &dest).unwrap();
        assert_eq!(files.len(), 2);
        assert!(dest.join("figures/fileoutpart0.png").is_file());
    }

    #[test]
    fn unzip_refuses_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("../escape.txt", b"x")]);
        let err = unzip_archive(&archive, &dir.path().join("out")).unwrap_err();
        assert!(err.contains("unsafe"), "got: {err}");
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn unzip_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bad.zip");
        std::fs::write(&archive, b"not a zip").unwrap();
        assert!(unzip_archive(&archive, &dir.path().join("out")).is_err());
    }
}
