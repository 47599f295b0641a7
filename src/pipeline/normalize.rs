//! Record normalizers: turn extraction artifacts in the bucket into
//! warehouse records.

use super::text::clean_text;
use super::{PipelineContext, StageReport};
use crate::error::{FileError, PipelineError};
use crate::record::{CloudRecord, OpenSourceRecord};
use crate::storage::basename;
use serde_json::Value;
use tracing::{debug, info, warn};

const STRUCTURED_SUFFIX: &str = "_structuredData.json";

/// `extracted_data/abc123/abc123.json` → `abc123`.
pub fn opensource_task_id(name: &str) -> Option<String> {
    basename(name)
        .strip_suffix(".json")
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Second underscore-delimited token of a result folder name:
/// `source42_docXYZ` → `docXYZ`, `extract_abc` → `abc`. Names without a
/// second token have no task id.
pub fn cloud_task_id(source: &str) -> Option<String> {
    source
        .split('_')
        .nth(1)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Parent folder of an object: `root/extract_a/extract_a_x.json` → `extract_a`.
pub fn parent_folder(name: &str) -> Option<&str> {
    let mut parts = name.rsplit('/');
    parts.next()?;
    parts.next().filter(|p| !p.is_empty())
}

fn as_count(v: Option<&Value>) -> Option<i64> {
    match v? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_empty_doc(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Build an open-source record from one artifact, or `None` when a critical
/// field is missing: empty `pdf_filename`, non-positive or absent
/// `extracted_text_length`, or empty text after cleaning. `image_count` is
/// not checked.
pub fn opensource_record(task_id: &str, artifact: &Value) -> Option<OpenSourceRecord> {
    let pdf_filename = artifact
        .get("pdf_filename")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let extracted_text_length = as_count(artifact.get("extracted_text_length"));
    let extracted_text = clean_text(
        artifact
            .get("extracted_text")
            .and_then(Value::as_str)
            .unwrap_or_default(),
    );

    if pdf_filename.is_empty()
        || !extracted_text_length.is_some_and(|n| n > 0)
        || extracted_text.is_empty()
    {
        return None;
    }

    let image_paths = artifact
        .get("image_paths")
        .cloned()
        .unwrap_or_else(|| Value::Array(Vec::new()));

    Some(OpenSourceRecord {
        task_id: task_id.to_string(),
        pdf_filename: pdf_filename.to_string(),
        extracted_text_length,
        image_count: as_count(artifact.get("image_count")),
        image_paths: image_paths.to_string(),
        extracted_text,
    })
}

/// Element texts joined by single spaces; elements without `Text` add an
/// empty token.
pub fn structured_text(doc: &Value) -> String {
    doc.get("elements")
        .and_then(Value::as_array)
        .map(|elements| {
            elements
                .iter()
                .map(|el| el.get("Text").and_then(Value::as_str).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

/// Fetch and parse one JSON object; per-file failures are recorded.
async fn read_json(
    ctx: &PipelineContext,
    name: &str,
    report: &mut StageReport,
) -> Option<Value> {
    let data = match ctx.store.get(name).await {
        Ok(d) => d,
        Err(e) => {
            warn!("Could not read {}: {}", name, e);
            report.record_failure(FileError::Read {
                name: name.to_string(),
                detail: e.to_string(),
            });
            return None;
        }
    };
    match serde_json::from_slice::<Value>(&data) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("Could not decode {}: {}", name, e);
            report.record_failure(FileError::Decode {
                name: name.to_string(),
                detail: e.to_string(),
            });
            None
        }
    }
}

/// Read every open-source JSON artifact under the extraction prefix.
pub async fn normalize_opensource(
    ctx: &PipelineContext,
    report: &mut StageReport,
) -> Result<Vec<OpenSourceRecord>, PipelineError> {
    let names = ctx.store.list(&ctx.config.extraction_prefix).await?;
    let mut records = Vec::new();

    for name in names.iter().filter(|n| n.ends_with(".json")) {
        ctx.progress.on_item(&report.stage, name);
        let Some(task_id) = opensource_task_id(name) else {
            report.skipped += 1;
            continue;
        };
        let Some(doc) = read_json(ctx, name, report).await else {
            continue;
        };
        if is_empty_doc(&doc) {
            debug!("Skipping empty artifact {}", name);
            report.skipped += 1;
            continue;
        }
        match opensource_record(&task_id, &doc) {
            Some(record) => {
                records.push(record);
                report.processed += 1;
            }
            None => {
                warn!("Dropping {}: missing pdf_filename, text length or text", name);
                report.rejected += 1;
            }
        }
    }

    info!(
        "Normalized {} open-source records ({} rejected)",
        records.len(),
        report.rejected
    );
    Ok(records)
}

/// Read every `*_structuredData.json` published by the cloud upload stage.
pub async fn normalize_cloud(
    ctx: &PipelineContext,
    report: &mut StageReport,
) -> Result<Vec<CloudRecord>, PipelineError> {
    let prefix = format!("{}/", ctx.config.cloud_extracted_folder.trim_end_matches('/'));
    let names = ctx.store.list(&prefix).await?;
    let mut records = Vec::new();

    for name in names.iter().filter(|n| n.ends_with(STRUCTURED_SUFFIX)) {
        ctx.progress.on_item(&report.stage, name);
        let Some(source) = parent_folder(name) else {
            report.skipped += 1;
            continue;
        };
        let Some(task_id) = cloud_task_id(source) else {
            warn!("Skipping {}: folder '{}' has no task id token", name, source);
            report.skipped += 1;
            continue;
        };
        let Some(doc) = read_json(ctx, name, report).await else {
            continue;
        };
        if is_empty_doc(&doc) {
            debug!("Skipping empty document {}", name);
            report.skipped += 1;
            continue;
        }

        records.push(CloudRecord {
            task_id,
            source: source.to_string(),
            file_path: ctx.store.uri(name),
            text: structured_text(&doc),
        });
        report.processed += 1;
    }

    info!("Normalized {} cloud records", records.len());
    Ok(records)
}
