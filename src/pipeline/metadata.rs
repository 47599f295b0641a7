//! Metadata normalizer: benchmark JSONL → CSV with a `dataset_source` column.

use super::{PipelineContext, StageReport};
use crate::config::MetadataSource;
use crate::error::{FileError, PipelineError};
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{info, warn};

pub const STAGE: &str = "normalize-metadata";

/// Convert one JSONL document to CSV.
///
/// Blank lines are skipped. Every record gets `dataset_source = label`. The
/// header is the union of keys across all records in first-seen order, and
/// records missing a key get an empty cell. String values are written as-is;
/// other values as compact JSON.
///
/// Returns the CSV bytes and the number of records. A malformed or
/// non-object line fails the whole document.
pub fn jsonl_to_csv(name: &str, data: &[u8], label: &str) -> Result<(Vec<u8>, usize), FileError> {
    let text = std::str::from_utf8(data).map_err(|e| FileError::Decode {
        name: name.to_string(),
        detail: e.to_string(),
    })?;

    let mut records: Vec<Map<String, Value>> = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let malformed = |detail: String| FileError::MalformedMetadata {
            name: name.to_string(),
            line: idx + 1,
            detail,
        };
        let mut record = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => map,
            Ok(other) => return Err(malformed(format!("expected a JSON object, got {other}"))),
            Err(e) => return Err(malformed(e.to_string())),
        };
        record.insert("dataset_source".to_string(), Value::String(label.to_string()));
        records.push(record);
    }

    if records.is_empty() {
        return Ok((Vec::new(), 0));
    }

    let mut header: Vec<&str> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for record in &records {
        for key in record.keys() {
            if seen.insert(key.as_str()) {
                header.push(key.as_str());
            }
        }
    }

    let write_err = |e: csv::Error| FileError::Decode {
        name: name.to_string(),
        detail: format!("CSV write failed: {e}"),
    };
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&header).map_err(write_err)?;
    for record in &records {
        writer
            .write_record(header.iter().map(|k| cell(record.get(*k))))
            .map_err(write_err)?;
    }
    let bytes = writer.into_inner().map_err(|e| FileError::Decode {
        name: name.to_string(),
        detail: format!("CSV flush failed: {e}"),
    })?;

    Ok((bytes, records.len()))
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

pub async fn normalize_metadata(ctx: &PipelineContext) -> Result<StageReport, PipelineError> {
    let mut report = StageReport::new(STAGE);

    for source in &ctx.config.metadata_sources {
        ctx.progress.on_item(STAGE, &source.object);
        if let Err(e) = normalize_one(ctx, source).await? {
            warn!("{}", e);
            report.record_failure(e);
            continue;
        }
        report.processed += 1;
    }

    Ok(report)
}

/// Outer error aborts the stage (upload failure); inner error is per-file.
async fn normalize_one(
    ctx: &PipelineContext,
    source: &MetadataSource,
) -> Result<Result<(), FileError>, PipelineError> {
    let data = match ctx.store.get(&source.object).await {
        Ok(d) => d,
        Err(e) => {
            return Ok(Err(FileError::Read {
                name: source.object.clone(),
                detail: e.to_string(),
            }))
        }
    };

    let (csv_bytes, rows) = match jsonl_to_csv(&source.object, &data, &source.label) {
        Ok(out) => out,
        Err(e) => return Ok(Err(e)),
    };
    if rows == 0 {
        warn!("{} contains no records; uploading an empty CSV", source.object);
    }

    let target = format!("{}{}", ctx.config.cleaned_prefix, source.csv_name);
    ctx.store.put(&target, csv_bytes, "text/csv").await?;
    info!("Normalized {} → {} ({} rows)", source.object, target, rows);
    Ok(Ok(()))
}
