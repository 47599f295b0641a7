//! Warehouse loader: full-overwrite loads of the three record tables and the
//! users table bootstrap.

use super::normalize::{normalize_cloud, normalize_opensource};
use super::{PipelineContext, StageReport};
use crate::error::{FileError, PipelineError};
use crate::record::{CloudRecord, OpenSourceRecord, TaskRecord};
use crate::storage::basename;
use crate::warehouse::{to_row, TableSchema};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

pub const METADATA_STAGE: &str = "load-metadata";
pub const OPENSOURCE_STAGE: &str = "load-opensource";
pub const CLOUD_STAGE: &str = "load-cloud";
pub const USERS_STAGE: &str = "ensure-users";

/// Something with a warehouse join key.
pub trait Keyed {
    fn task_id(&self) -> &str;
}

impl Keyed for TaskRecord {
    fn task_id(&self) -> &str {
        &self.task_id
    }
}

impl Keyed for OpenSourceRecord {
    fn task_id(&self) -> &str {
        &self.task_id
    }
}

impl Keyed for CloudRecord {
    fn task_id(&self) -> &str {
        &self.task_id
    }
}

/// Collapse records sharing a `task_id`: the last one wins and takes the
/// position of the first. Returns the kept records and the number dropped.
pub fn dedupe_by_task_id<T: Keyed>(records: Vec<T>) -> (Vec<T>, usize) {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<T> = Vec::with_capacity(records.len());
    let mut dropped = 0;

    for record in records {
        let key = record.task_id().to_string();
        match index.get(&key) {
            Some(&pos) => {
                warn!("Duplicate task_id '{}': keeping the later record", key);
                out[pos] = record;
                dropped += 1;
            }
            None => {
                index.insert(key, out.len());
                out.push(record);
            }
        }
    }
    (out, dropped)
}

/// Dedupe, convert and overwrite `schema.table` with `records`.
///
/// An empty record set leaves the table untouched.
pub async fn load_records<T: Keyed + Serialize>(
    ctx: &PipelineContext,
    schema: &TableSchema,
    records: Vec<T>,
    report: &mut StageReport,
) -> Result<(), PipelineError> {
    if records.is_empty() {
        info!("No records for {}; skipping load", schema.table);
        return Ok(());
    }

    let (records, dropped) = dedupe_by_task_id(records);
    report.skipped += dropped;

    let rows = records.iter().map(to_row).collect::<Result<Vec<_>, _>>()?;
    let loaded = ctx.warehouse.load_table(schema, rows).await?;
    info!("Loaded {} rows into {}", loaded, ctx.warehouse.table_ref(&schema.table));
    report.rows_loaded = Some(loaded);
    Ok(())
}

// ── load-metadata ────────────────────────────────────────────────────────

/// Parse a normalized metadata CSV; rows that fail to decode are recorded
/// and skipped.
pub fn parse_metadata_csv(name: &str, data: &[u8], report: &mut StageReport) -> Vec<TaskRecord> {
    let mut rdr = csv::Reader::from_reader(data);
    let mut out = Vec::new();
    for (idx, row) in rdr.deserialize::<TaskRecord>().enumerate() {
        match row {
            Ok(record) => out.push(record),
            Err(e) => {
                warn!("{}: skipping row {}: {}", name, idx + 1, e);
                report.record_failure(FileError::Decode {
                    name: format!("{name}#{}", idx + 1),
                    detail: e.to_string(),
                });
            }
        }
    }
    out
}

/// Fill in `file_path` from the staged-file index and fall back to
/// `file_name` for records without a `task_id`.
pub fn resolve_record(mut record: TaskRecord, urls: &HashMap<String, String>) -> TaskRecord {
    record.file_path = if record.file_name.is_empty() {
        None
    } else {
        urls.get(&record.file_name).cloned()
    };
    if record.task_id.is_empty() {
        record.task_id = record.file_name.clone();
    }
    record
}

pub async fn load_metadata(ctx: &PipelineContext) -> Result<StageReport, PipelineError> {
    let config = &ctx.config;
    let mut report = StageReport::new(METADATA_STAGE);

    // Basename → browser URL of every staged dataset file.
    let urls: HashMap<String, String> = ctx
        .store
        .list(&config.dataset_prefix)
        .await?
        .into_iter()
        .map(|name| (basename(&name).to_string(), ctx.store.browser_url(&name)))
        .collect();

    let mut records = Vec::new();
    for source in &config.metadata_sources {
        let name = format!("{}{}", config.cleaned_prefix, source.csv_name);
        ctx.progress.on_item(METADATA_STAGE, &name);

        let data = match ctx.store.get(&name).await {
            Ok(d) => d,
            Err(e) => {
                warn!("Skipping {}: {}", name, e);
                report.skipped += 1;
                continue;
            }
        };
        let rows = parse_metadata_csv(&name, &data, &mut report);
        info!("Read {} metadata rows from {}", rows.len(), name);
        report.processed += 1;
        records.extend(rows.into_iter().map(|r| resolve_record(r, &urls)));
    }

    let schema = TableSchema::metadata(&config.tables.metadata);
    load_records(ctx, &schema, records, &mut report).await?;
    Ok(report)
}

// ── load-opensource / load-cloud ─────────────────────────────────────────

pub async fn load_opensource(ctx: &PipelineContext) -> Result<StageReport, PipelineError> {
    let mut report = StageReport::new(OPENSOURCE_STAGE);
    let records = normalize_opensource(ctx, &mut report).await?;
    let schema = TableSchema::opensource(&ctx.config.tables.opensource);
    load_records(ctx, &schema, records, &mut report).await?;
    Ok(report)
}

pub async fn load_cloud(ctx: &PipelineContext) -> Result<StageReport, PipelineError> {
    let mut report = StageReport::new(CLOUD_STAGE);
    let records = normalize_cloud(ctx, &mut report).await?;
    let schema = TableSchema::cloud(&ctx.config.tables.cloud);
    load_records(ctx, &schema, records, &mut report).await?;
    Ok(report)
}

// ── ensure-users ─────────────────────────────────────────────────────────

pub async fn ensure_users(ctx: &PipelineContext) -> Result<StageReport, PipelineError> {
    let mut report = StageReport::new(USERS_STAGE);
    let schema = TableSchema::users(&ctx.config.tables.users);
    if ctx.warehouse.ensure_table(&schema).await? {
        info!("Created table {}", ctx.warehouse.table_ref(&schema.table));
        report.processed = 1;
    } else {
        info!("Table {} already exists", ctx.warehouse.table_ref(&schema.table));
        report.skipped = 1;
    }
    Ok(report)
}
