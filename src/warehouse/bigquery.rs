//! BigQuery backend over the REST API.
//!
//! * reads: `jobs.query` with NAMED parameters, then `getQueryResults`
//!   until the job is complete and every page is fetched;
//! * table creation: `tables.insert`, where 409 means the table exists;
//! * loads: a multipart NDJSON upload job with `WRITE_TRUNCATE`, polled via
//!   `jobs.get` until `DONE`.
//!
//! Every request asks the [`AccessTokenProvider`] for a token, so a
//! refreshing provider keeps long load and poll loops authenticated.

use super::{ColumnMode, ColumnType, QueryParam, Row, TableSchema, Warehouse};
use crate::auth::AccessTokenProvider;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::http::{build_client, send_with_retry, RetryPolicy};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::{debug, info};

const API_BASE: &str = "https://bigquery.googleapis.com";
const MULTIPART_BOUNDARY: &str = "docpipe_load_boundary";

static JOB_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct BigQueryWarehouse {
    client: Client,
    project_id: String,
    dataset_id: String,
    auth: Option<Arc<dyn AccessTokenProvider>>,
    base_url: String,
    retry: RetryPolicy,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl std::fmt::Debug for BigQueryWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigQueryWarehouse")
            .field("project_id", &self.project_id)
            .field("dataset_id", &self.dataset_id)
            .field("auth", &self.auth)
            .finish()
    }
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    schema: Option<ResultSchema>,
    #[serde(default)]
    rows: Vec<ResultRow>,
    page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResultSchema {
    #[serde(default)]
    fields: Vec<ResultField>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResultField {
    name: String,
    #[serde(rename = "type")]
    ty: String,
}

#[derive(Debug, Deserialize)]
struct ResultRow {
    #[serde(default)]
    f: Vec<ResultCell>,
}

#[derive(Debug, Deserialize)]
struct ResultCell {
    v: Value,
}

#[derive(Debug, Deserialize)]
struct Job {
    status: JobState,
    #[serde(default)]
    statistics: Option<JobStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobState {
    state: String,
    error_result: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JobStatistics {
    load: Option<LoadStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatistics {
    output_rows: Option<String>,
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn type_name(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::String => "STRING",
        ColumnType::Integer => "INTEGER",
    }
}

fn mode_name(mode: ColumnMode) -> &'static str {
    match mode {
        ColumnMode::Nullable => "NULLABLE",
        ColumnMode::Required => "REQUIRED",
    }
}

fn schema_json(schema: &TableSchema) -> Value {
    let fields: Vec<Value> = schema
        .columns
        .iter()
        .map(|c| json!({ "name": c.name, "type": type_name(c.ty), "mode": mode_name(c.mode) }))
        .collect();
    json!({ "fields": fields })
}

fn params_json(params: &[QueryParam]) -> Vec<Value> {
    params
        .iter()
        .map(|p| {
            json!({
                "name": p.name,
                "parameterType": { "type": "STRING" },
                "parameterValue": { "value": p.value },
            })
        })
        .collect()
}

/// Decode `f`/`v` cells; BigQuery encodes every scalar as a string.
fn decode_rows(schema: &ResultSchema, rows: Vec<ResultRow>) -> Vec<Row> {
    rows.into_iter()
        .map(|r| {
            schema
                .fields
                .iter()
                .zip(r.f)
                .map(|(field, cell)| {
                    let value = match (field.ty.as_str(), cell.v) {
                        ("INTEGER" | "INT64", Value::String(s)) => s
                            .parse::<i64>()
                            .map(Value::from)
                            .unwrap_or(Value::String(s)),
                        (_, v) => v,
                    };
                    (field.name.clone(), value)
                })
                .collect()
        })
        .collect()
}

/// NDJSON body restricted to the schema's columns.
fn ndjson(schema: &TableSchema, rows: &[Row]) -> Result<Vec<u8>, PipelineError> {
    let mut out = Vec::new();
    for row in rows {
        let projected: Row = schema
            .column_names()
            .map(|name| (name.to_string(), row.get(name).cloned().unwrap_or(Value::Null)))
            .collect();
        serde_json::to_writer(&mut out, &projected)
            .map_err(|e| PipelineError::warehouse(&schema.table, e))?;
        out.push(b'\n');
    }
    Ok(out)
}

fn multipart_body(metadata: &Value, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len() + 1024);
    body.extend_from_slice(format!("--{MULTIPART_BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(format!("\r\n--{MULTIPART_BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
    body
}

fn authed(req: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(t) => req.bearer_auth(t),
        None => req,
    }
}

fn job_id(table: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let seq = JOB_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("docpipe_load_{table}_{millis}_{seq}")
}

// ── Client ───────────────────────────────────────────────────────────────

impl BigQueryWarehouse {
    /// `project_id` and `dataset_id` are required; empty values raise
    /// `MissingConfig` (`PROJECT_ID` / `DATASET_ID`). Without `auth`,
    /// requests carry no `Authorization` header (emulators).
    pub fn new(
        config: &PipelineConfig,
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        auth: Option<Arc<dyn AccessTokenProvider>>,
    ) -> Result<Self, PipelineError> {
        let project_id = project_id.into();
        let dataset_id = dataset_id.into();
        if project_id.trim().is_empty() {
            return Err(PipelineError::MissingConfig {
                key: "PROJECT_ID".into(),
            });
        }
        if dataset_id.trim().is_empty() {
            return Err(PipelineError::MissingConfig {
                key: "DATASET_ID".into(),
            });
        }
        Ok(Self {
            client: build_client(config.request_timeout_secs)?,
            project_id,
            dataset_id,
            auth,
            base_url: API_BASE.to_string(),
            retry: config.retry_policy(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            poll_timeout: Duration::from_secs(config.poll_timeout_secs),
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn api(&self, path: &str) -> String {
        format!("{}/bigquery/v2/projects/{}{}", self.base_url, self.project_id, path)
    }

    async fn bearer(&self) -> Result<Option<String>, PipelineError> {
        match &self.auth {
            Some(auth) => auth.access_token().await.map(Some),
            None => Ok(None),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        what: &str,
        table: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, PipelineError> {
        let token = self.bearer().await?;
        let resp = send_with_retry(what, &self.retry, || {
            authed(self.client.get(url).query(query), token.as_deref())
        })
        .await
        .map_err(|f| PipelineError::warehouse(table, f))?;
        resp.json().await.map_err(|e| PipelineError::warehouse(table, e))
    }

    async fn wait_for_load(&self, table: &str, job: &JobReference) -> Result<u64, PipelineError> {
        let url = self.api(&format!("/jobs/{}", job.job_id));
        let mut query = Vec::new();
        if let Some(loc) = &job.location {
            query.push(("location", loc.clone()));
        }
        let started = Instant::now();

        loop {
            let status: Job = self.get_json("bigquery job", table, &url, &query).await?;
            if status.status.state == "DONE" {
                if let Some(err) = status.status.error_result {
                    return Err(PipelineError::warehouse(table, err));
                }
                let rows = status
                    .statistics
                    .and_then(|s| s.load)
                    .and_then(|l| l.output_rows)
                    .and_then(|n| n.parse::<u64>().ok())
                    .unwrap_or(0);
                return Ok(rows);
            }
            if started.elapsed() >= self.poll_timeout {
                return Err(PipelineError::WarehouseTimeout {
                    job_id: job.job_id.clone(),
                    secs: self.poll_timeout.as_secs(),
                });
            }
            debug!("load job {} is {}", job.job_id, status.status.state);
            sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    fn table_ref(&self, table: &str) -> String {
        format!("`{}.{}.{}`", self.project_id, self.dataset_id, table)
    }

    async fn ensure_table(&self, schema: &TableSchema) -> Result<bool, PipelineError> {
        let url = self.api(&format!("/datasets/{}/tables", self.dataset_id));
        let body = json!({
            "tableReference": {
                "projectId": self.project_id,
                "datasetId": self.dataset_id,
                "tableId": schema.table,
            },
            "schema": schema_json(schema),
        });

        let token = self.bearer().await?;
        match send_with_retry("bigquery tables.insert", &self.retry, || {
            authed(self.client.post(&url).json(&body), token.as_deref())
        })
        .await
        {
            Ok(_) => Ok(true),
            Err(f) if f.is_status(409) => Ok(false),
            Err(f) => Err(PipelineError::warehouse(&schema.table, f)),
        }
    }

    async fn load_table(&self, schema: &TableSchema, rows: Vec<Row>) -> Result<u64, PipelineError> {
        let job_id = job_id(&schema.table);
        let metadata = json!({
            "jobReference": { "projectId": self.project_id, "jobId": job_id },
            "configuration": {
                "load": {
                    "destinationTable": {
                        "projectId": self.project_id,
                        "datasetId": self.dataset_id,
                        "tableId": schema.table,
                    },
                    "schema": schema_json(schema),
                    "sourceFormat": "NEWLINE_DELIMITED_JSON",
                    "writeDisposition": "WRITE_TRUNCATE",
                    "createDisposition": "CREATE_IF_NEEDED",
                }
            }
        });
        let body = multipart_body(&metadata, &ndjson(schema, &rows)?);
        let url = format!(
            "{}/upload/bigquery/v2/projects/{}/jobs?uploadType=multipart",
            self.base_url, self.project_id
        );
        let content_type = format!("multipart/related; boundary={MULTIPART_BOUNDARY}");

        let token = self.bearer().await?;
        let resp = send_with_retry("bigquery load", &self.retry, || {
            authed(
                self.client
                    .post(&url)
                    .header(reqwest::header::CONTENT_TYPE, content_type.as_str())
                    .body(body.clone()),
                token.as_deref(),
            )
        })
        .await
        .map_err(|f| PipelineError::warehouse(&schema.table, f))?;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Inserted {
            job_reference: JobReference,
        }
        let inserted: Inserted = resp
            .json()
            .await
            .map_err(|e| PipelineError::warehouse(&schema.table, e))?;

        let count = self.wait_for_load(&schema.table, &inserted.job_reference).await?;
        info!("Loaded {} rows into {}", count, self.table_ref(&schema.table));
        Ok(count)
    }

    async fn query(&self, sql: &str, params: &[QueryParam]) -> Result<Vec<Row>, PipelineError> {
        let url = self.api("/queries");
        let body = json!({
            "query": sql,
            "useLegacySql": false,
            "parameterMode": "NAMED",
            "queryParameters": params_json(params),
            "timeoutMs": 10_000,
        });

        let token = self.bearer().await?;
        let resp = send_with_retry("bigquery query", &self.retry, || {
            authed(self.client.post(&url).json(&body), token.as_deref())
        })
        .await
        .map_err(|f| PipelineError::warehouse("query", f))?;
        let mut page: QueryResponse = resp
            .json()
            .await
            .map_err(|e| PipelineError::warehouse("query", e))?;

        let started = Instant::now();
        let mut out = Vec::new();
        let mut schema = page.schema.clone();

        loop {
            if page.job_complete {
                if let Some(s) = page.schema.clone() {
                    schema = Some(s);
                }
                if let Some(s) = &schema {
                    out.extend(decode_rows(s, std::mem::take(&mut page.rows)));
                }
                if page.page_token.as_deref().is_none_or(str::is_empty) {
                    return Ok(out);
                }
            } else if started.elapsed() >= self.poll_timeout {
                let job_id = page
                    .job_reference
                    .map(|j| j.job_id)
                    .unwrap_or_default();
                return Err(PipelineError::WarehouseTimeout {
                    job_id,
                    secs: self.poll_timeout.as_secs(),
                });
            } else {
                sleep(self.poll_interval).await;
            }

            let job = page
                .job_reference
                .clone()
                .ok_or_else(|| PipelineError::warehouse("query", "response has no job reference"))?;
            let mut query = vec![("timeoutMs", "10000".to_string())];
            if let Some(loc) = &job.location {
                query.push(("location", loc.clone()));
            }
            if page.job_complete {
                if let Some(token) = &page.page_token {
                    query.push(("pageToken", token.clone()));
                }
            }
            let results_url = self.api(&format!("/queries/{}", job.job_id));
            page = self
                .get_json("bigquery getQueryResults", "query", &results_url, &query)
                .await?;
        }
    }
}
