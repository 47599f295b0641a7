//! Analytical warehouse: fixed table schemas, full-overwrite loads and the
//! parameterized reads the serving layer depends on.
//!
//! [`bigquery::BigQueryWarehouse`] is the production backend;
//! [`sqlite::SqliteWarehouse`] implements the same contract on a local file.
//! Queries in this module are written in the SQL subset both accept.

pub mod bigquery;
pub mod sqlite;

use crate::config::TableNames;
use crate::error::PipelineError;
use crate::record::{
    CloudRecord, ExtractionMethod, ExtractionResult, OpenSourceRecord, Question,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

pub use bigquery::BigQueryWarehouse;
pub use sqlite::SqliteWarehouse;

/// One table row, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

// ── Schemas ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    String,
    Integer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnMode {
    Nullable,
    Required,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    pub mode: ColumnMode,
}

impl Column {
    pub fn nullable(name: &str, ty: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            mode: ColumnMode::Nullable,
        }
    }

    pub fn required(name: &str, ty: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            mode: ColumnMode::Required,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<Column>,
}

impl TableSchema {
    /// Combined benchmark metadata.
    pub fn metadata(table: &str) -> Self {
        use ColumnType::*;
        Self {
            table: table.to_string(),
            columns: vec![
                Column::nullable("task_id", String),
                Column::nullable("question", String),
                Column::nullable("level", Integer),
                Column::nullable("final_answer", String),
                Column::nullable("file_name", String),
                Column::nullable("annotator_metadata", String),
                Column::nullable("dataset_source", String),
                Column::nullable("file_path", String),
            ],
        }
    }

    /// Open-source extraction output.
    pub fn opensource(table: &str) -> Self {
        use ColumnType::*;
        Self {
            table: table.to_string(),
            columns: vec![
                Column::nullable("task_id", String),
                Column::nullable("pdf_filename", String),
                Column::nullable("extracted_text_length", Integer),
                Column::nullable("image_count", Integer),
                Column::nullable("image_paths", String),
                Column::nullable("extracted_text", String),
            ],
        }
    }

    /// Cloud extraction output.
    pub fn cloud(table: &str) -> Self {
        use ColumnType::*;
        Self {
            table: table.to_string(),
            columns: vec![
                Column::nullable("task_id", String),
                Column::nullable("source", String),
                Column::nullable("file_path", String),
                Column::nullable("text", String),
            ],
        }
    }

    /// Serving-layer user accounts.
    pub fn users(table: &str) -> Self {
        use ColumnType::*;
        Self {
            table: table.to_string(),
            columns: vec![
                Column::required("username", String),
                Column::nullable("email", String),
                Column::required("hashed_password", String),
            ],
        }
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// A named scalar `STRING` query parameter, referenced as `@name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParam {
    pub name: String,
    pub value: String,
}

impl QueryParam {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Fully-qualified, quoted reference to `table`, ready to splice into SQL.
    fn table_ref(&self, table: &str) -> String;

    /// Create the table if it is missing. Returns `true` when it was created.
    async fn ensure_table(&self, schema: &TableSchema) -> Result<bool, PipelineError>;

    /// Replace the table's contents with `rows` and return the committed row
    /// count. Returns only after the load is durable.
    async fn load_table(&self, schema: &TableSchema, rows: Vec<Row>) -> Result<u64, PipelineError>;

    /// Run a read query with named parameters.
    async fn query(&self, sql: &str, params: &[QueryParam]) -> Result<Vec<Row>, PipelineError>;
}

/// Convert a record into a warehouse row.
pub fn to_row<T: Serialize>(record: &T) -> Result<Row, PipelineError> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(PipelineError::Internal(format!(
            "record serialized to {other}, expected an object"
        ))),
        Err(e) => Err(PipelineError::Internal(format!("record serialization failed: {e}"))),
    }
}

fn from_row<T: DeserializeOwned>(table: &str, mut row: Row) -> Result<T, PipelineError> {
    row.retain(|_, v| !v.is_null());
    serde_json::from_value(Value::Object(row)).map_err(|e| PipelineError::warehouse(table, e))
}

// ── Serving-layer reads ──────────────────────────────────────────────────

/// Extracted data for `task_id` from the table of the given method, or
/// `None` when no row matches.
pub async fn fetch_extracted(
    warehouse: &dyn Warehouse,
    tables: &TableNames,
    task_id: &str,
    method: ExtractionMethod,
) -> Result<Option<ExtractionResult>, PipelineError> {
    let (table, columns) = match method {
        ExtractionMethod::OpenSource => (
            &tables.opensource,
            "task_id, pdf_filename, extracted_text, extracted_text_length, image_count, image_paths",
        ),
        ExtractionMethod::Cloud => (&tables.cloud, "task_id, source, file_path, text"),
    };
    let sql = format!(
        "SELECT {columns} FROM {} WHERE task_id = @task_id LIMIT 1",
        warehouse.table_ref(table)
    );

    let rows = warehouse
        .query(&sql, &[QueryParam::new("task_id", task_id)])
        .await?;
    let Some(row) = rows.into_iter().next() else {
        debug!("No extracted data found for {} ({})", task_id, method);
        return Ok(None);
    };

    let result = match method {
        ExtractionMethod::OpenSource => {
            ExtractionResult::OpenSource(from_row::<OpenSourceRecord>(table, row)?)
        }
        ExtractionMethod::Cloud => ExtractionResult::Cloud(from_row::<CloudRecord>(table, row)?),
    };
    Ok(Some(result))
}

/// Benchmark questions that come with a PDF attachment, ordered by question.
pub async fn list_questions(
    warehouse: &dyn Warehouse,
    tables: &TableNames,
) -> Result<Vec<Question>, PipelineError> {
    let sql = format!(
        "SELECT DISTINCT question, task_id FROM {} \
         WHERE LOWER(file_name) LIKE '%.pdf' ORDER BY question",
        warehouse.table_ref(&tables.metadata)
    );
    warehouse
        .query(&sql, &[])
        .await?
        .into_iter()
        .map(|row| from_row::<Question>(&tables.metadata, row))
        .collect()
}
