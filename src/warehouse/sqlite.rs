//! SQLite warehouse for local runs and tests.
//!
//! Same contract as BigQuery: an overwrite drops, recreates and refills the
//! table inside one transaction, so readers never observe a partial load.

use super::{ColumnMode, ColumnType, QueryParam, Row, TableSchema, Warehouse};
use crate::error::PipelineError;
use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Clone)]
pub struct SqliteWarehouse {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteWarehouse").finish_non_exhaustive()
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn create_sql(schema: &TableSchema) -> String {
    let cols: Vec<String> = schema
        .columns
        .iter()
        .map(|c| {
            let ty = match c.ty {
                ColumnType::String => "TEXT",
                ColumnType::Integer => "INTEGER",
            };
            let null = match c.mode {
                ColumnMode::Nullable => "",
                ColumnMode::Required => " NOT NULL",
            };
            format!("{} {ty}{null}", quote_ident(&c.name))
        })
        .collect();
    format!("CREATE TABLE {} ({})", quote_ident(&schema.table), cols.join(", "))
}

/// JSON cell → SQLite value, coerced to the column's type.
fn to_sql(ty: ColumnType, v: Option<&Value>) -> SqlValue {
    match (ty, v) {
        (_, None) | (_, Some(Value::Null)) => SqlValue::Null,
        (ColumnType::Integer, Some(Value::Number(n))) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Null,
        },
        (ColumnType::Integer, Some(Value::String(s))) => match s.trim().parse::<i64>() {
            Ok(i) => SqlValue::Integer(i),
            Err(_) => SqlValue::Null,
        },
        (_, Some(Value::String(s))) => SqlValue::Text(s.clone()),
        (_, Some(other)) => SqlValue::Text(other.to_string()),
    }
}

fn to_json(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) | ValueRef::Blob(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
    }
}

impl SqliteWarehouse {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            PipelineError::warehouse(path.display().to_string(), format!("failed to open database: {e}"))
        })?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self, PipelineError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PipelineError::warehouse(":memory:", e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, table: String, f: F) -> Result<T, PipelineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let label = table.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| PipelineError::warehouse(&label, "connection lock poisoned"))?;
            f(&mut guard).map_err(|e| PipelineError::warehouse(&label, e))
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("spawn_blocking panicked: {e}")))?
    }
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    fn table_ref(&self, table: &str) -> String {
        quote_ident(table)
    }

    async fn ensure_table(&self, schema: &TableSchema) -> Result<bool, PipelineError> {
        let schema = schema.clone();
        self.with_conn(schema.table.clone(), move |conn| {
            let exists = conn
                .query_row(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [&schema.table],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .is_some();
            if exists {
                return Ok(false);
            }
            conn.execute(&create_sql(&schema), [])?;
            Ok(true)
        })
        .await
    }

    async fn load_table(&self, schema: &TableSchema, rows: Vec<Row>) -> Result<u64, PipelineError> {
        let schema = schema.clone();
        let table = schema.table.clone();

        // NOT NULL violations surface as a rusqlite error and roll back.
        let count = self
            .with_conn(table.clone(), move |conn| {
                let tx = conn.transaction()?;
                tx.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(&schema.table)), [])?;
                tx.execute(&create_sql(&schema), [])?;

                let cols: Vec<String> = schema.column_names().map(quote_ident).collect();
                let placeholders: Vec<String> =
                    (1..=cols.len()).map(|i| format!("?{i}")).collect();
                let insert = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    quote_ident(&schema.table),
                    cols.join(", "),
                    placeholders.join(", ")
                );
                {
                    let mut stmt = tx.prepare(&insert)?;
                    for row in &rows {
                        let values: Vec<SqlValue> = schema
                            .columns
                            .iter()
                            .map(|c| to_sql(c.ty, row.get(&c.name)))
                            .collect();
                        stmt.execute(rusqlite::params_from_iter(values))?;
                    }
                }
                tx.commit()?;
                Ok(rows.len() as u64)
            })
            .await?;

        info!("Loaded {} rows into {}", count, table);
        Ok(count)
    }

    async fn query(&self, sql: &str, params: &[QueryParam]) -> Result<Vec<Row>, PipelineError> {
        let sql = sql.to_string();
        let params = params.to_vec();

        self.with_conn("query".to_string(), move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            for p in &params {
                if let Some(idx) = stmt.parameter_index(&format!("@{}", p.name))? {
                    stmt.raw_bind_parameter(idx, &p.value)?;
                }
            }
            let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

            let mut out = Vec::new();
            let mut rows = stmt.raw_query();
            while let Some(row) = rows.next()? {
                let mut map = Row::new();
                for (i, name) in names.iter().enumerate() {
                    map.insert(name.clone(), to_json(row.get_ref(i)?));
                }
                out.push(map);
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CloudRecord;
    use crate::warehouse::to_row;

    fn cloud_row(task_id: &str, text: &str) -> Row {
        to_row(&CloudRecord {
            task_id: task_id.into(),
            source: format!("extract_{task_id}"),
            file_path: format!("gs://b/adobe_extracted/extract_{task_id}/x.json"),
            text: text.into(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn ensure_table_reports_creation_once() {
        let wh = SqliteWarehouse::in_memory().unwrap();
        let schema = TableSchema::users("users");
        assert!(wh.ensure_table(&schema).await.unwrap());
        assert!(!wh.ensure_table(&schema).await.unwrap());
    }

    #[tokio::test]
    async fn load_overwrites() {
        let wh = SqliteWarehouse::in_memory().unwrap();
        let schema = TableSchema::cloud("cloud_extracted");

        let n = wh
            .load_table(&schema, vec![cloud_row("a", "one"), cloud_row("b", "two")])
            .await
            .unwrap();
        assert_eq!(n, 2);
        let n = wh.load_table(&schema, vec![cloud_row("c", "three")]).await.unwrap();
        assert_eq!(n, 1);

        let rows = wh
            .query(&format!("SELECT task_id FROM {}", wh.table_ref("cloud_extracted")), &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["task_id"], "c");
    }

    #[tokio::test]
    async fn named_parameters_bind() {
        let wh = SqliteWarehouse::in_memory().unwrap();
        let schema = TableSchema::cloud("cloud_extracted");
        wh.load_table(&schema, vec![cloud_row("a", "one"), cloud_row("b", "two")])
            .await
            .unwrap();

        let rows = wh
            .query(
                "SELECT task_id, text FROM \"cloud_extracted\" WHERE task_id = @task_id",
                &[QueryParam::new("task_id", "b")],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["text"], "two");

        // Quotes in the value are data, not SQL.
        let rows = wh
            .query(
                "SELECT task_id FROM \"cloud_extracted\" WHERE task_id = @task_id",
                &[QueryParam::new("task_id", "a' OR '1'='1")],
            )
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn required_columns_reject_nulls() {
        let wh = SqliteWarehouse::in_memory().unwrap();
        let schema = TableSchema::users("users");
        let mut row = Row::new();
        row.insert("username".into(), "alice".into());
        let err = wh.load_table(&schema, vec![row]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Warehouse { .. }));
    }

    #[test]
    fn integer_coercion() {
        assert_eq!(to_sql(ColumnType::Integer, Some(&Value::from(7))), SqlValue::Integer(7));
        assert_eq!(to_sql(ColumnType::Integer, Some(&Value::from("12"))), SqlValue::Integer(12));
        assert_eq!(to_sql(ColumnType::Integer, Some(&Value::from("x"))), SqlValue::Null);
        assert_eq!(to_sql(ColumnType::String, None), SqlValue::Null);
    }
}
