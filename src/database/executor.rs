use std::collections::BTreeMap;

use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::Result;
use crate::mapping::MappedRows;

/// Sample rows kept per table in a dry-run report.
pub const SAMPLE_LIMIT: usize = 5;

/// What happens to non-key columns when the primary key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Replace every non-key column with the incoming value.
    Overwrite,
    /// Only fill columns whose stored value is null.
    NullOnly,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TablePlan {
    pub planned_row_count: usize,
    pub columns: Vec<String>,
    pub sample_rows: Vec<Vec<Value>>,
}

/// Per-table row counts (and, in dry-run, sample rows).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BatchReport {
    pub tables: BTreeMap<String, TablePlan>,
}

impl BatchReport {
    fn record(&mut self, batch: &MappedRows, keep_samples: bool) {
        let plan = self.tables.entry(batch.table.clone()).or_default();
        plan.planned_row_count += batch.rows.len();
        if plan.columns.is_empty() {
            plan.columns = batch.columns.clone();
        }
        if keep_samples {
            let room = SAMPLE_LIMIT.saturating_sub(plan.sample_rows.len());
            plan.sample_rows
                .extend(batch.rows.iter().take(room).cloned());
        }
    }

    fn merge(&mut self, other: BatchReport) {
        for (table, incoming) in other.tables {
            let plan = self.tables.entry(table).or_default();
            plan.planned_row_count += incoming.planned_row_count;
            if plan.columns.is_empty() {
                plan.columns = incoming.columns;
            }
            let room = SAMPLE_LIMIT.saturating_sub(plan.sample_rows.len());
            plan.sample_rows
                .extend(incoming.sample_rows.into_iter().take(room));
        }
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .get(table)
            .map(|p| p.planned_row_count)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Writes mapped rows with `INSERT ... ON CONFLICT` upserts, or only counts them in dry-run.
///
/// Counts are staged per file and folded into the run report only once the file's transaction
/// is known to have succeeded.
pub struct BatchExecutor {
    dry_run: bool,
    pending: BatchReport,
    report: BatchReport,
}

impl BatchExecutor {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            pending: BatchReport::default(),
            report: BatchReport::default(),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Upsert `batch` through `conn` (normally the file's transaction). Returns the row count.
    pub fn upsert(&mut self, conn: &Connection, batch: &MappedRows) -> Result<usize> {
        if batch.rows.is_empty() {
            return Ok(0);
        }

        if self.dry_run {
            info!(
                "[DRY-RUN] Would write {} rows into '{}' columns={:?}",
                batch.rows.len(),
                batch.table,
                batch.columns
            );
            self.pending.record(batch, true);
            return Ok(batch.rows.len());
        }

        let sql = upsert_sql(batch);
        debug!("{}", sql);
        let mut stmt = conn.prepare_cached(&sql)?;
        for row in &batch.rows {
            stmt.execute(params_from_iter(row.iter().map(SqlCell)))?;
        }
        self.pending.record(batch, false);
        Ok(batch.rows.len())
    }

    /// Close the current file: keep its counts if it went through, drop them otherwise.
    pub fn finish_file(&mut self, succeeded: bool) {
        let staged = std::mem::take(&mut self.pending);
        if succeeded {
            self.report.merge(staged);
        }
    }

    pub fn report(&self) -> &BatchReport {
        &self.report
    }

    pub fn into_report(self) -> BatchReport {
        self.report
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn upsert_sql(batch: &MappedRows) -> String {
    let table = quote(&batch.table);
    let columns: Vec<String> = batch.columns.iter().map(|c| quote(c)).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        placeholders.join(", ")
    );
    if batch.primary_key.is_empty() {
        return sql;
    }

    let key: Vec<String> = batch.primary_key.iter().map(|c| quote(c)).collect();
    let updates: Vec<String> = batch
        .columns
        .iter()
        .filter(|c| !batch.primary_key.contains(c))
        .map(|c| {
            let c = quote(c);
            match batch.policy {
                ConflictPolicy::Overwrite => format!("{c} = excluded.{c}"),
                ConflictPolicy::NullOnly => format!("{c} = COALESCE({table}.{c}, excluded.{c})"),
            }
        })
        .collect();

    if updates.is_empty() {
        sql.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", key.join(", ")));
    } else {
        sql.push_str(&format!(
            " ON CONFLICT ({}) DO UPDATE SET {}",
            key.join(", "),
            updates.join(", ")
        ));
    }
    sql
}

/// JSON cell bound as a SQLite value; lists and objects are stored as JSON text.
struct SqlCell<'a>(&'a Value);

impl ToSql for SqlCell<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self.0 {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => ToSqlOutput::Owned(SqlValue::Integer(i)),
                (None, Some(f)) => ToSqlOutput::Owned(SqlValue::Real(f)),
                (None, None) => ToSqlOutput::Owned(SqlValue::Text(n.to_string())),
            },
            Value::String(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            other => ToSqlOutput::Owned(SqlValue::Text(other.to_string())),
        })
    }
}
