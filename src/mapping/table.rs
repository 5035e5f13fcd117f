//! Row-oriented working table the mapping rules operate on.
//!
//! Cells are `serde_json::Value`s so that nested source data (caption lists, pose objects,
//! embeddings) survives untouched until a rule decides how to flatten it.

use std::path::Path;

use serde_json::{Map, Value};

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordTable {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl RecordTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a table from row-oriented records (JSON objects).
    ///
    /// Columns are the union of keys in first-seen order; absent keys become null cells.
    pub fn from_records(records: Vec<Value>, origin: &Path) -> Result<Self> {
        let mut table = RecordTable::default();
        for (index, record) in records.into_iter().enumerate() {
            let Value::Object(fields) = record else {
                return Err(IngestError::Load {
                    path: origin.to_path_buf(),
                    reason: format!("record {} is not an object", index),
                });
            };
            let mut row = vec![Value::Null; table.columns.len()];
            for (key, value) in fields {
                let idx = table.ensure_column(&key);
                if idx >= row.len() {
                    row.resize(idx + 1, Value::Null);
                }
                row[idx] = value;
            }
            table.rows.push(row);
        }
        Ok(table)
    }

    /// Build a table from a column-oriented object (`{field: [v0, v1, ...]}`).
    pub fn from_columns(columns: Map<String, Value>, origin: &Path) -> Result<Self> {
        let mut names = Vec::with_capacity(columns.len());
        let mut data = Vec::with_capacity(columns.len());
        let mut height: Option<usize> = None;

        for (name, values) in columns {
            let Value::Array(values) = values else {
                return Err(IngestError::Load {
                    path: origin.to_path_buf(),
                    reason: format!("column '{}' is not an array", name),
                });
            };
            match height {
                Some(h) if h != values.len() => {
                    return Err(IngestError::Load {
                        path: origin.to_path_buf(),
                        reason: format!(
                            "column '{}' has {} values, expected {}",
                            name,
                            values.len(),
                            h
                        ),
                    });
                }
                _ => height = Some(values.len()),
            }
            names.push(name);
            data.push(values.into_iter());
        }

        let mut table = RecordTable::new(names);
        for _ in 0..height.unwrap_or(0) {
            let row = data
                .iter_mut()
                .map(|col| col.next().unwrap_or(Value::Null))
                .collect();
            table.rows.push(row);
        }
        Ok(table)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Index of `name`, appending an all-null column if it does not exist yet.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column_index(name) {
            return idx;
        }
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.push(Value::Null);
        }
        self.columns.len() - 1
    }

    /// Replace (or add) a column with one value per row.
    pub fn set_column(&mut self, name: &str, values: Vec<Value>) {
        debug_assert_eq!(values.len(), self.rows.len());
        let idx = self.ensure_column(name);
        for (row, value) in self.rows.iter_mut().zip(values) {
            row[idx] = value;
        }
    }

    /// Copy `from` into `to`. Returns false when `from` does not exist.
    pub fn copy_column(&mut self, from: &str, to: &str) -> bool {
        let Some(src) = self.column_index(from) else {
            return false;
        };
        if from == to {
            return true;
        }
        let dst = self.ensure_column(to);
        for row in &mut self.rows {
            row[dst] = row[src].clone();
        }
        true
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    pub fn push_row(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    pub fn retain_rows<F>(&mut self, mut keep: F)
    where
        F: FnMut(&[Value]) -> bool,
    {
        self.rows.retain(|row| keep(row));
    }

    /// Same columns, no rows.
    pub fn empty_like(&self) -> Self {
        RecordTable::new(self.columns.clone())
    }

    pub fn into_rows(self) -> Vec<Vec<Value>> {
        self.rows
    }
}
