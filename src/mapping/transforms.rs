//! Fan-out and custom transforms used by the mapping catalog.
//!
//! All of them are pure: they only read the table they are handed and the mapping context.

use serde_json::Value;

use crate::error::{IngestError, Result};
use super::table::RecordTable;
use super::{MappingContext, RECORD_COLUMN};

/// How a list field is exploded into rows.
#[derive(Debug, Clone, Default)]
pub struct ExplodeSpec {
    /// Column receiving each scalar element.
    pub output: Option<String>,
    /// Constant `(column, value)` stamped on every produced row.
    pub label: Option<(String, String)>,
    /// Column receiving the element's position in the source array.
    pub index_column: Option<String>,
    /// `(element key, column)` projections for object elements.
    pub fields: Vec<(String, String)>,
    pub trim: bool,
}

impl ExplodeSpec {
    pub fn scalar(output: &str) -> Self {
        ExplodeSpec {
            output: Some(output.to_string()),
            ..Default::default()
        }
    }

    pub fn labeled(mut self, column: &str, value: &str) -> Self {
        self.label = Some((column.to_string(), value.to_string()));
        self
    }

    pub fn trimmed(mut self) -> Self {
        self.trim = true;
        self
    }

    pub fn objects(index_column: &str, fields: &[(&str, &str)]) -> Self {
        ExplodeSpec {
            index_column: Some(index_column.to_string()),
            fields: fields
                .iter()
                .map(|(k, c)| (k.to_string(), c.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn targets(&self) -> Vec<String> {
        let mut targets = Vec::new();
        if let Some((column, _)) = &self.label {
            targets.push(column.clone());
        }
        targets.extend(self.output.iter().cloned());
        targets.extend(self.index_column.iter().cloned());
        targets.extend(self.fields.iter().map(|(_, c)| c.clone()));
        targets
    }

    /// Column whose emptiness marks a row as not yet fanned out.
    fn marker(&self) -> Option<&str> {
        self.output
            .as_deref()
            .or(self.index_column.as_deref())
            .or_else(|| self.fields.first().map(|(_, c)| c.as_str()))
    }
}

/// Explode `source` according to `spec`.
///
/// Only rows whose marker column is still null are fanned out; rows produced by an earlier
/// fan-out into the same columns pass through. Every fanned-out row also leaves a residual copy
/// (marker null, source cleared) so a later explode of a sibling field can still see the record.
/// Residual rows carry a null key and are dropped when the mapping is finalized.
pub fn explode(table: RecordTable, source: &str, spec: &ExplodeSpec) -> Result<RecordTable> {
    let mut table = table;
    let Some(src) = table.column_index(source) else {
        return Ok(table);
    };
    let Some(marker_name) = spec.marker() else {
        return Ok(table);
    };

    let output = spec.output.as_deref().map(|c| table.ensure_column(c));
    let label = spec
        .label
        .as_ref()
        .map(|(c, v)| (table.ensure_column(c), Value::String(v.clone())));
    let index = spec.index_column.as_deref().map(|c| table.ensure_column(c));
    let fields: Vec<(&str, usize)> = spec
        .fields
        .iter()
        .map(|(key, column)| (key.as_str(), table.ensure_column(column)))
        .collect();
    let marker = table.ensure_column(marker_name);
    let record = table.column_index(RECORD_COLUMN);

    let mut out = table.empty_like();
    for mut row in table.into_rows() {
        if !row[marker].is_null() {
            out.push_row(row);
            continue;
        }

        let items = match std::mem::take(&mut row[src]) {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            single => vec![single],
        };

        for (position, item) in items.into_iter().enumerate() {
            let item = match item {
                Value::Null => continue,
                Value::String(s) if spec.trim => {
                    let trimmed = s.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    Value::String(trimmed.to_string())
                }
                other => other,
            };

            let mut produced = row.clone();
            if let Some((idx, value)) = &label {
                produced[*idx] = value.clone();
            }
            if let Some(idx) = index {
                produced[idx] = Value::from(position);
            }
            if !fields.is_empty() {
                let Value::Object(object) = &item else {
                    return Err(IngestError::MalformedValue {
                        field: source.to_string(),
                        record: record.and_then(|r| row[r].as_u64()).map(|r| r as usize),
                        reason: format!("element {} is not an object", position),
                    });
                };
                for (key, idx) in &fields {
                    produced[*idx] = object.get(*key).cloned().unwrap_or(Value::Null);
                }
            }
            if let Some(idx) = output {
                produced[idx] = item;
            }
            out.push_row(produced);
        }

        out.push_row(row);
    }
    Ok(out)
}

/// Split a comma-delimited tag string (or accept an already split list) into a `tags` list.
///
/// Records without any tag produce no row, so re-ingestion never blanks an existing set.
pub fn split_tags(table: RecordTable, source: &str, _context: &MappingContext) -> Result<RecordTable> {
    let mut table = table;
    let tags = table.ensure_column("tags");
    let Some(src) = table.column_index(source) else {
        table.retain_rows(|_| false);
        return Ok(table);
    };

    let mut out = table.empty_like();
    for mut row in table.into_rows() {
        let parts: Vec<Value> = match &row[src] {
            Value::String(s) => s
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(|t| Value::String(t.to_string()))
                .collect(),
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(|t| Value::String(t.to_string()))
                .collect(),
            _ => Vec::new(),
        };
        if parts.is_empty() {
            continue;
        }
        row[tags] = Value::Array(parts);
        out.push_row(row);
    }
    Ok(out)
}

/// Lower-cased extension of the path in `source`, written to `file_format`.
pub fn file_format(table: RecordTable, source: &str, _context: &MappingContext) -> Result<RecordTable> {
    let mut table = table;
    let formats: Vec<Value> = (0..table.len())
        .map(|row| {
            table
                .value(row, source)
                .and_then(Value::as_str)
                .and_then(|path| {
                    let name = path.rsplit('/').next().unwrap_or(path);
                    name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())
                })
                .filter(|ext| !ext.is_empty())
                .map(Value::String)
                .unwrap_or(Value::Null)
        })
        .collect();
    table.set_column("file_format", formats);
    Ok(table)
}

/// Stamp the dataset id carried by the context onto every row.
pub fn attach_dataset_id(table: RecordTable, source: &str, context: &MappingContext) -> Result<RecordTable> {
    let mut table = table;
    let id = Value::String(context.dataset_id.to_string());
    let values = vec![id; table.len()];
    table.set_column(source, values);
    Ok(table)
}
