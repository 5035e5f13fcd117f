//! Declarative per-table mappings from raw info records to storage rows.
//!
//! A [`TableMapping`] is an ordered list of [`MappingRule`]s. Each rule consumes the working
//! table produced by the previous one; once all rules ran, the declared columns are checked,
//! primary-key duplicates are collapsed (first occurrence wins) and the rows are projected.

pub mod catalog;
pub mod table;
pub mod transforms;

use std::collections::HashSet;

use serde_json::Value;
use uuid::Uuid;

use crate::database::executor::ConflictPolicy;
use crate::error::{IngestError, Result};
use self::table::RecordTable;
use self::transforms::ExplodeSpec;

/// Column the identity resolver fills with the source record index.
pub const RECORD_COLUMN: &str = "_record";

/// Cross-call information a transform is allowed to see.
#[derive(Debug, Clone)]
pub struct MappingContext {
    pub dataset_id: Uuid,
}

/// Signature of a custom transform: `(table, source_field, context) -> table'`.
pub type TransformFn = fn(RecordTable, &str, &MappingContext) -> Result<RecordTable>;

/// One step of a table mapping.
pub trait RowTransform {
    fn apply(&self, table: RecordTable, context: &MappingContext) -> Result<RecordTable>;

    /// Columns this step promises to produce.
    fn targets(&self) -> Vec<String>;
}

#[derive(Debug, Clone)]
pub enum MappingRule {
    /// Copy one source field into one or more target columns.
    Rename {
        source: String,
        targets: Vec<String>,
        optional: bool,
    },
    /// Fan a list field out into one row per element.
    Explode {
        source: String,
        spec: ExplodeSpec,
        optional: bool,
    },
    Custom {
        source: String,
        targets: Vec<String>,
        transform: TransformFn,
    },
}

impl MappingRule {
    pub fn rename(source: &str, target: &str) -> Self {
        MappingRule::Rename {
            source: source.to_string(),
            targets: vec![target.to_string()],
            optional: false,
        }
    }

    pub fn rename_optional(source: &str, target: &str) -> Self {
        MappingRule::Rename {
            source: source.to_string(),
            targets: vec![target.to_string()],
            optional: true,
        }
    }

    pub fn explode(source: &str, spec: ExplodeSpec) -> Self {
        MappingRule::Explode {
            source: source.to_string(),
            spec,
            optional: true,
        }
    }

    pub fn custom(source: &str, targets: &[&str], transform: TransformFn) -> Self {
        MappingRule::Custom {
            source: source.to_string(),
            targets: targets.iter().map(|t| t.to_string()).collect(),
            transform,
        }
    }
}

impl RowTransform for MappingRule {
    fn apply(&self, mut table: RecordTable, context: &MappingContext) -> Result<RecordTable> {
        match self {
            MappingRule::Rename {
                source,
                targets,
                optional,
            } => {
                for target in targets {
                    if !table.copy_column(source, target) && *optional {
                        table.ensure_column(target);
                    }
                }
                Ok(table)
            }
            MappingRule::Explode {
                source,
                spec,
                optional,
            } => {
                if !table.has_column(source) {
                    if *optional {
                        for target in spec.targets() {
                            table.ensure_column(&target);
                        }
                    }
                    return Ok(table);
                }
                transforms::explode(table, source, spec)
            }
            MappingRule::Custom {
                source, transform, ..
            } => transform(table, source, context),
        }
    }

    fn targets(&self) -> Vec<String> {
        match self {
            MappingRule::Rename { targets, .. } | MappingRule::Custom { targets, .. } => {
                targets.clone()
            }
            MappingRule::Explode { spec, .. } => spec.targets(),
        }
    }
}

/// Mapping of the working table onto one storage table.
#[derive(Debug, Clone)]
pub struct TableMapping {
    pub table: String,
    pub rules: Vec<MappingRule>,
    pub primary_key: Vec<String>,
    pub policy: ConflictPolicy,
}

/// Rows ready for the batch executor.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRows {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub primary_key: Vec<String>,
    pub policy: ConflictPolicy,
}

impl TableMapping {
    /// Rule targets followed by any primary-key column not already named, in declaration order.
    pub fn declared_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        let names = self
            .rules
            .iter()
            .flat_map(|r| r.targets())
            .chain(self.primary_key.iter().cloned());
        for name in names {
            if !columns.contains(&name) {
                columns.push(name);
            }
        }
        columns
    }

    pub fn apply(&self, table: RecordTable, context: &MappingContext) -> Result<MappedRows> {
        let mut table = table;
        for rule in &self.rules {
            table = rule.apply(table, context)?;
        }

        let columns = self.declared_columns();
        let missing: Vec<String> = columns
            .iter()
            .filter(|c| !table.has_column(c))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(IngestError::Mapping {
                table: self.table.clone(),
                missing,
            });
        }

        let projection: Vec<usize> = columns
            .iter()
            .filter_map(|c| table.column_index(c))
            .collect();
        let key_positions: Vec<usize> = self
            .primary_key
            .iter()
            .filter_map(|k| columns.iter().position(|c| c == k))
            .collect();

        let mut seen: HashSet<String> = HashSet::new();
        let mut rows = Vec::with_capacity(table.len());
        for row in table.into_rows() {
            let projected: Vec<Value> = projection.iter().map(|&i| row[i].clone()).collect();
            let key: Vec<&Value> = key_positions.iter().map(|&i| &projected[i]).collect();
            // Residual rows left behind by fan-out rules carry a null key.
            if key.iter().any(|v| v.is_null()) {
                continue;
            }
            if !key.is_empty() {
                let fingerprint = Value::Array(key.into_iter().cloned().collect()).to_string();
                if !seen.insert(fingerprint) {
                    continue;
                }
            }
            rows.push(projected);
        }

        Ok(MappedRows {
            table: self.table.clone(),
            columns,
            rows,
            primary_key: self.primary_key.clone(),
            policy: self.policy,
        })
    }
}
