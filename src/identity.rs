//! Stable identities for datasets and assets.
//!
//! Datasets are keyed by their directory path relative to the parent of the scanned root.
//! Assets get a content-addressed id: the first 16 bytes of
//! `SHA-256("{dataset_id}/{normalized_path}")`, formatted as a UUID. This is a fingerprint, not
//! an RFC 4122 UUID of any particular version. Ids already stored for a `(dataset, path)` pair
//! always win over a freshly derived one.

use std::collections::HashMap;
use std::path::{Component, Path};

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::database::executor::{BatchExecutor, ConflictPolicy};
use crate::error::{IngestError, Result};
use crate::mapping::table::RecordTable;
use crate::mapping::{MappedRows, RECORD_COLUMN};

pub const ASSET_ID_COLUMN: &str = "asset_id";
pub const ASSET_PATH_COLUMN: &str = "asset_path";

/// Natural key and display name of a dataset directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLocation {
    pub dir_path: String,
    pub name: String,
}

impl DatasetLocation {
    /// `dir` relative to the parent of `root`, so the key starts with the root's own name.
    pub fn new(root: &Path, dir: &Path) -> Self {
        let base = root.parent().unwrap_or(root);
        let relative = dir.strip_prefix(base).unwrap_or(dir);
        let dir_path = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir_path.clone());
        Self { dir_path, name }
    }
}

/// Canonical form of a record's relative path: forward slashes, no empty or `.` segments.
pub fn normalize_path(raw: &str) -> String {
    raw.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

pub fn asset_fingerprint(dataset_id: &Uuid, normalized_path: &str) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}/{}", dataset_id, normalized_path).as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

/// Who claimed an asset id during the current run.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Claim {
    dataset_id: Uuid,
    raw_path: String,
}

/// Asset ids claimed by one file, accepted into the run only if the file succeeds.
#[derive(Debug, Default)]
pub struct PendingClaims {
    claims: HashMap<Uuid, Claim>,
}

impl PendingClaims {
    pub fn len(&self) -> usize {
        self.claims.len()
    }
}

/// Per-run identity state. Owned by the orchestrator and threaded through every file.
#[derive(Debug)]
pub struct IdentityResolver {
    path_field: String,
    dry_run: bool,
    provisional: HashMap<String, Uuid>,
    /// Provisional ids created by the file in progress.
    staged: HashMap<String, Uuid>,
    claims: HashMap<Uuid, Claim>,
}

impl IdentityResolver {
    pub fn new(path_field: &str, dry_run: bool) -> Self {
        Self {
            path_field: path_field.to_string(),
            dry_run,
            provisional: HashMap::new(),
            staged: HashMap::new(),
            claims: HashMap::new(),
        }
    }

    /// Look up the dataset by `dir_path`, creating it when absent.
    ///
    /// In dry-run the would-be row goes to the executor's report and the provisional id is
    /// staged. Once the file succeeds the directory keeps resolving to that id for the rest of
    /// the run; a failed file forgets it along with its planned row.
    pub fn resolve_dataset(
        &mut self,
        conn: &Connection,
        location: &DatasetLocation,
        executor: &mut BatchExecutor,
    ) -> Result<Uuid> {
        let stored: Option<String> = conn
            .query_row(
                "SELECT id FROM datasets WHERE dir_path = ?1",
                params![location.dir_path],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = stored {
            return parse_stored_id(&id).map_err(IngestError::from);
        }

        if self.dry_run {
            let cached = self
                .staged
                .get(&location.dir_path)
                .or_else(|| self.provisional.get(&location.dir_path));
            if let Some(id) = cached {
                return Ok(*id);
            }
        }

        let id = Uuid::new_v4();
        let row = MappedRows {
            table: "datasets".into(),
            columns: vec![
                "id".into(),
                "name".into(),
                "dir_path".into(),
                "created_at".into(),
            ],
            rows: vec![vec![
                Value::String(id.to_string()),
                Value::String(location.name.clone()),
                Value::String(location.dir_path.clone()),
                Value::String(chrono::Utc::now().to_rfc3339()),
            ]],
            primary_key: vec!["id".into()],
            policy: ConflictPolicy::NullOnly,
        };
        executor.upsert(conn, &row)?;
        if self.dry_run {
            self.staged.insert(location.dir_path.clone(), id);
            info!("[DRY-RUN] Would create dataset: name={}, dir_path={}", location.name, location.dir_path);
        } else {
            info!("Created dataset '{}' ({}) as {}", location.name, location.dir_path, id);
        }
        Ok(id)
    }

    /// Attach `asset_id`, `asset_path` and the record index to every row of `table`.
    ///
    /// Fails with an identity conflict when one id would be claimed by two different source
    /// paths, whether inside this file or against an earlier file of the run.
    pub fn attach_asset_ids(
        &self,
        conn: &Connection,
        mut table: RecordTable,
        dataset_id: Uuid,
    ) -> Result<(RecordTable, PendingClaims)> {
        let stored = stored_asset_ids(conn, &dataset_id)?;
        let mut pending = PendingClaims::default();
        let mut ids = Vec::with_capacity(table.len());
        let mut paths = Vec::with_capacity(table.len());
        let mut records = Vec::with_capacity(table.len());

        for record in 0..table.len() {
            let raw = table
                .value(record, &self.path_field)
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_default();
            let normalized = normalize_path(&raw);
            if normalized.is_empty() {
                return Err(IngestError::MissingAssetPath {
                    field: self.path_field.clone(),
                    record,
                });
            }

            let id = stored
                .get(&normalized)
                .copied()
                .unwrap_or_else(|| asset_fingerprint(&dataset_id, &normalized));

            let claim = Claim {
                dataset_id,
                raw_path: raw,
            };
            let earlier = pending.claims.get(&id).or_else(|| self.claims.get(&id));
            match earlier {
                Some(existing) if *existing != claim => {
                    return Err(IngestError::IdentityConflict {
                        id,
                        existing: existing.raw_path.clone(),
                        incoming: claim.raw_path,
                        record,
                    });
                }
                Some(_) => {}
                None => {
                    pending.claims.insert(id, claim);
                }
            }

            ids.push(Value::String(id.to_string()));
            paths.push(Value::String(normalized));
            records.push(Value::from(record));
        }

        table.set_column(ASSET_ID_COLUMN, ids);
        table.set_column(ASSET_PATH_COLUMN, paths);
        table.set_column(RECORD_COLUMN, records);
        Ok((table, pending))
    }

    /// Make a successful file's claims binding for the rest of the run.
    pub fn accept(&mut self, pending: PendingClaims) {
        self.claims.extend(pending.claims);
    }

    /// Close the current file: keep its provisional datasets on success, drop them otherwise.
    pub fn finish_file(&mut self, succeeded: bool) {
        let staged = std::mem::take(&mut self.staged);
        if succeeded {
            self.provisional.extend(staged);
        }
    }
}

fn parse_stored_id(raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

fn stored_asset_ids(conn: &Connection, dataset_id: &Uuid) -> Result<HashMap<String, Uuid>> {
    let mut stmt = conn.prepare_cached("SELECT file_path, id FROM assets WHERE dataset_id = ?1")?;
    let rows = stmt.query_map(params![dataset_id.to_string()], |row| {
        let path: String = row.get(0)?;
        let id: String = row.get(1)?;
        Ok((path, parse_stored_id(&id)?))
    })?;

    let mut out = HashMap::new();
    for row in rows {
        let (path, id) = row?;
        out.insert(path, id);
    }
    Ok(out)
}
