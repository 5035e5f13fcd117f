//! Orchestrator: discover info files, then resolve, map and write them one file at a time.
//!
//! Info files are parsed on a loader thread and handed over through a bounded channel; every
//! storage call stays on the calling thread, so files are written strictly in sequence and
//! dataset creation never races. Each file gets its own transaction: a failure rolls back that
//! file only, while a lost connection stops the run.

pub mod backfill;

use std::path::PathBuf;
use std::thread;

use crossbeam::channel::bounded;
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use tracing::{debug, error, info, warn};

use crate::database::executor::{BatchExecutor, BatchReport};
use crate::error::Result;
use crate::identity::{DatasetLocation, IdentityResolver, PendingClaims};
use crate::ingest::loader::load_info_file;
use crate::ingest::locator::{default_info_names, locate_datasets, InfoFile, InfoFileName};
use crate::mapping::catalog::default_mappings;
use crate::mapping::table::RecordTable;
use crate::mapping::{MappingContext, TableMapping};

const LOAD_QUEUE: usize = 4;

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub root: PathBuf,
    pub dry_run: bool,
    pub info_names: Vec<InfoFileName>,
    /// Source field holding each record's relative asset path.
    pub path_field: String,
}

impl IngestOptions {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            dry_run: false,
            info_names: default_info_names(),
            path_field: "IMG".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct FileFailure {
    pub path: PathBuf,
    pub record: Option<usize>,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct IngestSummary {
    pub dry_run: bool,
    pub datasets: usize,
    pub files_total: usize,
    pub files_ingested: usize,
    pub failures: Vec<FileFailure>,
    pub infoless: Vec<PathBuf>,
    /// Rows written per table, or planned rows plus samples in dry-run.
    pub report: BatchReport,
}

impl IngestSummary {
    pub fn log(&self) {
        if self.dry_run {
            info!("[DRY-RUN] No changes committed to database. Summary below:");
            for (table, plan) in &self.report.tables {
                info!("  table '{}': would write {} rows", table, plan.planned_row_count);
            }
        } else {
            for (table, plan) in &self.report.tables {
                info!("  table '{}': {} rows written", table, plan.planned_row_count);
            }
        }
        if self.report.is_empty() {
            info!("No rows to write");
        }
        info!(
            "{} of {} info files ingested across {} datasets",
            self.files_ingested, self.files_total, self.datasets
        );
        if !self.infoless.is_empty() {
            info!("{} subtrees hold no info file", self.infoless.len());
        }
        for failure in &self.failures {
            match failure.record {
                Some(record) => warn!("  failed {:?} at record {}: {}", failure.path, record, failure.error),
                None => warn!("  failed {:?}: {}", failure.path, failure.error),
            }
        }
    }
}

struct LoadedFile {
    dataset_dir: PathBuf,
    info: InfoFile,
    table: Result<RecordTable>,
}

/// Owns the per-run state (identity claims, executor counts) for one ingestion run.
pub struct Ingestor<'c> {
    conn: &'c mut Connection,
    options: IngestOptions,
    mappings: Vec<TableMapping>,
    identity: IdentityResolver,
    executor: BatchExecutor,
}

impl<'c> Ingestor<'c> {
    pub fn new(conn: &'c mut Connection, options: IngestOptions) -> Self {
        let identity = IdentityResolver::new(&options.path_field, options.dry_run);
        let executor = BatchExecutor::new(options.dry_run);
        Self {
            conn,
            options,
            mappings: default_mappings(),
            identity,
            executor,
        }
    }

    /// Replace the table mappings. Parent tables must come before their children.
    #[cfg(test)]
    pub fn with_mappings(mut self, mappings: Vec<TableMapping>) -> Self {
        self.mappings = mappings;
        self
    }

    /// Ingest every info file under the root. Only a lost storage connection returns `Err`.
    pub fn run(mut self) -> Result<IngestSummary> {
        let scan = locate_datasets(&self.options.root, &self.options.info_names);
        info!(
            "Found {} dataset roots under {:?}",
            scan.roots.len(),
            self.options.root
        );
        for dir in &scan.infoless {
            debug!("?? {:?}", dir);
        }

        let jobs: Vec<(PathBuf, InfoFile)> = scan
            .info_files()
            .map(|(root, file)| (root.dir.clone(), file.clone()))
            .collect();
        let mut summary = IngestSummary {
            dry_run: self.executor.is_dry_run(),
            datasets: scan.roots.len(),
            files_total: jobs.len(),
            infoless: scan.infoless.clone(),
            ..Default::default()
        };
        if jobs.is_empty() {
            warn!("No info files found under {:?}", self.options.root);
            return Ok(summary);
        }

        let (tx, rx) = bounded::<LoadedFile>(LOAD_QUEUE);
        let loader = thread::spawn(move || {
            for (dataset_dir, info) in jobs {
                let table = load_info_file(&info);
                if tx.send(LoadedFile { dataset_dir, info, table }).is_err() {
                    break;
                }
            }
        });

        let progress = ProgressBar::new(summary.files_total as u64);
        progress.set_style(
            ProgressStyle::with_template("{bar:40} {pos}/{len} {wide_msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut fatal = None;
        for loaded in rx.iter() {
            let path = loaded.info.path.clone();
            progress.set_message(path.display().to_string());
            match self.ingest_file(loaded) {
                Ok(rows) => {
                    info!("Imported {:?} ({} rows)", path, rows);
                    summary.files_ingested += 1;
                }
                Err(e) if e.is_fatal() => {
                    error!("Lost storage while ingesting {:?}: {}", path, e);
                    fatal = Some(e);
                    break;
                }
                Err(e) => {
                    match e.record_index() {
                        Some(record) => error!("Failed to ingest {:?} (record {}): {}", path, record, e),
                        None => error!("Failed to ingest {:?}: {}", path, e),
                    }
                    summary.failures.push(FileFailure {
                        path,
                        record: e.record_index(),
                        error: e.to_string(),
                    });
                }
            }
            progress.inc(1);
        }
        drop(rx);
        if loader.join().is_err() {
            error!("Info file loader thread panicked");
        }
        progress.finish_and_clear();

        if let Some(e) = fatal {
            return Err(e);
        }
        summary.report = self.executor.into_report();
        Ok(summary)
    }

    fn ingest_file(&mut self, loaded: LoadedFile) -> Result<usize> {
        let table = loaded.table?;
        if table.is_empty() {
            debug!("{:?} holds no records", loaded.info.path);
        }
        let location = DatasetLocation::new(&self.options.root, &loaded.dataset_dir);
        debug!("Importing {:?} into dataset '{}'", loaded.info.path, location.dir_path);

        let tx = self.conn.transaction()?;
        let outcome = write_file(
            &tx,
            &mut self.identity,
            &mut self.executor,
            &self.mappings,
            &location,
            table,
        );

        let finished = outcome.and_then(|(rows, claims)| {
            // Dry-run reads through the transaction but never commits it.
            if self.executor.is_dry_run() {
                tx.rollback()?;
            } else {
                tx.commit()?;
            }
            Ok((rows, claims))
        });

        match finished {
            Ok((rows, claims)) => {
                self.executor.finish_file(true);
                self.identity.finish_file(true);
                debug!(
                    "Accepted {} asset ids; {} asset rows so far",
                    claims.len(),
                    self.executor.report().row_count("assets")
                );
                self.identity.accept(claims);
                Ok(rows)
            }
            Err(e) => {
                self.executor.finish_file(false);
                self.identity.finish_file(false);
                Err(e)
            }
        }
    }
}

/// Resolve identities and run every mapping for one file inside `tx`.
fn write_file(
    tx: &Connection,
    identity: &mut IdentityResolver,
    executor: &mut BatchExecutor,
    mappings: &[TableMapping],
    location: &DatasetLocation,
    table: RecordTable,
) -> Result<(usize, PendingClaims)> {
    let dataset_id = identity.resolve_dataset(tx, location, executor)?;
    let (table, claims) = identity.attach_asset_ids(tx, table, dataset_id)?;
    let context = MappingContext { dataset_id };

    let mut rows = 0;
    for mapping in mappings {
        let batch = mapping.apply(table.clone(), &context)?;
        rows += executor.upsert(tx, &batch)?;
    }
    Ok((rows, claims))
}

/// Convenience for callers that do not need to swap mappings.
pub fn ingest(conn: &mut Connection, options: IngestOptions) -> Result<IngestSummary> {
    Ingestor::new(conn, options).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::open_in_memory;
    use crate::error::IngestError;
    use crate::identity::asset_fingerprint;
    use serde_json::{json, Value};
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn write_info(dir: &Path, name: &str, content: &Value) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(name), content.to_string()).unwrap();
    }

    fn sample_records() -> Value {
        json!([
            {
                "IMG": "a/b.png", "W": 100, "H": 50, "Q512": 0.7, "A": 5.5,
                "IMG_EMBD": [0.1, 0.2, 0.3],
                "CAP": ["x", "y"], "HQ_CAP": ["z"],
                "DBRU_TAG": "1girl, solo",
                "POSE_KPTS": [
                    {"BBOX": [0, 0, 10, 10], "INVLD_KPTS_IDX": [2], "KPTS_X": [1.0, 2.0], "KPTS_Y": [3.0, 4.0]}
                ]
            },
            {"IMG": "c.jpg", "W": 20, "H": 30}
        ])
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap()
    }

    fn dump(conn: &Connection) -> Vec<String> {
        let mut out = Vec::new();
        for table in ["datasets", "assets", "asset_captions", "asset_tags", "asset_poses"] {
            let mut stmt = conn.prepare(&format!("SELECT * FROM {}", table)).unwrap();
            let columns = stmt.column_count();
            let mut rows = stmt.query([]).unwrap();
            while let Some(row) = rows.next().unwrap() {
                let cells: Vec<String> = (0..columns)
                    .map(|i| format!("{:?}", row.get_ref(i).unwrap()))
                    .collect();
                out.push(format!("{}: {}", table, cells.join("|")));
            }
        }
        out.sort();
        out
    }

    fn options(root: &Path, dry_run: bool) -> IngestOptions {
        let mut options = IngestOptions::new(root.to_path_buf());
        options.dry_run = dry_run;
        options
    }

    #[test]
    fn test_ingest_fans_out_child_rows() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("DS");
        write_info(&root.join("sub/leaf"), "ImageInfo.json", &sample_records());
        let mut conn = open_in_memory();

        let summary = ingest(&mut conn, options(&root, false)).unwrap();
        assert_eq!(summary.files_ingested, 1);
        assert!(summary.failures.is_empty());

        let (dataset_id, dir_path): (String, String) = conn
            .query_row("SELECT id, dir_path FROM datasets", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!(dir_path, "DS/sub/leaf");

        let expected = asset_fingerprint(&Uuid::parse_str(&dataset_id).unwrap(), "a/b.png");
        assert_eq!(count(&conn, "assets"), 2);
        assert_eq!(count(&conn, "asset_captions"), 3);
        assert_eq!(count(&conn, "asset_tags"), 1);
        assert_eq!(count(&conn, "asset_poses"), 1);

        let owners: Vec<String> = conn
            .prepare("SELECT DISTINCT asset_id FROM asset_captions")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(owners, vec![expected.to_string()]);

        let tags: String = conn
            .query_row("SELECT tags FROM asset_tags", [], |r| r.get(0))
            .unwrap();
        assert_eq!(serde_json::from_str::<Value>(&tags).unwrap(), json!(["1girl", "solo"]));
        assert_eq!(summary.report.row_count("asset_captions"), 3);
    }

    #[test]
    fn test_null_only_rerun_fills_gaps_once() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("DS");
        write_info(&root, "ImageInfo.json", &sample_records());
        let mut conn = open_in_memory();

        ingest(&mut conn, options(&root, false)).unwrap();
        conn.execute(
            "UPDATE assets SET width = 1, height = NULL WHERE file_path = 'a/b.png'",
            [],
        )
        .unwrap();

        ingest(&mut conn, options(&root, false)).unwrap();
        let dims: (i64, i64) = conn
            .query_row(
                "SELECT width, height FROM assets WHERE file_path = 'a/b.png'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(dims, (1, 50));
        assert_eq!(count(&conn, "assets"), 2);
    }

    #[test]
    fn test_rerun_converges() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("DS");
        write_info(&root, "ImageInfo.json", &sample_records());
        let mut conn = open_in_memory();

        ingest(&mut conn, options(&root, false)).unwrap();
        let first = dump(&conn);
        ingest(&mut conn, options(&root, false)).unwrap();
        assert_eq!(first, dump(&conn));
    }

    #[test]
    fn test_dry_run_does_not_mutate() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("DS");
        write_info(&root.join("one"), "ImageInfo.json", &sample_records());
        let mut conn = open_in_memory();

        ingest(&mut conn, options(&root, false)).unwrap();
        write_info(
            &root.join("two"),
            "ImageInfo.json",
            &json!([{"IMG": "new.png", "CAP": ["fresh"]}]),
        );
        let before = dump(&conn);

        let summary = ingest(&mut conn, options(&root, true)).unwrap();
        assert_eq!(before, dump(&conn));
        assert!(summary.dry_run);
        assert_eq!(summary.files_ingested, 2);
        assert_eq!(summary.report.row_count("datasets"), 1);
        assert_eq!(summary.report.row_count("assets"), 3);
        let plan = &summary.report.tables["asset_captions"];
        assert_eq!(plan.planned_row_count, 4);
        assert!(plan.sample_rows.len() <= 5);
    }

    #[test]
    fn test_failing_file_does_not_stop_the_run() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("DS");
        write_info(&root.join("good"), "ImageInfo.json", &sample_records());
        fs::create_dir_all(root.join("broken")).unwrap();
        fs::write(root.join("broken/ImageInfo.json"), "[{\"IMG\": ").unwrap();
        write_info(
            &root.join("conflict"),
            "ImageInfo.json",
            &json!([{"IMG": "a.png", "CAP": ["kept?"]}, {"IMG": "./a.png"}]),
        );
        let mut conn = open_in_memory();

        let summary = ingest(&mut conn, options(&root, false)).unwrap();
        assert_eq!(summary.files_total, 3);
        assert_eq!(summary.files_ingested, 1);
        assert_eq!(summary.failures.len(), 2);
        let conflict = summary
            .failures
            .iter()
            .find(|f| f.path.starts_with(root.join("conflict")))
            .unwrap();
        assert_eq!(conflict.record, Some(1));

        // Nothing from the conflicting file survives, not even its dataset row.
        assert_eq!(count(&conn, "datasets"), 1);
        assert_eq!(count(&conn, "assets"), 2);
        assert_eq!(count(&conn, "asset_captions"), 3);
    }

    #[test]
    fn test_mapping_error_rolls_back_the_file() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("DS");
        write_info(&root, "ImageInfo.json", &sample_records());
        let mut conn = open_in_memory();

        let mut mappings = default_mappings();
        mappings[1].rules.push(crate::mapping::MappingRule::rename("NOPE", "nope"));
        let summary = Ingestor::new(&mut conn, options(&root, false))
            .with_mappings(mappings)
            .run()
            .unwrap();

        assert_eq!(summary.failures.len(), 1);
        assert!(summary.failures[0].error.contains("nope"));
        assert_eq!(count(&conn, "assets"), 0);
        assert_eq!(count(&conn, "datasets"), 0);
        assert!(summary.report.is_empty());
    }

    #[test]
    fn test_both_layouts_share_asset_ids() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("DS");
        write_info(&root, "ImageInfo.json", &json!([{"IMG": "a.png", "W": 5}]));
        write_info(
            &root,
            "ImageInfo.columnar.json",
            &json!({"IMG": ["a.png"], "H": [7]}),
        );
        let mut conn = open_in_memory();

        let summary = ingest(&mut conn, options(&root, false)).unwrap();
        assert_eq!(summary.files_ingested, 2);
        assert_eq!(count(&conn, "datasets"), 1);
        let dims: (i64, i64) = conn
            .query_row("SELECT width, height FROM assets", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!(dims, (5, 7));
    }

    #[test]
    fn test_dry_run_counts_dataset_after_failed_sibling_file() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("DS");
        write_info(&root, "ImageInfo.json", &json!([{"IMG": "a.png"}, {"IMG": "./a.png"}]));
        write_info(&root, "ImageInfo.columnar.json", &json!({"IMG": ["b.png"]}));

        let mut conn = open_in_memory();
        let planned = ingest(&mut conn, options(&root, true)).unwrap();
        assert_eq!(planned.failures.len(), 1);
        assert_eq!(planned.report.row_count("datasets"), 1);
        assert_eq!(planned.report.row_count("assets"), 1);

        let written = ingest(&mut conn, options(&root, false)).unwrap();
        assert_eq!(written.report.row_count("datasets"), planned.report.row_count("datasets"));
        assert_eq!(count(&conn, "datasets"), 1);
        assert_eq!(count(&conn, "assets"), 1);
    }

    fn fail_on_lost_disk(table: RecordTable, source: &str, _context: &MappingContext) -> Result<RecordTable> {
        let lost = (0..table.len()).any(|r| table.value(r, source) == Some(&json!("lost.png")));
        if lost {
            return Err(IngestError::Storage(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_IOERR),
                None,
            )));
        }
        Ok(table)
    }

    #[test]
    fn test_lost_storage_stops_the_run() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("DS");
        write_info(&root.join("a"), "ImageInfo.json", &sample_records());
        write_info(&root.join("b"), "ImageInfo.json", &json!([{"IMG": "lost.png"}]));
        write_info(&root.join("c"), "ImageInfo.json", &json!([{"IMG": "never.png"}]));
        let mut conn = open_in_memory();

        let mut mappings = default_mappings();
        mappings[0]
            .rules
            .push(crate::mapping::MappingRule::custom("asset_path", &[], fail_on_lost_disk));
        let err = Ingestor::new(&mut conn, options(&root, false))
            .with_mappings(mappings)
            .run()
            .unwrap_err();
        assert!(err.is_fatal());

        // The file committed before the failure stays; nothing after it ran.
        assert_eq!(count(&conn, "datasets"), 1);
        assert_eq!(count(&conn, "assets"), 2);
        let never: i64 = conn
            .query_row("SELECT COUNT(*) FROM assets WHERE file_path = 'never.png'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(never, 0);
    }

    #[test]
    fn test_storage_errors_are_file_scoped() {
        let err = IngestError::Storage(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        ));
        assert!(!err.is_fatal());
    }
}
