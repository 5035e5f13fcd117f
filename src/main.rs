mod database;
mod error;
mod identity;
mod ingest;
mod mapping;
mod pipeline;
mod utils;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::ingest::locator::{default_info_names, locate_datasets, InfoFileName};
use crate::pipeline::backfill::{backfill_hashes, BackfillOptions};
use crate::pipeline::IngestOptions;
use crate::utils::config::{load_settings, save_to_env, Settings};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// SQLite catalog to write to.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Settings file holding DATASET_ROOT, DATABASE_PATH and INFO_FILE_NAMES.
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List dataset roots and subtrees without info files.
    Scan {
        #[arg(short, long)]
        root: Option<PathBuf>,
    },
    /// Import every info file under the root into the catalog.
    Ingest {
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Plan the writes and report them without committing anything.
        #[arg(long)]
        dry_run: bool,

        /// Save the resolved root and database path to the settings file.
        #[arg(long)]
        remember: bool,
    },
    /// Compute content hashes for assets that were ingested without one.
    BackfillHashes {
        #[arg(short, long)]
        root: Option<PathBuf>,

        #[arg(long)]
        dry_run: bool,

        #[arg(short, long)]
        threads: Option<usize>,
    },
    /// Write the search feed (one JSON document per asset) to a file or stdout.
    ExportSearch {
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();
    let args = Args::parse();

    let settings = load_settings(&args.env_file)?;
    let db_path = args.db.clone().unwrap_or_else(|| settings.database_path());
    let info_names = settings
        .info_file_names
        .as_ref()
        .map(|names| names.iter().map(|n| InfoFileName::parse(n)).collect())
        .unwrap_or_else(default_info_names);

    match args.command {
        Command::Scan { root } => {
            let root = resolve_root(root, &settings)?;
            let scan = locate_datasets(&root, &info_names);
            for dataset in &scan.roots {
                println!("-- {}", dataset.dir.display());
                for info in &dataset.info_files {
                    println!("     {}", info.path.display());
                }
            }
            for dir in &scan.infoless {
                println!("?? {}", dir.display());
            }
            for dir in &scan.unreadable {
                warn!("Skipped unreadable directory {:?}", dir);
            }
        }
        Command::Ingest {
            root,
            dry_run,
            remember,
        } => {
            let root = resolve_root(root, &settings)?;
            info!("Dataset ingestion starting...");
            info!("Root: {:?}", root);
            info!("DB: {:?}", db_path);

            let mut conn = database::open(&db_path)?;
            let mut options = IngestOptions::new(root.clone());
            options.dry_run = dry_run;
            options.info_names = info_names;

            let summary = pipeline::ingest(&mut conn, options).context("Ingestion stopped")?;
            summary.log();
            if summary.dry_run {
                println!("{}", serde_json::to_string_pretty(&summary.report)?);
            }

            if remember {
                let saved = Settings {
                    dataset_root: Some(root),
                    database_path: Some(db_path),
                    ..settings
                };
                save_to_env(&args.env_file, &saved)?;
                info!("Saved settings to {:?}", args.env_file);
            }
        }
        Command::BackfillHashes {
            root,
            dry_run,
            threads,
        } => {
            let root = resolve_root(root, &settings)?;
            let mut conn = database::open(&db_path)?;
            let summary = backfill_hashes(
                &mut conn,
                &BackfillOptions {
                    root,
                    dry_run,
                    threads,
                },
            )?;
            info!(
                "{} assets without hash, {} hashed, {} unreadable, {} updated",
                summary.pending, summary.hashed, summary.unreadable, summary.updated
            );
        }
        Command::ExportSearch { out } => {
            let conn = database::open(&db_path)?;
            let written = match out {
                Some(path) => {
                    let file = File::create(&path)
                        .with_context(|| format!("Failed to create {:?}", path))?;
                    let mut writer = BufWriter::new(file);
                    let written = database::search::write_json_lines(&conn, &mut writer)?;
                    writer.flush()?;
                    written
                }
                None => {
                    let stdout = io::stdout();
                    let mut writer = BufWriter::new(stdout.lock());
                    let written = database::search::write_json_lines(&conn, &mut writer)?;
                    writer.flush()?;
                    written
                }
            };
            info!("Exported {} search documents", written);
        }
    }

    Ok(())
}

/// Command-line root first, then the settings file. Canonicalized so dataset dir paths are stable.
fn resolve_root(cli: Option<PathBuf>, settings: &Settings) -> Result<PathBuf> {
    let root = match cli.or_else(|| settings.dataset_root.clone()) {
        Some(root) => root,
        None => bail!("No dataset root given; pass --root or set DATASET_ROOT"),
    };
    canonical(&root)
}

fn canonical(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .with_context(|| format!("Dataset root {:?} is not accessible", path))
}
