//! Fill `assets.file_hash` for assets ingested without one.
//!
//! Files are hashed in parallel on a rayon pool; the updates go through a single transaction
//! and only touch rows whose hash is still null.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rayon::prelude::*;
use rusqlite::{params, Connection};
use tracing::{info, warn};

use crate::ingest::hasher::content_hash;

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub root: PathBuf,
    pub dry_run: bool,
    pub threads: Option<usize>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    pub pending: usize,
    pub hashed: usize,
    pub unreadable: usize,
    pub updated: usize,
}

struct PendingAsset {
    id: String,
    dir_path: String,
    file_path: String,
}

pub fn backfill_hashes(conn: &mut Connection, options: &BackfillOptions) -> Result<BackfillSummary> {
    let pending = pending_assets(conn)?;
    let mut summary = BackfillSummary {
        pending: pending.len(),
        ..Default::default()
    };
    if pending.is_empty() {
        info!("Every asset already has a content hash");
        return Ok(summary);
    }

    // Dataset dir paths are relative to the root's parent.
    let base = options.root.parent().unwrap_or(options.root.as_path()).to_path_buf();
    let mut builder = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("hasher-{}", i));
    if let Some(threads) = options.threads {
        builder = builder.num_threads(threads);
    }
    let pool = builder.build().context("Failed to build hashing pool")?;

    let hashes: Vec<(String, Option<String>)> = pool.install(|| {
        pending
            .par_iter()
            .map(|asset| {
                let path = asset_path(&base, asset);
                match content_hash(&path) {
                    Ok(hash) => (asset.id.clone(), Some(hash)),
                    Err(e) => {
                        warn!("Failed to hash {:?}: {}", path, e);
                        (asset.id.clone(), None)
                    }
                }
            })
            .collect()
    });

    summary.hashed = hashes.iter().filter(|(_, h)| h.is_some()).count();
    summary.unreadable = summary.pending - summary.hashed;

    if options.dry_run {
        info!("[DRY-RUN] Would write {} content hashes", summary.hashed);
        return Ok(summary);
    }

    let tx = conn.transaction().context("Failed to begin transaction")?;
    {
        let mut stmt =
            tx.prepare("UPDATE assets SET file_hash = ?1 WHERE id = ?2 AND file_hash IS NULL")?;
        for (id, hash) in &hashes {
            if let Some(hash) = hash {
                summary.updated += stmt.execute(params![hash, id])?;
            }
        }
    }
    tx.commit().context("Failed to commit transaction")?;
    info!("Wrote {} content hashes ({} unreadable)", summary.updated, summary.unreadable);
    Ok(summary)
}

fn asset_path(base: &Path, asset: &PendingAsset) -> PathBuf {
    base.join(&asset.dir_path).join(&asset.file_path)
}

fn pending_assets(conn: &Connection) -> Result<Vec<PendingAsset>> {
    let mut stmt = conn.prepare(
        "SELECT a.id, d.dir_path, a.file_path
         FROM assets a
         JOIN datasets d ON a.dataset_id = d.id
         WHERE a.file_hash IS NULL",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(PendingAsset {
            id: row.get(0)?,
            dir_path: row.get(1)?,
            file_path: row.get(2)?,
        })
    })?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
