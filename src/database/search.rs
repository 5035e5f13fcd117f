//! Feed for the external vector/search index: one document per asset.

use std::io::Write;

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchDocument {
    pub asset_id: String,
    pub embedding: Option<Value>,
    /// Always false: nothing in this pipeline deletes assets.
    pub deletion_flag: bool,
}

pub fn search_documents(conn: &Connection) -> Result<Vec<SearchDocument>> {
    let mut stmt = conn.prepare("SELECT id, embedding FROM assets ORDER BY dataset_id, file_path")?;
    let docs = stmt.query_map([], |row| {
        let asset_id: String = row.get(0)?;
        let embedding: Option<String> = row.get(1)?;
        Ok((asset_id, embedding))
    })?;

    let mut out = Vec::new();
    for doc in docs {
        let (asset_id, embedding) = doc?;
        let embedding: Option<Value> = embedding
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("Stored embedding of asset {} is not JSON", asset_id))?;
        out.push(SearchDocument {
            asset_id,
            embedding,
            deletion_flag: false,
        });
    }
    Ok(out)
}

/// Write documents as JSON lines. Returns how many were written.
pub fn write_json_lines<W: Write>(conn: &Connection, mut out: W) -> Result<usize> {
    let docs = search_documents(conn)?;
    for doc in &docs {
        serde_json::to_writer(&mut out, doc)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(docs.len())
}
