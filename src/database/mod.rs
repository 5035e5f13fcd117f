pub mod executor;
pub mod schema;
pub mod search;

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;

use self::schema::SCHEMA;

/// Open (creating if needed) the catalog database and make sure every table exists.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database {:?}", path))?;
    initialize(&conn).context("Failed to initialize schema")?;
    Ok(conn)
}

pub fn initialize(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

#[cfg(test)]
pub fn open_in_memory() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    initialize(&conn).unwrap();
    conn
}
