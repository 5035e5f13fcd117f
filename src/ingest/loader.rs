use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::error::{IngestError, Result};
use crate::ingest::locator::{InfoFile, InfoFormat};
use crate::mapping::table::RecordTable;

/// Read an info file into a working table.
pub fn load_info_file(info: &InfoFile) -> Result<RecordTable> {
    let value = read_json(&info.path)?;
    let table = match info.format {
        InfoFormat::Records => match value {
            Value::Array(records) => RecordTable::from_records(records, &info.path),
            // A lone object describes a single asset.
            object @ Value::Object(_) => RecordTable::from_records(vec![object], &info.path),
            _ => Err(IngestError::Load {
                path: info.path.clone(),
                reason: "expected an array of records".to_string(),
            }),
        },
        InfoFormat::Columnar => match value {
            Value::Object(columns) => RecordTable::from_columns(columns, &info.path),
            _ => Err(IngestError::Load {
                path: info.path.clone(),
                reason: "expected an object of columns".to_string(),
            }),
        },
    }?;
    debug!(
        "Loaded {:?}: {} records, {} fields",
        info.path,
        table.len(),
        table.columns().len()
    );
    Ok(table)
}

fn read_json(path: &Path) -> Result<Value> {
    let file = File::open(path).map_err(|source| IngestError::Filesystem {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| IngestError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_row_and_column_layouts_agree() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        let rows_path = tmp.path().join("ImageInfo.json");
        let cols_path = tmp.path().join("ImageInfo.columnar.json");
        fs::write(
            &rows_path,
            json!([{"IMG": "a.png", "W": 1}, {"IMG": "b.png", "W": 2}]).to_string(),
        )?;
        fs::write(&cols_path, json!({"IMG": ["a.png", "b.png"], "W": [1, 2]}).to_string())?;

        let rows = load_info_file(&InfoFile {
            path: rows_path,
            format: InfoFormat::Records,
        })?;
        let cols = load_info_file(&InfoFile {
            path: cols_path,
            format: InfoFormat::Columnar,
        })?;
        assert_eq!(rows, cols);
        Ok(())
    }

    #[test]
    fn test_single_object_is_one_record() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        let path = tmp.path().join("ImageInfo.json");
        fs::write(&path, json!({"IMG": "a.png"}).to_string())?;
        let table = load_info_file(&InfoFile {
            path,
            format: InfoFormat::Records,
        })?;
        assert_eq!(table.len(), 1);
        Ok(())
    }

    #[test]
    fn test_errors_are_classified() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        let broken = tmp.path().join("ImageInfo.json");
        fs::write(&broken, "[{")?;

        let parse = load_info_file(&InfoFile {
            path: broken,
            format: InfoFormat::Records,
        })
        .unwrap_err();
        assert!(matches!(parse, IngestError::Parse { .. }));

        let missing = load_info_file(&InfoFile {
            path: tmp.path().join("absent.json"),
            format: InfoFormat::Records,
        })
        .unwrap_err();
        assert!(matches!(missing, IngestError::Filesystem { .. }));
        Ok(())
    }
}
