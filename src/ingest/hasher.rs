use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use memmap2::MmapOptions;
use sha2::{Digest, Sha256};

const MMAP_THRESHOLD: u64 = 500 * 1024 * 1024; // 500 MB
const READ_CHUNK: usize = 128 * 1024;

/// Hex SHA-256 of an asset file's bytes, as stored in `assets.file_hash`.
pub fn content_hash(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Failed to open asset: {:?}", path))?;
    let len = file.metadata()?.len();

    let mut hasher = Sha256::new();

    if len > MMAP_THRESHOLD {
        // The mapping is read-only and dropped before returning; assets are not expected to
        // change while a backfill runs.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        hasher.update(&mmap);
    } else {
        let mut reader = BufReader::new(file);
        let mut buffer = vec![0u8; READ_CHUNK];
        loop {
            let count = reader.read(&mut buffer)?;
            if count == 0 {
                break;
            }
            hasher.update(&buffer[..count]);
        }
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_content_hash() -> Result<()> {
        let tmp = tempdir()?;
        let path = tmp.path().join("a.png");
        fs::write(&path, b"abc")?;
        assert_eq!(
            content_hash(&path)?,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        Ok(())
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(content_hash(Path::new("/nonexistent/asset.png")).is_err());
    }
}
