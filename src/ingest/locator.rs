use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Layout of a recognized info file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoFormat {
    /// JSON array of per-asset objects.
    Records,
    /// JSON object of equally long per-field arrays.
    Columnar,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoFileName {
    pub name: String,
    pub format: InfoFormat,
}

impl InfoFileName {
    /// Columnar when the name carries a `.columnar.` marker, row-oriented otherwise.
    pub fn parse(name: &str) -> Self {
        let format = if name.to_ascii_lowercase().contains(".columnar.") {
            InfoFormat::Columnar
        } else {
            InfoFormat::Records
        };
        Self {
            name: name.to_string(),
            format,
        }
    }
}

pub fn default_info_names() -> Vec<InfoFileName> {
    vec![
        InfoFileName::parse("ImageInfo.json"),
        InfoFileName::parse("ImageInfo.columnar.json"),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoFile {
    pub path: PathBuf,
    pub format: InfoFormat,
}

/// Nearest enclosing directory with at least one info file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRoot {
    pub dir: PathBuf,
    pub info_files: Vec<InfoFile>,
}

#[derive(Debug, Default)]
pub struct DatasetScan {
    pub roots: Vec<DatasetRoot>,
    /// Largest subtrees that hold no info file anywhere below them.
    pub infoless: Vec<PathBuf>,
    /// Directories that could not be read and were skipped.
    pub unreadable: Vec<PathBuf>,
}

impl DatasetScan {
    pub fn info_files(&self) -> impl Iterator<Item = (&DatasetRoot, &InfoFile)> + '_ {
        self.roots
            .iter()
            .flat_map(|root| root.info_files.iter().map(move |f| (root, f)))
    }
}

/// Classify the tree under `root` into dataset roots and info-less subtrees.
///
/// Once a directory holds an info file it becomes a dataset root and is not searched any
/// deeper. Unreadable directories are logged and skipped; the walk carries on with siblings.
pub fn locate_datasets(root: &Path, names: &[InfoFileName]) -> DatasetScan {
    let mut scan = DatasetScan::default();
    let mut visited: Vec<PathBuf> = Vec::new();

    let mut walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e));

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable path: {}", e);
                if let Some(path) = e.path() {
                    scan.unreadable.push(path.to_path_buf());
                }
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }

        let dir = entry.path().to_path_buf();
        match matching_info_files(&dir, names) {
            Ok(info_files) if !info_files.is_empty() => {
                debug!("Dataset root {:?} ({} info files)", dir, info_files.len());
                scan.roots.push(DatasetRoot { dir, info_files });
                walker.skip_current_dir();
            }
            Ok(_) => visited.push(dir),
            Err(e) => {
                warn!("Skipping unreadable directory {:?}: {}", dir, e);
                scan.unreadable.push(dir);
                walker.skip_current_dir();
            }
        }
    }

    scan.infoless = infoless_subtrees(root, &visited, &scan.roots, &scan.unreadable);
    scan
}

fn matching_info_files(dir: &Path, names: &[InfoFileName]) -> std::io::Result<Vec<InfoFile>> {
    let mut found = Vec::new();
    let mut entries: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            entries.push(entry.path());
        }
    }
    // Declared name order decides processing order inside a dataset.
    for name in names {
        for path in &entries {
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.eq_ignore_ascii_case(&name.name))
                .unwrap_or(false);
            if matches {
                found.push(InfoFile {
                    path: path.clone(),
                    format: name.format,
                });
            }
        }
    }
    Ok(found)
}

fn infoless_subtrees(
    root: &Path,
    visited: &[PathBuf],
    roots: &[DatasetRoot],
    unreadable: &[PathBuf],
) -> Vec<PathBuf> {
    let has_dataset = |dir: &Path| roots.iter().any(|r| r.dir.starts_with(dir));
    if roots.is_empty() {
        return if visited.iter().any(|d| d == root) {
            vec![root.to_path_buf()]
        } else {
            Vec::new()
        };
    }

    let empty: HashSet<&PathBuf> = visited
        .iter()
        .filter(|d| !has_dataset(d.as_path()))
        .filter(|d| !unreadable.iter().any(|u| u.starts_with(d.as_path())))
        .collect();
    visited
        .iter()
        .filter(|d| empty.contains(d))
        .filter(|d| d.parent().map(|p| has_dataset(p)).unwrap_or(false))
        .cloned()
        .collect()
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name()
         .to_str()
         .map(|s| s.starts_with('.'))
         .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir_all, File};
    use tempfile::tempdir;

    #[test]
    fn test_nested_leaf_is_the_only_dataset() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        let root = tmp.path().join("root");
        create_dir_all(root.join("sub/leaf"))?;
        create_dir_all(root.join("other"))?;
        File::create(root.join("sub/leaf/ImageInfo.json"))?;

        let scan = locate_datasets(&root, &default_info_names());
        assert_eq!(scan.roots.len(), 1);
        assert_eq!(scan.roots[0].dir, root.join("sub/leaf"));
        assert_eq!(scan.infoless, vec![root.join("other")]);
        Ok(())
    }

    #[test]
    fn test_dataset_root_is_not_searched_deeper() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        let root = tmp.path().join("root");
        create_dir_all(root.join("ds/nested"))?;
        File::create(root.join("ds/imageinfo.json"))?;
        File::create(root.join("ds/nested/ImageInfo.json"))?;

        let scan = locate_datasets(&root, &default_info_names());
        assert_eq!(scan.roots.len(), 1);
        assert_eq!(scan.roots[0].dir, root.join("ds"));
        Ok(())
    }

    #[test]
    fn test_both_layouts_reduce_to_one_root() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        let root = tmp.path().join("ds");
        create_dir_all(&root)?;
        File::create(root.join("ImageInfo.columnar.json"))?;
        File::create(root.join("ImageInfo.json"))?;
        File::create(root.join("notes.json"))?;

        let scan = locate_datasets(&root, &default_info_names());
        assert_eq!(scan.roots.len(), 1);
        let formats: Vec<InfoFormat> = scan.roots[0].info_files.iter().map(|f| f.format).collect();
        assert_eq!(formats, vec![InfoFormat::Records, InfoFormat::Columnar]);
        assert_eq!(scan.info_files().count(), 2);
        assert!(scan.infoless.is_empty());
        Ok(())
    }

    #[test]
    fn test_tree_without_info_files() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        create_dir_all(tmp.path().join("a/b"))?;
        let scan = locate_datasets(tmp.path(), &default_info_names());
        assert!(scan.roots.is_empty());
        assert_eq!(scan.infoless, vec![tmp.path().to_path_buf()]);
        Ok(())
    }

    #[test]
    fn test_hidden_directories_are_ignored() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        create_dir_all(tmp.path().join(".cache/ds"))?;
        File::create(tmp.path().join(".cache/ds/ImageInfo.json"))?;
        let scan = locate_datasets(tmp.path(), &default_info_names());
        assert!(scan.roots.is_empty());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_directory_is_skipped() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempdir()?;
        let root = tmp.path().join("root");
        create_dir_all(root.join("ds"))?;
        create_dir_all(root.join("locked/inner"))?;
        File::create(root.join("ds/ImageInfo.json"))?;
        File::create(root.join("locked/inner/ImageInfo.json"))?;

        let locked = root.join("locked");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000))?;
        if fs::read_dir(&locked).is_ok() {
            // Permission bits do not bind a privileged user.
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755))?;
            return Ok(());
        }

        let scan = locate_datasets(&root, &default_info_names());
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755))?;

        assert_eq!(scan.roots.len(), 1);
        assert_eq!(scan.roots[0].dir, root.join("ds"));
        assert_eq!(scan.unreadable, vec![locked]);
        assert!(scan.infoless.is_empty());
        Ok(())
    }
}
