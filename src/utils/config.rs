use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

pub const DEFAULT_DATABASE: &str = "dataset_ingest.db";

/// Settings persisted in a `.env`-style file. Command-line flags take precedence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub dataset_root: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub info_file_names: Option<Vec<String>>,
}

impl Settings {
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE))
    }
}

/// Load settings from `path`; a missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let settings = load_from_env(path)?;
    info!("Loaded settings from {:?}", path);
    Ok(settings)
}

fn load_from_env(path: &Path) -> Result<Settings> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let reader = BufReader::new(file);

    let mut settings = Settings::default();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim();
            match key.trim() {
                "DATASET_ROOT" => settings.dataset_root = Some(PathBuf::from(value)),
                "DATABASE_PATH" => settings.database_path = Some(PathBuf::from(value)),
                "INFO_FILE_NAMES" => {
                    let names: Vec<String> = value
                        .split(',')
                        .map(str::trim)
                        .filter(|n| !n.is_empty())
                        .map(str::to_string)
                        .collect();
                    if !names.is_empty() {
                        settings.info_file_names = Some(names);
                    }
                }
                _ => {}
            }
        }
    }
    Ok(settings)
}

pub fn save_to_env(path: &Path, settings: &Settings) -> Result<()> {
    let mut file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    if let Some(root) = &settings.dataset_root {
        writeln!(file, "DATASET_ROOT={}", root.display())?;
    }
    if let Some(db) = &settings.database_path {
        writeln!(file, "DATABASE_PATH={}", db.display())?;
    }
    if let Some(names) = &settings.info_file_names {
        writeln!(file, "INFO_FILE_NAMES={}", names.join(","))?;
    }
    Ok(())
}
