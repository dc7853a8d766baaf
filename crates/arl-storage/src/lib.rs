use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use arl_core::Activity;
use thiserror::Error;

pub const ACTIVITY_DIR_NAME: &str = "ledger";
pub const ACTIVITY_FILE_NAME: &str = "activity.jsonl";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub activities: Vec<Activity>,
    pub skipped_corrupt_lines: usize,
}

#[derive(Debug)]
pub struct ActivityLog {
    path: PathBuf,
}

impl ActivityLog {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        let path = state_dir
            .as_ref()
            .join(ACTIVITY_DIR_NAME)
            .join(ACTIVITY_FILE_NAME);
        ActivityLog { path }
    }

    pub fn file_path(&self) -> &Path {
        &self.path
    }

    // A missing file is an empty ledger.
    pub fn load(&self) -> Result<LoadReport, StorageError> {
        if !self.path.exists() {
            return Ok(LoadReport::default());
        }
        let raw = fs::read_to_string(&self.path)?;
        let mut report = LoadReport::default();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Activity>(line) {
                Ok(activity) if !activity.id.is_empty() => report.activities.push(activity),
                _ => report.skipped_corrupt_lines += 1,
            }
        }
        Ok(report)
    }

    pub fn append(&self, activity: &Activity) -> Result<(), StorageError> {
        self.ensure_parent()?;
        let mut line = serde_json::to_string(activity)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    pub fn rewrite(&self, activities: &[Activity]) -> Result<(), StorageError> {
        self.ensure_parent()?;
        let mut out = String::new();
        for activity in activities {
            out.push_str(&serde_json::to_string(activity)?);
            out.push('\n');
        }
        fs::write(&self.path, out)?;
        Ok(())
    }

    fn ensure_parent(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}
