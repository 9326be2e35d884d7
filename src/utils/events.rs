//! Scalar event stream
//!
//! Epoch metrics are appended as JSON lines to
//! `<save_path>/log/<YYYYmmdd_HHMMSS>/events.jsonl`, one record per scalar.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::utils::error::{Result, SegMixError};

/// One scalar record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub tag: String,
    pub value: f64,
    pub step: usize,
    pub wall_time: String,
}

/// Append-only writer for scalar events
pub struct EventWriter {
    dir: PathBuf,
    writer: BufWriter<File>,
}

impl EventWriter {
    /// Create a timestamped run directory under `<save_path>/log/`
    pub fn create(save_path: &Path) -> Result<Self> {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        Self::create_in(&save_path.join("log").join(timestamp))
    }

    /// Open (or create) an event file inside an explicit directory
    pub fn create_in(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("events.jsonl"))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one scalar and flush
    pub fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        let event = ScalarEvent {
            tag: tag.to_string(),
            value,
            step,
            wall_time: Local::now().to_rfc3339(),
        };
        let line = serde_json::to_string(&event)
            .map_err(|e| SegMixError::Serialization(format!("Failed to encode event: {}", e)))?;
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Read every event back from an event file
pub fn read_events(path: &Path) -> Result<Vec<ScalarEvent>> {
    let content = fs::read_to_string(path)?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .map_err(|e| SegMixError::Serialization(format!("Bad event line: {}", e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_run_directory_layout() {
        let tmp = tempdir().unwrap();
        let writer = EventWriter::create(tmp.path()).unwrap();

        let dir = writer.dir();
        assert_eq!(dir.parent().unwrap(), tmp.path().join("log"));
        let name = dir.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(name.len(), "20240101_120000".len());
        assert_eq!(&name[8..9], "_");
    }

    #[test]
    fn test_scalars_are_appended() {
        let tmp = tempdir().unwrap();
        let mut writer = EventWriter::create_in(tmp.path()).unwrap();
        writer.add_scalar("train/loss_all", 0.75, 0).unwrap();
        writer.add_scalar("eval/mIoU", 41.5, 0).unwrap();

        let events = read_events(&tmp.path().join("events.jsonl")).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].tag, "train/loss_all");
        assert!((events[1].value - 41.5).abs() < 1e-12);
    }
}
