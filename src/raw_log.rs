//! Raw data file logger.
//!
//! Every record is appended as one JSON line. After `max_rows` lines the
//! current file is closed and a new `raw_data_<timestamp>.jsonl` is opened,
//! so rollover is by row count only.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::config::RawLogConfig;

/// Errors from the raw data logger.
#[derive(Debug)]
pub enum RawLogError {
    Io(std::io::Error),
    Serialize(serde_json::Error),
}

impl std::fmt::Display for RawLogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawLogError::Io(e) => write!(f, "Raw log I/O error: {}", e),
            RawLogError::Serialize(e) => write!(f, "Failed to encode raw record: {}", e),
        }
    }
}

impl std::error::Error for RawLogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RawLogError::Io(e) => Some(e),
            RawLogError::Serialize(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for RawLogError {
    fn from(err: std::io::Error) -> Self {
        RawLogError::Io(err)
    }
}

impl From<serde_json::Error> for RawLogError {
    fn from(err: serde_json::Error) -> Self {
        RawLogError::Serialize(err)
    }
}

/// JSONL writer that rolls to a new file every `max_rows` rows.
pub struct RollingFileLogger {
    dir: PathBuf,
    max_rows: u64,
    writer: BufWriter<File>,
    path: PathBuf,
    rows: u64,
    files_opened: u64,
}

impl RollingFileLogger {
    /// Open the first log file in `dir`, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>, max_rows: u64) -> Result<Self, RawLogError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let (path, writer) = Self::open_file(&dir)?;
        info!(path = %path.display(), "Logging raw data");

        Ok(Self {
            dir,
            max_rows: max_rows.max(1),
            writer,
            path,
            rows: 0,
            files_opened: 1,
        })
    }

    pub fn from_config(config: &RawLogConfig) -> Result<Self, RawLogError> {
        Self::open(&config.dir, config.max_rows)
    }

    /// Append one record, rolling over when the row limit is reached.
    pub fn log<T: Serialize>(&mut self, record: &T) -> Result<(), RawLogError> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.rows += 1;

        if self.rows >= self.max_rows {
            self.roll()?;
        }
        Ok(())
    }

    /// Close the current file and start a new one.
    pub fn roll(&mut self) -> Result<(), RawLogError> {
        self.writer.flush()?;

        let (path, writer) = Self::open_file(&self.dir)?;
        info!(
            previous = %self.path.display(),
            path = %path.display(),
            rows = self.rows,
            "Rolled raw data log"
        );

        self.writer = writer;
        self.path = path;
        self.rows = 0;
        self.files_opened += 1;
        Ok(())
    }

    /// Flush buffered lines to disk.
    pub fn close(mut self) -> Result<(), RawLogError> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn current_path(&self) -> &Path {
        &self.path
    }

    /// Rows written to the current file.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn files_opened(&self) -> u64 {
        self.files_opened
    }

    fn open_file(dir: &Path) -> Result<(PathBuf, BufWriter<File>), RawLogError> {
        let path = dir.join(file_name());
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok((path, BufWriter::new(file)))
    }
}

/// `raw_data_<ISO-8601 UTC with ':' replaced by '-'>.jsonl`
fn file_name() -> String {
    let timestamp = Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
        .replace(':', "-");
    format!("raw_data_{}.jsonl", timestamp)
}
