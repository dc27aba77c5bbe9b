use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Append-only file collecting the daemon's stdout and stderr. Readers may look
/// at it while the daemon keeps writing.
#[derive(Debug, Clone)]
pub struct LogSink {
    path: PathBuf,
}

impl LogSink {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(LogSink { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> io::Result<String> {
        let bytes = fs::read(&self.path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Last `lines` lines, empty when the log cannot be read.
    pub fn tail(&self, lines: usize) -> String {
        let content = self.read().unwrap_or_default();
        let all: Vec<&str> = content.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }
}
