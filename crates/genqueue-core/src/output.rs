//! Per-task output files, the queue's only result channel.

use std::io::Write;
use std::path::PathBuf;

use genqueue_common::config::is_plain_file_name;
use genqueue_common::{GenqueueError, Result};

#[derive(Debug, Clone)]
pub struct OutputSink {
    root: PathBuf,
    allowed: Vec<String>,
}

impl OutputSink {
    pub fn new(root: impl Into<PathBuf>, allowed: Vec<String>) -> Self {
        Self { root: root.into(), allowed }
    }

    /// Path of a declared output; unknown names and unsafe ids are refused.
    pub fn path(&self, task_id: &str, name: &str) -> Result<PathBuf> {
        if !is_plain_file_name(task_id) || !self.allowed.iter().any(|n| n == name) {
            return Err(GenqueueError::OutputNotFound(name.to_string()));
        }
        Ok(self.root.join(task_id).join(name))
    }

    /// Writes through a temporary file and renames it into place, so a
    /// reader never sees a partial output.
    pub fn write(&self, task_id: &str, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.path(task_id, name)?;
        let dir = path.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(dir)?;
        let tmp = dir.join(format!(".{name}.partial"));
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(contents.as_bytes())?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    pub fn read(&self, task_id: &str, name: &str) -> Result<String> {
        let path = self.path(task_id, name)?;
        std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => GenqueueError::OutputNotFound(name.to_string()),
            _ => GenqueueError::Io(e),
        })
    }
}
