// Job registry - discovers workers from descriptor files in the runtime directory

//! # Job Registry
//!
//! Every job worker writes a small JSON descriptor named `jobserver-<pid>` into a
//! shared runtime directory when it starts, and removes it when it exits. The
//! server scans that directory to learn which workers exist.
//!
//! ## Failure Handling
//!
//! Discovery is best-effort: a descriptor that cannot be read or parsed is
//! logged and skipped so one broken file never hides the healthy workers.
//! A descriptor left behind by a dead process is still listed; the dispatcher
//! fails only the dispatch attempts that land on it.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::models::WorkerDescriptor;
use crate::{JobsError, Result};

/// Directory name under the runtime directory shared by server and workers
pub const APP_NAME: &str = "graphql-jobs";

/// File name prefix of worker descriptors
pub const DESCRIPTOR_PREFIX: &str = "jobserver-";

/// `${XDG_RUNTIME_DIR}/<app>` or, when unset, `~/.config/<app>`
pub fn runtime_dir(app_name: &str) -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(std::env::temp_dir);
    base.join(app_name)
}

/// Path of the descriptor file for the worker with the given pid
pub fn descriptor_path(dir: &Path, pid: u32) -> PathBuf {
    dir.join(format!("{}{}", DESCRIPTOR_PREFIX, pid))
}

/// Read and parse a single descriptor file
pub fn read_descriptor(path: &Path) -> Result<WorkerDescriptor> {
    let malformed = |reason: String| JobsError::MalformedDescriptor {
        path: path.display().to_string(),
        reason,
    };

    let content = fs::read_to_string(path).map_err(|e| malformed(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| malformed(e.to_string()))
}

/// List every worker published in `dir`
///
/// Files are visited in name order so that repeated scans of an unchanged
/// directory produce the same list (and the same round-robin rotation).
/// A missing directory simply means no workers have started yet.
pub fn list_workers(dir: &Path) -> Vec<WorkerDescriptor> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Runtime directory {} does not exist yet", dir.display());
            return Vec::new();
        }
        Err(e) => {
            warn!("Failed to read runtime directory {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with(DESCRIPTOR_PREFIX))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut workers = Vec::with_capacity(paths.len());
    for path in paths {
        debug!("read server_info: {}", path.display());
        match read_descriptor(&path) {
            Ok(descriptor) => workers.push(descriptor),
            Err(e) => warn!("Skipping worker descriptor: {}", e),
        }
    }
    workers
}

/// A published descriptor file, removed again when dropped
#[derive(Debug)]
pub struct DescriptorFile {
    path: PathBuf,
    removed: bool,
}

impl DescriptorFile {
    /// Write `descriptor` into `dir`, creating the directory if needed
    pub fn publish(dir: &Path, descriptor: &WorkerDescriptor) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let path = descriptor_path(dir, descriptor.pid);
        let content = serde_json::to_string_pretty(descriptor)?;
        fs::write(&path, content)?;
        debug!("Published worker descriptor {}", path.display());

        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file; a file that is already gone is not an error
    pub fn remove(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }
        self.removed = true;

        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Removed worker descriptor {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for DescriptorFile {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_malformed_descriptor_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "jobserver-1", r#"{"pid": 1, "ip": "127.0.0.1", "port": 0, "command_port": 7001}"#);
        write(dir.path(), "jobserver-2", "{not json");
        write(dir.path(), "jobserver-3", r#"{"pid": 3, "ip": "127.0.0.1", "port": 7003}"#);

        let workers = list_workers(dir.path());

        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].pid, 1);
        assert_eq!(workers[1].pid, 3);
    }

    #[test]
    fn test_unrelated_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "notes.txt", "hello");
        write(dir.path(), "jobserver-9", r#"{"pid": 9, "ip": "*", "port": 9009}"#);

        let workers = list_workers(dir.path());
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].address(), "127.0.0.1:9009");
    }

    #[test]
    fn test_missing_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not-there");
        assert!(list_workers(&missing).is_empty());
    }

    #[test]
    fn test_read_descriptor_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "jobserver-5", "[]");

        let err = read_descriptor(&dir.path().join("jobserver-5")).unwrap_err();
        match err {
            JobsError::MalformedDescriptor { path, .. } => assert!(path.ends_with("jobserver-5")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_descriptor_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join(APP_NAME);
        let descriptor = WorkerDescriptor::new(4242, "127.0.0.1", 0, 7777);

        let path = {
            let file = DescriptorFile::publish(&nested, &descriptor).unwrap();
            assert!(file.path().exists());
            assert_eq!(list_workers(&nested), vec![descriptor.clone()]);
            file.path().to_path_buf()
        };

        assert!(!path.exists());
        assert!(list_workers(&nested).is_empty());
    }

    #[test]
    fn test_remove_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = WorkerDescriptor::new(1, "127.0.0.1", 0, 7000);
        let mut file = DescriptorFile::publish(dir.path(), &descriptor).unwrap();

        fs::remove_file(file.path()).unwrap();
        assert!(file.remove().is_ok());
        assert!(file.remove().is_ok());
    }
}
