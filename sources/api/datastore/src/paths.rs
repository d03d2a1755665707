//! Well-known locations inside the server's data directory.

use std::path::{Path, PathBuf};

/// File name of the live database.
pub const DATABASE_FILE: &str = "workspace.db";
/// Directory holding attached files.
pub const FILES_DIR: &str = "files";
/// Scratch root for export, upload, and extraction work directories.
pub const SCRATCH_DIR: &str = "tmp";
/// Lock file that serializes lifecycle-affecting operations.
pub const LOCK_FILE: &str = "admin.lock";

/// Resolves every path the server keeps under its data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn database(&self) -> PathBuf {
        self.root.join(DATABASE_FILE)
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join(FILES_DIR)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join(SCRATCH_DIR)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Rollback snapshot taken before a destructive restore, keyed by operation ID.
    pub fn rollback_snapshot(&self, op_id: &str) -> PathBuf {
        self.root.join(format!("rollback-{}.db", op_id))
    }
}

#[cfg(test)]
mod test {
    use super::StatePaths;
    use std::path::Path;

    #[test]
    fn layout() {
        let paths = StatePaths::new("/var/lib/workspace");
        assert_eq!(
            paths.database(),
            Path::new("/var/lib/workspace/workspace.db")
        );
        assert_eq!(paths.files_dir(), Path::new("/var/lib/workspace/files"));
        assert_eq!(paths.scratch_dir(), Path::new("/var/lib/workspace/tmp"));
        assert_eq!(
            paths.rollback_snapshot("abc123"),
            Path::new("/var/lib/workspace/rollback-abc123.db")
        );
    }
}
