//! Copying and removing the attached-files tree.

use super::error::{self, Result};
use log::trace;
use snafu::ResultExt;
use std::fs;
use std::io;
use std::path::Path;
use walkdir::WalkDir;

/// Recursively copies `src` into `dst`, preserving relative paths.  Empty directories are kept.
/// `dst` is created if it doesn't exist.
pub fn copy_tree<P1, P2>(src: P1, dst: P2) -> Result<()>
where
    P1: AsRef<Path>,
    P2: AsRef<Path>,
{
    let src = src.as_ref();
    let dst = dst.as_ref();
    fs::create_dir_all(dst).context(error::IoSnafu { path: dst })?;

    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry.context(error::WalkSnafu { path: src })?;
        let relative = entry.path().strip_prefix(src).context(error::PathSnafu)?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).context(error::IoSnafu { path: &target })?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target).context(error::IoSnafu { path: &target })?;
            trace!("Copied {} to {}", entry.path().display(), target.display());
        }
        // Symlinks and special files are not part of attached-file storage.
    }
    Ok(())
}

/// Recursively removes `path`.  A missing directory is not an error.
pub fn remove_tree<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context(error::IoSnafu { path }),
    }
}
