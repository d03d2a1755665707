//! Building a backup archive of live state and streaming it to the client.

use crate::server::error::{self, Result};
use crate::server::lifecycle::{Lifecycle, LifecycleGuard, Operation};
use archive::{SnapshotMetadata, DATABASE_ENTRY, FILES_DIR_ENTRY};
use bytes::Bytes;
use datastore::snapshot::copy_tree;
use futures::Stream;
use log::{debug, info, warn};
use snafu::ResultExt;
use std::fmt;
use std::fs::File;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tempfile::TempDir;
use tokio_util::io::ReaderStream;

/// Name of the archive inside the export work directory.
const ARCHIVE_NAME: &str = "workspace-backup.zip";
/// Size of each chunk sent to the client.
const CHUNK_SIZE: usize = 64 * 1024;

/// Snapshots live state into an archive under the scratch directory and returns a stream of its
/// bytes.  Storage is only read; requests keep being served while the snapshot is taken.
///
/// The lifecycle lock is held until the stream is dropped, so no import or reconfiguration can
/// start while the archive is being delivered.
pub(crate) fn prepare(lifecycle: &Lifecycle) -> Result<ArchiveStream> {
    let guard = lifecycle.acquire(Operation::Export)?;

    let scratch = lifecycle.paths().scratch_dir();
    let work = tempfile::Builder::new()
        .prefix("export-")
        .tempdir_in(&scratch)
        .context(error::ExportScratchSnafu { path: &scratch })?;
    let database = work.path().join(DATABASE_ENTRY);
    let files = work.path().join(FILES_DIR_ENTRY);

    lifecycle.with_storage(|state| {
        state
            .database
            .snapshot_to(&database)
            .context(error::SnapshotSnafu)?;
        copy_tree(&state.files_dir, &files).context(error::FilesSnapshotSnafu)
    })?;

    let archive_path = work.path().join(ARCHIVE_NAME);
    archive::write(&SnapshotMetadata::now(), &database, &files, &archive_path)
        .context(error::ArchiveWriteSnafu)?;
    let file = File::open(&archive_path).context(error::ArchiveOpenSnafu {
        path: &archive_path,
    })?;
    info!("Built backup archive in {}", work.path().display());

    Ok(ArchiveStream {
        reader: ReaderStream::with_capacity(tokio::fs::File::from_std(file), CHUNK_SIZE),
        work: Some(work),
        _guard: guard,
        sent: 0,
        done: false,
    })
}

/// Streams a built archive from disk, with reads done off the worker thread.  Dropping the
/// stream, whether delivery finished or the client went away, removes the export work directory
/// and releases the lifecycle lock.
pub(crate) struct ArchiveStream {
    reader: ReaderStream<tokio::fs::File>,
    work: Option<TempDir>,
    _guard: LifecycleGuard,
    sent: u64,
    done: bool,
}

impl Stream for ArchiveStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.reader).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.sent += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(None) => {
                this.done = true;
                debug!("Sent {} archive bytes", this.sent);
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl fmt::Debug for ArchiveStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveStream")
            .field("work", &self.work)
            .field("sent", &self.sent)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl Drop for ArchiveStream {
    fn drop(&mut self) {
        if !self.done {
            warn!("Archive delivery stopped after {} bytes", self.sent);
        }
        if let Some(work) = self.work.take() {
            let path = work.path().to_path_buf();
            match work.close() {
                Ok(()) => debug!("Removed export directory {}", path.display()),
                Err(e) => warn!("Failed to remove export directory {}: {}", path.display(), e),
            }
        }
    }
}
