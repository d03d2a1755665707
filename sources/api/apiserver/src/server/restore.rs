//! Replacing live state with the contents of an uploaded backup archive.
//!
//! Restoring is destructive: the current database and attached files are deleted before the
//! archive is unpacked into their place.  A rollback snapshot of the database is written first,
//! and it's the only way back if anything fails after the deletion; the server doesn't revert on
//! its own.  Such a failure leaves storage in the failed phase with the snapshot kept on disk.

use crate::server::error::{self, Error, Result};
use crate::server::lifecycle::{Lifecycle, LifecycleGuard};
use archive::ParsedArchive;
use datastore::snapshot::remove_tree;
use datastore::{Database, StatePaths};
use log::{debug, error, info, warn};
use nix::{dir::Dir, fcntl::OFlag, sys::stat::Mode, unistd::fsync};
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use snafu::ResultExt;
use std::fs;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use tempfile::NamedTempFile;

/// An uploaded archive waiting to be restored.  The file is removed when this is dropped.
#[derive(Debug)]
pub(crate) struct Upload {
    pub(crate) filename: String,
    pub(crate) size: u64,
    pub(crate) file: NamedTempFile,
}

/// Restores server state from `upload`, then hands the lock to the server loop for a restart.
///
/// Runs to completion once started; it's meant to be called off the request path so that a
/// client disconnect can't abandon it halfway.
pub(crate) fn import(lifecycle: &Lifecycle, guard: LifecycleGuard, upload: Upload) -> Result<()> {
    let op_id = rando();
    let paths = lifecycle.paths();
    let rollback = paths.rollback_snapshot(&op_id);
    info!(
        "Starting restore {} from '{}' ({} bytes)",
        op_id, upload.filename, upload.size
    );

    // Nothing has been touched yet, so failures up to the drain leave the server as it was.
    if let Err(e) = lifecycle.with_storage(|state| {
        state
            .database
            .snapshot_to(&rollback)
            .context(error::SnapshotSnafu)
    }) {
        discard(&rollback);
        return Err(e);
    }
    debug!("Rollback snapshot written to {}", rollback.display());

    if let Err(e) = lifecycle.drain(&guard) {
        discard(&rollback);
        return Err(e);
    }

    let replaced = replace_state(paths, upload.file.path());
    let upload_path = upload.file.path().to_path_buf();
    if let Err(e) = upload.file.close() {
        warn!(
            "Failed to remove uploaded archive {}: {}",
            upload_path.display(),
            e
        );
    }

    match replaced.and_then(|()| lifecycle.reinitialize(&guard)) {
        Ok(()) => {
            discard(&rollback);
            info!("Restore {} complete", op_id);
            lifecycle.restart_server(guard)
        }
        Err(e) => {
            let e = Error::StateReplace {
                rollback: rollback.clone(),
                source: Box::new(e),
            };
            error!("Restore {} failed: {}", op_id, e);
            lifecycle.mark_failed(e.to_string());
            Err(e)
        }
    }
}

/// Deletes the current database and attached files, then moves the archive's contents into
/// their place.  Scratch extraction is cleaned up whichever way this goes.
fn replace_state(paths: &StatePaths, archive_path: &Path) -> Result<()> {
    let database = paths.database();
    let files_dir = paths.files_dir();

    Database::delete_files(&database).context(error::DeleteStateSnafu)?;
    remove_tree(&files_dir).context(error::DeleteStateSnafu)?;
    debug!("Removed current database and attached files");

    let extracted =
        archive::read(archive_path, paths.scratch_dir()).context(error::ArchiveReadSnafu)?;
    let moved = match extracted.parsed() {
        ParsedArchive::Versioned {
            metadata,
            database: extracted_db,
            files,
        } => {
            info!("Restoring {} archive", metadata);
            move_path(files, &files_dir).and_then(|()| move_path(extracted_db, &database))
        }
        ParsedArchive::Legacy {
            database: extracted_db,
        } => {
            info!("Restoring legacy archive with no attached files");
            move_path(extracted_db, &database).and_then(|()| {
                fs::create_dir_all(&files_dir).context(error::PrepareDirSnafu { path: &files_dir })
            })
        }
    };

    let scratch = extracted.scratch_path().to_path_buf();
    if let Err(e) = extracted.close() {
        warn!(
            "Failed to remove extraction directory {}: {}",
            scratch.display(),
            e
        );
    }
    moved?;

    sync_dir(paths.root());
    Ok(())
}

fn move_path(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).context(error::MoveStateSnafu { from, to })
}

/// fsync the data directory so the renames survive a crash right after this.
fn sync_dir(dir: &Path) {
    let raw_dir = match Dir::open(dir, OFlag::O_DIRECTORY, Mode::empty()) {
        Ok(raw_dir) => raw_dir,
        Err(e) => {
            warn!("Unable to open '{}' for fsync: {}", dir.display(), e);
            return;
        }
    };
    fsync(raw_dir.as_raw_fd()).unwrap_or_else(|e| {
        warn!(
            "fsync of data directory '{}' failed, restore may disappear if we crash now: {}",
            dir.display(),
            e
        )
    });
}

/// Removes a rollback snapshot that's no longer needed.
fn discard(rollback: &Path) {
    if let Err(e) = Database::delete_files(rollback) {
        warn!(
            "Failed to remove rollback snapshot {}: {}",
            rollback.display(),
            e
        );
    }
}

/// Generates a random alphanumeric string for naming per-operation files.
fn rando() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod test {
    use super::{import, Upload};
    use crate::server::error::Error;
    use crate::server::export::prepare;
    use crate::server::lifecycle::{Lifecycle, Operation, Phase, RestartRequest};
    use datastore::{ConfigRecord, ConfigStore, StatePaths};
    use futures::StreamExt;
    use std::fs;
    use std::io::Write;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::{NamedTempFile, TempDir};
    use tokio::sync::mpsc::UnboundedReceiver;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn open(dir: &Path) -> (Lifecycle, UnboundedReceiver<RestartRequest>) {
        Lifecycle::open(StatePaths::new(dir), Duration::from_secs(1)).unwrap()
    }

    fn upload_from(lifecycle: &Lifecycle, bytes: &[u8]) -> Upload {
        let mut file = NamedTempFile::new_in(lifecycle.paths().scratch_dir()).unwrap();
        file.write_all(bytes).unwrap();
        Upload {
            filename: "backup.zip".to_string(),
            size: bytes.len() as u64,
            file,
        }
    }

    fn export_bytes(lifecycle: &Lifecycle) -> Vec<u8> {
        let stream = prepare(lifecycle).unwrap();
        // The archive is read through the async runtime, as it would be in a response
        actix_rt::System::new()
            .block_on(stream.collect::<Vec<_>>())
            .into_iter()
            .flat_map(|c| c.unwrap().to_vec())
            .collect()
    }

    fn rollback_files(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("rollback-"))
            .collect()
    }

    fn store(lifecycle: &Lifecycle, name: &str, payload: &[u8]) {
        lifecycle
            .with_storage_mut(|state| {
                state
                    .database
                    .upsert_config(&ConfigRecord::new(name, payload))
                    .unwrap();
                Ok(())
            })
            .unwrap();
    }

    fn stored(lifecycle: &Lifecycle, name: &str) -> Option<Vec<u8>> {
        lifecycle
            .with_storage(|state| Ok(state.database.get_config(name).unwrap()))
            .unwrap()
            .map(|r| r.payload)
    }

    #[test]
    fn export_import_round_trip() {
        let source = TempDir::new().unwrap();
        let (exporter, _rx) = open(source.path());
        store(&exporter, "auth_config", br#"{"providers":[{"id":"github"}]}"#);
        store(&exporter, "blob", &[0u8, 159, 146, 150]);
        exporter
            .with_storage(|state| {
                fs::create_dir_all(state.files_dir.join("req/7")).unwrap();
                fs::write(state.files_dir.join("req/7/body.bin"), [1u8, 2, 3]).unwrap();
                Ok(())
            })
            .unwrap();
        let bytes = export_bytes(&exporter);

        let target = TempDir::new().unwrap();
        let (importer, mut rx) = open(target.path());
        store(&importer, "blob", b"to be replaced");
        fs::write(importer.paths().files_dir().join("stale.txt"), b"stale").unwrap();

        let guard = importer.acquire(Operation::Import).unwrap();
        let upload = upload_from(&importer, &bytes);
        let upload_path = upload.file.path().to_path_buf();
        import(&importer, guard, upload).unwrap();

        assert_eq!(stored(&importer, "blob").unwrap(), vec![0u8, 159, 146, 150]);
        assert_eq!(
            stored(&importer, "auth_config").unwrap(),
            br#"{"providers":[{"id":"github"}]}"#.to_vec()
        );
        let files = importer.paths().files_dir();
        assert_eq!(fs::read(files.join("req/7/body.bin")).unwrap(), vec![1u8, 2, 3]);
        assert!(!files.join("stale.txt").exists());
        // Auth config was reloaded along with storage
        let ids = importer
            .with_storage(|state| Ok(state.auth.provider_ids()))
            .unwrap();
        assert_eq!(ids, vec!["github"]);

        assert!(!upload_path.exists());
        assert!(rollback_files(target.path()).is_empty());
        assert_eq!(
            fs::read_dir(importer.paths().scratch_dir()).unwrap().count(),
            0
        );

        // Restart was requested and still holds the lock
        assert!(importer.acquire(Operation::Export).is_err());
        let request = rx.try_recv().unwrap();
        assert_eq!(request.guard().operation(), Operation::Import);
    }

    #[test]
    fn legacy_import_has_no_files() {
        let work = TempDir::new().unwrap();
        let legacy_db = work.path().join("legacy.db");
        {
            let mut db = datastore::Database::open(&legacy_db).unwrap();
            db.upsert_config(&ConfigRecord::new("blob", "legacy")).unwrap();
            db.close().unwrap();
        }
        let legacy_zip = work.path().join("legacy.zip");
        let mut zip = ZipWriter::new(fs::File::create(&legacy_zip).unwrap());
        zip.start_file("workspace.db", FileOptions::default()).unwrap();
        zip.write_all(&fs::read(&legacy_db).unwrap()).unwrap();
        zip.finish().unwrap();

        let target = TempDir::new().unwrap();
        let (importer, _rx) = open(target.path());
        fs::write(importer.paths().files_dir().join("old.txt"), b"old").unwrap();

        let guard = importer.acquire(Operation::Import).unwrap();
        let upload = upload_from(&importer, &fs::read(&legacy_zip).unwrap());
        import(&importer, guard, upload).unwrap();

        assert_eq!(stored(&importer, "blob").unwrap(), b"legacy".to_vec());
        let files = importer.paths().files_dir();
        assert!(files.is_dir());
        assert_eq!(fs::read_dir(files).unwrap().count(), 0);
    }

    #[test]
    fn archives_from_other_writers_import() {
        let work = TempDir::new().unwrap();
        let db_path = work.path().join("other.db");
        {
            let mut db = datastore::Database::open(&db_path).unwrap();
            db.upsert_config(&ConfigRecord::new("blob", "from elsewhere"))
                .unwrap();
            db.close().unwrap();
        }
        let db_bytes = fs::read(&db_path).unwrap();

        for metadata in [
            r#"{"version":"1.1","createdAt":"2024-01-01T00:00:00Z"}"#,
            r#"{"version":"1.0"}"#,
        ] {
            let zip_path = work.path().join("other.zip");
            let mut zip = ZipWriter::new(fs::File::create(&zip_path).unwrap());
            zip.start_file("metadata.json", FileOptions::default())
                .unwrap();
            zip.write_all(metadata.as_bytes()).unwrap();
            zip.start_file("workspace.db", FileOptions::default())
                .unwrap();
            zip.write_all(&db_bytes).unwrap();
            zip.start_file("files/attached.txt", FileOptions::default())
                .unwrap();
            zip.write_all(b"attached").unwrap();
            zip.finish().unwrap();

            let target = TempDir::new().unwrap();
            let (importer, mut rx) = open(target.path());
            store(&importer, "blob", b"live");

            let guard = importer.acquire(Operation::Import).unwrap();
            let upload = upload_from(&importer, &fs::read(&zip_path).unwrap());
            import(&importer, guard, upload).unwrap();

            assert_eq!(importer.phase(), Phase::Running { generation: 2 });
            assert_eq!(
                stored(&importer, "blob").unwrap(),
                b"from elsewhere".to_vec()
            );
            assert_eq!(
                fs::read(importer.paths().files_dir().join("attached.txt")).unwrap(),
                b"attached"
            );
            assert!(rollback_files(target.path()).is_empty());
            assert!(rx.try_recv().is_ok());
        }
    }

    #[test]
    fn corrupt_archive_keeps_rollback() {
        let target = TempDir::new().unwrap();
        let (importer, mut rx) = open(target.path());
        store(&importer, "blob", b"precious");

        let guard = importer.acquire(Operation::Import).unwrap();
        let upload = upload_from(&importer, b"definitely not a zip");
        let err = import(&importer, guard, upload).unwrap_err();
        assert!(matches!(err, Error::StateReplace { .. }), "{}", err);

        // Storage refuses requests instead of pretending to be healthy
        assert!(matches!(importer.phase(), Phase::Failed { .. }));
        assert!(importer.with_storage(|_| Ok(())).is_err());
        assert!(rx.try_recv().is_err());

        // The rollback snapshot holds the pre-restore data
        let rollbacks = rollback_files(target.path());
        assert_eq!(rollbacks.len(), 1);
        let rollback = datastore::Database::open(target.path().join(&rollbacks[0])).unwrap();
        assert_eq!(
            rollback.get_config("blob").unwrap().unwrap().payload,
            b"precious".to_vec()
        );
        assert_eq!(
            fs::read_dir(importer.paths().scratch_dir()).unwrap().count(),
            0
        );
    }

    #[test]
    fn drain_timeout_destroys_nothing() {
        let target = TempDir::new().unwrap();
        let (importer, _rx) =
            Lifecycle::open(StatePaths::new(target.path()), Duration::from_millis(200)).unwrap();
        store(&importer, "blob", b"kept");
        fs::write(importer.paths().files_dir().join("kept.txt"), b"kept").unwrap();

        let guard = importer.acquire(Operation::Import).unwrap();
        let upload = upload_from(&importer, b"never read");
        let lifecycle = &importer;
        // A long-running request keeps storage busy for the whole import
        let err = importer
            .with_storage(|_| {
                Ok(std::thread::scope(|s| {
                    s.spawn(move || import(lifecycle, guard, upload))
                        .join()
                        .unwrap()
                }))
            })
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::DrainTimeout { .. }), "{}", err);

        assert_eq!(importer.phase(), Phase::Running { generation: 1 });
        assert_eq!(stored(&importer, "blob").unwrap(), b"kept".to_vec());
        assert!(importer.paths().files_dir().join("kept.txt").exists());
        assert!(rollback_files(target.path()).is_empty());
        importer.acquire(Operation::Import).unwrap();
    }
}
