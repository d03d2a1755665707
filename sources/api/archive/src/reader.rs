use super::error::{self, Result};
use super::{SnapshotMetadata, DATABASE_ENTRY, FILES_DIR_ENTRY, METADATA_ENTRY};
use log::{debug, trace};
use snafu::{ensure, OptionExt, ResultExt};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use zip::ZipArchive;

/// The two shapes a readable archive can take.  Paths point into the scratch directory owned by
/// the surrounding [`Extracted`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedArchive {
    Versioned {
        metadata: SnapshotMetadata,
        database: PathBuf,
        files: PathBuf,
    },
    /// Made before attached files existed; holds only a database snapshot.
    Legacy { database: PathBuf },
}

/// An archive extracted into its own scratch directory.  The directory is removed by
/// [`Extracted::close`], or on drop.
#[derive(Debug)]
pub struct Extracted {
    parsed: ParsedArchive,
    scratch: TempDir,
}

impl Extracted {
    pub fn parsed(&self) -> &ParsedArchive {
        &self.parsed
    }

    pub fn scratch_path(&self) -> &Path {
        self.scratch.path()
    }

    /// Removes the scratch directory, reporting any failure to do so.
    pub fn close(self) -> Result<()> {
        let path = self.scratch.path().to_path_buf();
        self.scratch
            .close()
            .context(error::CleanupSnafu { path: &path })?;
        trace!("Removed scratch directory {}", path.display());
        Ok(())
    }
}

/// Extracts `archive_path` into a new, uniquely named directory under `scratch_root` and
/// determines whether it's a versioned or legacy archive.
///
/// Input that isn't a readable zip, or that lacks a database snapshot, is reported as an error;
/// a missing metadata entry alone is not.
pub fn read<P1, P2>(archive_path: P1, scratch_root: P2) -> Result<Extracted>
where
    P1: AsRef<Path>,
    P2: AsRef<Path>,
{
    let archive_path = archive_path.as_ref();
    let scratch_root = scratch_root.as_ref();

    let file = File::open(archive_path).context(error::OpenArchiveSnafu {
        path: archive_path,
    })?;
    let mut zip = ZipArchive::new(file).context(error::CorruptSnafu {
        path: archive_path,
    })?;

    fs::create_dir_all(scratch_root).context(error::ScratchDirSnafu { path: scratch_root })?;
    let scratch = tempfile::Builder::new()
        .prefix("extract-")
        .tempdir_in(scratch_root)
        .context(error::ScratchDirSnafu { path: scratch_root })?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).context(error::CorruptSnafu {
            path: archive_path,
        })?;
        let relative = entry
            .enclosed_name()
            .map(Path::to_path_buf)
            .context(error::UnsafeEntrySnafu { name: entry.name() })?;
        let target = scratch.path().join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).context(error::ExtractEntrySnafu { path: &target })?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).context(error::ExtractEntrySnafu { path: parent })?;
        }
        let mut out = File::create(&target).context(error::ExtractEntrySnafu { path: &target })?;
        // Truncated or mismatched data surfaces here as a checksum or read error.
        io::copy(&mut entry, &mut out).context(error::ExtractEntrySnafu { path: &target })?;
        trace!("Extracted {}", relative.display());
    }

    let database = scratch.path().join(DATABASE_ENTRY);
    ensure!(
        database.is_file(),
        error::MissingDatabaseSnafu {
            entry: DATABASE_ENTRY
        }
    );

    let metadata_path = scratch.path().join(METADATA_ENTRY);
    let parsed = if metadata_path.is_file() {
        let raw = fs::read(&metadata_path).context(error::ExtractEntrySnafu {
            path: &metadata_path,
        })?;
        // Only the entry's presence is required; its contents are informational.
        let metadata = SnapshotMetadata::from_slice(&raw);
        let files = scratch.path().join(FILES_DIR_ENTRY);
        fs::create_dir_all(&files).context(error::ExtractEntrySnafu { path: &files })?;
        debug!("Read {} archive", metadata);
        ParsedArchive::Versioned {
            metadata,
            database,
            files,
        }
    } else {
        debug!("Read legacy archive with no {}", METADATA_ENTRY);
        ParsedArchive::Legacy { database }
    };

    Ok(Extracted { parsed, scratch })
}

#[cfg(test)]
mod test {
    use super::{read, ParsedArchive};
    use crate::{write, Error, SnapshotMetadata};
    use maplit::btreemap;
    use std::collections::BTreeMap;
    use std::fs::{self, File};
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;
    use walkdir::WalkDir;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn tree_contents(root: &Path) -> BTreeMap<String, Vec<u8>> {
        WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap();
                (
                    rel.to_string_lossy().replace('\\', "/"),
                    fs::read(e.path()).unwrap(),
                )
            })
            .collect()
    }

    fn zip_with(path: &Path, entries: &[(&str, &[u8])]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        for (name, data) in entries {
            zip.start_file(*name, FileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn versioned_round_trip() {
        let work = TempDir::new().unwrap();
        let db = work.path().join("snapshot.db");
        fs::write(&db, b"database bytes").unwrap();
        let files = work.path().join("files");
        fs::create_dir_all(files.join("req/42")).unwrap();
        fs::create_dir_all(files.join("empty")).unwrap();
        fs::write(files.join("req/42/body.json"), b"{\"a\":1}").unwrap();
        fs::write(files.join("logo.png"), [0x89u8, b'P', b'N', b'G']).unwrap();

        let metadata = SnapshotMetadata::now();
        let archive = work.path().join("backup.zip");
        write(&metadata, &db, &files, &archive).unwrap();

        let scratch = work.path().join("tmp");
        let extracted = read(&archive, &scratch).unwrap();
        match extracted.parsed() {
            ParsedArchive::Versioned {
                metadata: read_metadata,
                database,
                files: read_files,
            } => {
                assert_eq!(read_metadata.version.as_deref(), Some("1.0"));
                assert_eq!(
                    read_metadata.created_at.map(|t| t.timestamp_millis()),
                    metadata.created_at.map(|t| t.timestamp_millis())
                );
                assert_eq!(fs::read(database).unwrap(), b"database bytes");
                assert_eq!(
                    tree_contents(read_files),
                    btreemap! {
                        "logo.png".to_string() => vec![0x89u8, b'P', b'N', b'G'],
                        "req/42/body.json".to_string() => b"{\"a\":1}".to_vec(),
                    }
                );
                assert!(read_files.join("empty").is_dir());
            }
            other => panic!("expected versioned archive, got {:?}", other),
        }

        let scratch_dir = extracted.scratch_path().to_path_buf();
        assert!(scratch_dir.starts_with(&scratch));
        extracted.close().unwrap();
        assert!(!scratch_dir.exists());
    }

    #[test]
    fn empty_files_dir_is_versioned() {
        let work = TempDir::new().unwrap();
        let db = work.path().join("snapshot.db");
        fs::write(&db, b"db").unwrap();
        let files = work.path().join("files");
        fs::create_dir_all(&files).unwrap();
        let archive = work.path().join("backup.zip");
        write(&SnapshotMetadata::now(), &db, &files, &archive).unwrap();

        let extracted = read(&archive, work.path().join("tmp")).unwrap();
        match extracted.parsed() {
            ParsedArchive::Versioned { files, .. } => {
                assert!(files.is_dir());
                assert!(tree_contents(files).is_empty());
            }
            other => panic!("expected versioned archive, got {:?}", other),
        }
    }

    #[test]
    fn legacy_archive() {
        let work = TempDir::new().unwrap();
        let archive = work.path().join("legacy.zip");
        zip_with(&archive, &[("workspace.db", b"old database")]);

        let extracted = read(&archive, work.path().join("tmp")).unwrap();
        match extracted.parsed() {
            ParsedArchive::Legacy { database } => {
                assert_eq!(fs::read(database).unwrap(), b"old database")
            }
            other => panic!("expected legacy archive, got {:?}", other),
        }
    }

    #[test]
    fn distinct_scratch_dirs() {
        let work = TempDir::new().unwrap();
        let archive = work.path().join("legacy.zip");
        zip_with(&archive, &[("workspace.db", b"db")]);

        let first = read(&archive, work.path().join("tmp")).unwrap();
        let second = read(&archive, work.path().join("tmp")).unwrap();
        assert_ne!(first.scratch_path(), second.scratch_path());
    }

    #[test]
    fn corrupt_is_not_legacy() {
        let work = TempDir::new().unwrap();
        let archive = work.path().join("garbage.zip");
        fs::write(&archive, b"this is not a zip archive at all").unwrap();

        let err = read(&archive, work.path().join("tmp")).unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }), "{}", err);
    }

    #[test]
    fn truncated_archive() {
        let work = TempDir::new().unwrap();
        let db = work.path().join("snapshot.db");
        fs::write(&db, vec![7u8; 64 * 1024]).unwrap();
        let files = work.path().join("files");
        fs::create_dir_all(&files).unwrap();
        let archive = work.path().join("backup.zip");
        write(&SnapshotMetadata::now(), &db, &files, &archive).unwrap();

        let bytes = fs::read(&archive).unwrap();
        fs::write(&archive, &bytes[..bytes.len() / 2]).unwrap();

        assert!(read(&archive, work.path().join("tmp")).is_err());
    }

    #[test]
    fn missing_database_is_corrupt() {
        let work = TempDir::new().unwrap();
        let archive = work.path().join("nodb.zip");
        zip_with(
            &archive,
            &[("metadata.json", br#"{"version":"1.0","createdAt":1}"#)],
        );

        let err = read(&archive, work.path().join("tmp")).unwrap_err();
        assert!(matches!(err, Error::MissingDatabase { .. }), "{}", err);
    }

    #[test]
    fn unexpected_metadata_is_still_versioned() {
        let work = TempDir::new().unwrap();
        for raw in [
            &br#"{"version":"1.1","createdAt":"2024-01-01T00:00:00Z"}"#[..],
            &br#"{"version":"1.0"}"#[..],
            &b"not json"[..],
        ] {
            let archive = work.path().join("other-writer.zip");
            zip_with(
                &archive,
                &[
                    ("metadata.json", raw),
                    ("workspace.db", &b"db"[..]),
                    ("files/note.txt", &b"note"[..]),
                ],
            );

            let extracted = read(&archive, work.path().join("tmp")).unwrap();
            match extracted.parsed() {
                ParsedArchive::Versioned { database, files, .. } => {
                    assert_eq!(fs::read(database).unwrap(), b"db");
                    assert_eq!(fs::read(files.join("note.txt")).unwrap(), b"note");
                }
                other => panic!("expected versioned archive, got {:?}", other),
            }
            extracted.close().unwrap();
        }
    }
}
