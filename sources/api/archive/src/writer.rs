use super::error::{self, Result};
use super::{SnapshotMetadata, DATABASE_ENTRY, FILES_DIR_ENTRY, METADATA_ENTRY};
use log::{debug, trace};
use snafu::{OptionExt, ResultExt};
use std::fs::File;
use std::io::{self, Seek, Write};
use std::path::Path;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Writes a backup archive to `archive_path` containing the metadata, the database snapshot at
/// `database`, and every file and directory under `files_dir`.
pub fn write<P1, P2, P3>(
    metadata: &SnapshotMetadata,
    database: P1,
    files_dir: P2,
    archive_path: P3,
) -> Result<()>
where
    P1: AsRef<Path>,
    P2: AsRef<Path>,
    P3: AsRef<Path>,
{
    let archive_path = archive_path.as_ref();
    let file = File::create(archive_path).context(error::CreateArchiveSnafu {
        path: archive_path,
    })?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file(METADATA_ENTRY, options)
        .context(error::StartEntrySnafu {
            name: METADATA_ENTRY,
        })?;
    serde_json::to_writer(&mut zip, metadata).context(error::SerializeMetadataSnafu)?;

    add_file(&mut zip, options, database.as_ref(), DATABASE_ENTRY)?;
    add_tree(&mut zip, options, files_dir.as_ref())?;

    zip.finish().context(error::FinishArchiveSnafu {
        path: archive_path,
    })?;
    debug!("Wrote archive {}", archive_path.display());
    Ok(())
}

fn add_file<W>(zip: &mut ZipWriter<W>, options: FileOptions, src: &Path, name: &str) -> Result<()>
where
    W: Write + Seek,
{
    let mut source = File::open(src).context(error::ReadSourceSnafu { path: src })?;
    zip.start_file(name, options)
        .context(error::StartEntrySnafu { name })?;
    io::copy(&mut source, zip).context(error::WriteEntrySnafu { name })?;
    trace!("Archived {} as {}", src.display(), name);
    Ok(())
}

/// Adds the tree under `files_dir` below the files entry, preserving relative paths.  The files
/// entry itself is always written, so an empty tree survives the round trip.
fn add_tree<W>(zip: &mut ZipWriter<W>, options: FileOptions, files_dir: &Path) -> Result<()>
where
    W: Write + Seek,
{
    let root = format!("{}/", FILES_DIR_ENTRY);
    zip.add_directory(root.as_str(), options)
        .context(error::StartEntrySnafu { name: &root })?;

    for entry in WalkDir::new(files_dir).follow_links(false).min_depth(1) {
        let entry = entry.context(error::WalkFilesSnafu { path: files_dir })?;
        let relative = entry
            .path()
            .strip_prefix(files_dir)
            .context(error::EntryNameSnafu)?;
        let name = entry_name(relative)?;

        if entry.file_type().is_dir() {
            let name = format!("{}{}/", root, name);
            zip.add_directory(name.as_str(), options)
                .context(error::StartEntrySnafu { name: &name })?;
        } else if entry.file_type().is_file() {
            add_file(zip, options, entry.path(), &format!("{}{}", root, name))?;
        }
    }
    Ok(())
}

/// Zip entry names always use '/' regardless of platform.
fn entry_name(relative: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        let part = component
            .as_os_str()
            .to_str()
            .context(error::NonUnicodePathSnafu { path: relative })?;
        parts.push(part);
    }
    Ok(parts.join("/"))
}
