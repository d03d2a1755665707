use snafu::Snafu;
use std::io;
use std::path::PathBuf;
use zip::result::ZipError;

/// Possible errors from building or reading a backup archive.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    // Write errors
    #[snafu(display("Unable to create archive '{}': {}", path.display(), source))]
    CreateArchive { path: PathBuf, source: io::Error },

    #[snafu(display("Unable to read '{}' for archiving: {}", path.display(), source))]
    ReadSource { path: PathBuf, source: io::Error },

    #[snafu(display("Unable to list files under '{}': {}", path.display(), source))]
    WalkFiles {
        path: PathBuf,
        source: walkdir::Error,
    },

    #[snafu(display("Error building archive entry name: {}", source))]
    EntryName { source: std::path::StripPrefixError },

    #[snafu(display("Can't archive non-Unicode path '{}'", path.display()))]
    NonUnicodePath { path: PathBuf },

    #[snafu(display("Unable to add entry '{}' to archive: {}", name, source))]
    StartEntry { name: String, source: ZipError },

    #[snafu(display("Unable to write entry '{}' to archive: {}", name, source))]
    WriteEntry { name: String, source: io::Error },

    #[snafu(display("Unable to serialize snapshot metadata: {}", source))]
    SerializeMetadata { source: serde_json::Error },

    #[snafu(display("Unable to finish archive '{}': {}", path.display(), source))]
    FinishArchive { path: PathBuf, source: ZipError },

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    // Read errors
    #[snafu(display("Unable to open archive '{}': {}", path.display(), source))]
    OpenArchive { path: PathBuf, source: io::Error },

    #[snafu(display("Archive '{}' is corrupt: {}", path.display(), source))]
    Corrupt { path: PathBuf, source: ZipError },

    #[snafu(display("Archive entry '{}' would extract outside the scratch area", name))]
    UnsafeEntry { name: String },

    #[snafu(display("Unable to extract '{}': {}", path.display(), source))]
    ExtractEntry { path: PathBuf, source: io::Error },

    #[snafu(display("Archive has no database snapshot entry '{}'", entry))]
    MissingDatabase { entry: &'static str },

    #[snafu(display("Unable to create scratch directory under '{}': {}", path.display(), source))]
    ScratchDir { path: PathBuf, source: io::Error },

    #[snafu(display("Unable to remove scratch directory '{}': {}", path.display(), source))]
    Cleanup { path: PathBuf, source: io::Error },
}

pub type Result<T> = std::result::Result<T, Error>;
