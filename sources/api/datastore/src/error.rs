use snafu::Snafu;
use std::io;
use std::path::PathBuf;

/// Possible errors from datastore operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to open database at '{}': {}", path.display(), source))]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[snafu(display("Unable to create schema in '{}': {}", path.display(), source))]
    Schema {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[snafu(display("Unable to close database at '{}': {}", path.display(), source))]
    Close {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[snafu(display("Query for config '{}' failed: {}", name, source))]
    Query {
        name: String,
        source: rusqlite::Error,
    },

    #[snafu(display("Writing config '{}' failed: {}", name, source))]
    Write {
        name: String,
        source: rusqlite::Error,
    },

    #[snafu(display("Listing config names failed: {}", source))]
    List { source: rusqlite::Error },

    #[snafu(display("Unable to snapshot database to '{}': {}", path.display(), source))]
    Snapshot {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[snafu(display("Unable to remove database file '{}': {}", path.display(), source))]
    DeleteDatabase { path: PathBuf, source: io::Error },

    #[snafu(display("IO error on '{}': {}", path.display(), source))]
    Io { path: PathBuf, source: io::Error },

    #[snafu(display("Error walking '{}': {}", path.display(), source))]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },

    #[snafu(display("Error building data store path: {}", source))]
    Path { source: std::path::StripPrefixError },
}

pub type Result<T> = std::result::Result<T, Error>;
