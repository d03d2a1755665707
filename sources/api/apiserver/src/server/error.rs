use snafu::Snafu;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::server::lifecycle::Operation;

// We want server (router/handler), lifecycle, and controller errors together so it's easy to
// define response error codes for all the high-level types of errors that could happen during a
// request.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    // Server errors
    #[snafu(display("Unable to serialize response: {}", source))]
    ResponseSerialization { source: serde_json::Error },

    #[snafu(display("Unable to bind to {}: {}", addr, source))]
    BindSocket { addr: String, source: io::Error },

    #[snafu(display("Unable to start server: {}", source))]
    ServerStart { source: io::Error },

    #[snafu(display("Server task failed: {}", source))]
    ServerTask { source: actix_rt::task::JoinError },

    #[snafu(display("Blocking thread pool is gone"))]
    Blocking,

    #[snafu(display("Upload must contain a file part"))]
    MissingUpload,

    #[snafu(display("Upload must contain exactly one file part"))]
    ExtraUpload,

    #[snafu(display("Upload part is missing a filename"))]
    UploadFilename,

    #[snafu(display("Unable to read upload: {}", reason))]
    UploadRead { reason: String },

    #[snafu(display("Unable to store upload in '{}': {}", path.display(), source))]
    UploadWrite { path: PathBuf, source: io::Error },

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    // Lifecycle errors
    #[snafu(display("Unable to open lock file '{}': {}", path.display(), source))]
    LockOpen { path: PathBuf, source: io::Error },

    #[snafu(display(
        "Unable to start {}: another backup, restore, or reconfiguration is in progress",
        operation
    ))]
    LifecycleConflict {
        operation: Operation,
        source: io::Error,
    },

    #[snafu(display("Storage is unavailable while the server is {}", phase))]
    Unavailable { phase: &'static str },

    #[snafu(display("Server storage failed and requires manual recovery: {}", reason))]
    StorageFailed { reason: String },

    #[snafu(display(
        "Storage still in use after {}s; refusing to close it",
        timeout.as_secs()
    ))]
    DrainTimeout { timeout: Duration },

    #[snafu(display("Unable to open storage: {}", source))]
    OpenStorage {
        #[snafu(source(from(datastore::Error, Box::new)))]
        source: Box<datastore::Error>,
    },

    #[snafu(display("Unable to prepare '{}': {}", path.display(), source))]
    PrepareDir { path: PathBuf, source: io::Error },

    #[snafu(display("Unable to clear scratch directory: {}", source))]
    ClearScratch {
        #[snafu(source(from(datastore::Error, Box::new)))]
        source: Box<datastore::Error>,
    },

    #[snafu(display("Stored auth config is not valid JSON: {}", source))]
    AuthConfigParse { source: serde_json::Error },

    #[snafu(display("Server loop is not accepting restart requests"))]
    RestartUnavailable,

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    // Backup and restore errors
    #[snafu(display("Unable to snapshot database: {}", source))]
    Snapshot {
        #[snafu(source(from(datastore::Error, Box::new)))]
        source: Box<datastore::Error>,
    },

    #[snafu(display("Unable to copy attached files: {}", source))]
    FilesSnapshot {
        #[snafu(source(from(datastore::Error, Box::new)))]
        source: Box<datastore::Error>,
    },

    #[snafu(display("Unable to create export directory under '{}': {}", path.display(), source))]
    ExportScratch { path: PathBuf, source: io::Error },

    #[snafu(display("Unable to build backup archive: {}", source))]
    ArchiveWrite { source: archive::Error },

    #[snafu(display("Unable to read backup archive: {}", source))]
    ArchiveRead { source: archive::Error },

    #[snafu(display("Unable to open built archive '{}': {}", path.display(), source))]
    ArchiveOpen { path: PathBuf, source: io::Error },

    #[snafu(display("Unable to remove current state: {}", source))]
    DeleteState {
        #[snafu(source(from(datastore::Error, Box::new)))]
        source: Box<datastore::Error>,
    },

    #[snafu(display(
        "Unable to move '{}' to '{}': {}",
        from.display(),
        to.display(),
        source
    ))]
    MoveState {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    #[snafu(display(
        "Restore failed after current state was removed; recover manually from '{}': {}",
        rollback.display(),
        source
    ))]
    StateReplace {
        rollback: PathBuf,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    // Controller errors
    #[snafu(display("Unknown config name '{}'", name))]
    ConfigName { name: String },

    #[snafu(display("Config '{}' not found", name))]
    ConfigNotFound { name: String },

    #[snafu(display("Invalid {}: {}", name, reason))]
    ConfigValidation { name: String, reason: String },

    #[snafu(display("Unable to serialize config '{}': {}", name, source))]
    ConfigSerialize {
        name: String,
        source: serde_json::Error,
    },

    #[snafu(display("Data store error during {}: {}", op, source))]
    DataStore {
        op: String,
        #[snafu(source(from(datastore::Error, Box::new)))]
        source: Box<datastore::Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
