/*!
# Background

The workspace server keeps its durable state in one data directory: a SQLite database and a
directory of attached files.
This library owns that state at rest.

# Library

[`ConfigStore`] defines the persistence requirements for named configuration records, with a
SQLite implementation in [`Database`] and an in-memory implementation in [`memory`] for tests.

[`Database`] also provides the hot snapshot used by backups and rollback snapshots: SQLite's
online backup API copies a consistent image of the database without stopping writers.
[`snapshot::copy_tree`] copies the attached-files directory.

[`StatePaths`] names every file and directory the server keeps under its data directory.

# Current limitations

* The user (e.g. apiserver) needs to handle locking between lifecycle operations.
* The database snapshot and the files copy are not taken atomically with each other.
*/

pub mod database;
pub mod error;
pub mod memory;
pub mod paths;
pub mod snapshot;

pub use database::Database;
pub use error::{Error, Result};
pub use memory::MemoryConfigStore;
pub use paths::StatePaths;

use serde::{Deserialize, Serialize};

/// A named configuration record.  The payload is opaque to the store; consumers decide how to
/// interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub name: String,
    pub payload: Vec<u8>,
}

impl ConfigRecord {
    pub fn new<S, B>(name: S, payload: B) -> Self
    where
        S: Into<String>,
        B: Into<Vec<u8>>,
    {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }
}

pub trait ConfigStore {
    /// Retrieve the record stored under the given name, if any.
    fn get_config(&self, name: &str) -> Result<Option<ConfigRecord>>;
    /// Store the record, fully replacing any existing payload under the same name.
    fn upsert_config(&mut self, record: &ConfigRecord) -> Result<()>;
    /// Returns the names of all stored records, sorted.
    fn list_config_names(&self) -> Result<Vec<String>>;
}
