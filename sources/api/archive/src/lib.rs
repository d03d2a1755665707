/*!
# Background

A backup of the workspace server is a single zip archive holding everything needed to rebuild the
server's persistent state:

* `metadata.json` - the format version and creation time of the snapshot
* `workspace.db` - a SQLite snapshot of the database
* `files/` - the attached-files tree, with relative paths preserved

Archives made before attached files existed hold only `workspace.db`.
These "legacy" archives are still valid input; they are not the same as a corrupt archive.

# Library

[`write`] builds an archive from a database snapshot and a files directory.
[`read`] extracts an archive into a fresh scratch directory and reports which shape it had.
*/

pub mod error;
mod reader;
mod writer;

pub use error::{Error, Result};
pub use reader::{read, Extracted, ParsedArchive};
pub use writer::write;

use chrono::{DateTime, TimeZone, Utc};
use log::warn;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Name of the metadata entry; its absence marks a legacy archive.
pub const METADATA_ENTRY: &str = "metadata.json";
/// Name of the database snapshot entry.
pub const DATABASE_ENTRY: &str = "workspace.db";
/// Directory entry that holds the attached-files tree.
pub const FILES_DIR_ENTRY: &str = "files";
/// Version written into new archives.
pub const FORMAT_VERSION: &str = "1.0";

/// Describes when and in what format an archive was written.
///
/// Reading is best-effort: archives from other writers may omit fields or format them
/// differently, and that must not make an otherwise complete archive unusable.  Fields that can't
/// be understood are left empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

impl SnapshotMetadata {
    /// Metadata for an archive written now in the current format.
    pub fn now() -> Self {
        Self {
            version: Some(FORMAT_VERSION.to_string()),
            created_at: Some(Utc::now()),
        }
    }

    /// Reads whatever can be understood from a `metadata.json` entry.  Never fails.
    pub fn from_slice(raw: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(raw) {
            Ok(value) => Self::from_value(&value),
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", METADATA_ENTRY, e);
                Self {
                    version: None,
                    created_at: None,
                }
            }
        }
    }

    fn from_value(value: &Value) -> Self {
        let version = match value.get("version") {
            Some(Value::String(version)) => Some(version.clone()),
            Some(Value::Number(version)) => Some(version.to_string()),
            None | Some(Value::Null) => None,
            Some(other) => {
                warn!("Ignoring archive version of unexpected type: {}", other);
                None
            }
        };

        let created_at = match value.get("createdAt") {
            None | Some(Value::Null) => None,
            Some(raw) => {
                let parsed = parse_timestamp(raw);
                if parsed.is_none() {
                    warn!("Ignoring archive creation time '{}'", raw);
                }
                parsed
            }
        };

        Self {
            version,
            created_at,
        }
    }
}

/// Accepts epoch milliseconds, which we write, and RFC 3339 strings.
fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::Number(millis) => millis
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    }
}

impl fmt::Display for SnapshotMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "version {}", version)?,
            None => write!(f, "unknown version")?,
        }
        match &self.created_at {
            Some(created_at) => write!(f, " created at {}", created_at),
            None => write!(f, " of unknown age"),
        }
    }
}
