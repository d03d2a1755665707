//! The SQLite-backed store for live server state.
//!
//! A single connection is kept behind a mutex; SQLite serializes writers anyway, and holding one
//! connection makes closing the database before its files are replaced straightforward.

use super::error::{self, Result};
use super::{ConfigRecord, ConfigStore};
use log::{debug, trace};
use parking_lot::Mutex;
use rusqlite::backup::Backup;
use rusqlite::{params, Connection, OptionalExtension};
use snafu::ResultExt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

// Pages copied per backup step, and the pause between steps.
const BACKUP_PAGES_PER_STEP: std::os::raw::c_int = 256;
const BACKUP_STEP_PAUSE: Duration = Duration::from_millis(5);

// Files SQLite may keep next to the main database file.
const SIDECAR_SUFFIXES: &[&str] = &["-journal", "-wal", "-shm"];

#[derive(Debug)]
pub struct Database {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl Database {
    /// Opens the database at the given path, creating it and its schema if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).context(error::OpenSnafu { path: &path })?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS config (
                name TEXT PRIMARY KEY NOT NULL,
                payload BLOB NOT NULL
            );",
        )
        .context(error::SchemaSnafu { path: &path })?;
        debug!("Opened database at {}", path.display());
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the connection, flushing anything SQLite still holds.
    pub fn close(self) -> Result<()> {
        let path = self.path;
        self.conn
            .into_inner()
            .close()
            .map_err(|(_conn, e)| e)
            .context(error::CloseSnafu { path: &path })?;
        debug!("Closed database at {}", path.display());
        Ok(())
    }

    /// Writes a consistent copy of the live database to `dest` using SQLite's online backup API.
    /// The connection is held for the whole backup, so other config reads and writes through this
    /// handle wait until it finishes.
    pub fn snapshot_to<P: AsRef<Path>>(&self, dest: P) -> Result<()> {
        let dest = dest.as_ref();
        let mut dest_conn = Connection::open(dest).context(error::SnapshotSnafu { path: dest })?;
        let src = self.conn.lock();
        let backup =
            Backup::new(&*src, &mut dest_conn).context(error::SnapshotSnafu { path: dest })?;
        backup
            .run_to_completion(BACKUP_PAGES_PER_STEP, BACKUP_STEP_PAUSE, None)
            .context(error::SnapshotSnafu { path: dest })?;
        debug!(
            "Snapshot of {} written to {}",
            self.path.display(),
            dest.display()
        );
        Ok(())
    }

    /// Removes the database file at `path` and any journal files next to it.  Missing files are
    /// not an error.
    pub fn delete_files<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        let mut targets = vec![path.to_path_buf()];
        for suffix in SIDECAR_SUFFIXES {
            let mut name = path.as_os_str().to_os_string();
            name.push(suffix);
            targets.push(PathBuf::from(name));
        }

        for target in targets {
            match fs::remove_file(&target) {
                Ok(()) => trace!("Removed {}", target.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).context(error::DeleteDatabaseSnafu { path: target }),
            }
        }
        Ok(())
    }
}

impl ConfigStore for Database {
    fn get_config(&self, name: &str) -> Result<Option<ConfigRecord>> {
        let conn = self.conn.lock();
        let payload: Option<Vec<u8>> = conn
            .query_row(
                "SELECT payload FROM config WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .context(error::QuerySnafu { name })?;
        Ok(payload.map(|payload| ConfigRecord::new(name, payload)))
    }

    fn upsert_config(&mut self, record: &ConfigRecord) -> Result<()> {
        let conn = self.conn.get_mut();
        conn.execute(
            "INSERT INTO config (name, payload) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET payload = excluded.payload",
            params![record.name, record.payload],
        )
        .context(error::WriteSnafu {
            name: &record.name,
        })?;
        trace!("Stored config '{}'", record.name);
        Ok(())
    }

    fn list_config_names(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT name FROM config ORDER BY name")
            .context(error::ListSnafu)?;
        let names = stmt
            .query_map([], |row| row.get(0))
            .context(error::ListSnafu)?
            .collect::<std::result::Result<Vec<String>, _>>()
            .context(error::ListSnafu)?;
        Ok(names)
    }
}
