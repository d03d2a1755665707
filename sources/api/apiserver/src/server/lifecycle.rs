//! The lifecycle module owns the server's live storage and the transitions that tear it down and
//! bring it back.
//!
//! Storage moves through `Running -> Draining -> Reinitializing -> Running`, with the generation
//! counter bumped on every successful reopen.  If storage can't be reopened, or a restore fails
//! after removing the old state, the lifecycle moves to `Failed` and refuses every request that
//! needs storage until an operator intervenes.
//!
//! Export, import, and reconfiguration are serialized through an exclusive lock on a lock file in
//! the data directory.  Holding a [`LifecycleGuard`] is proof of that lock, and the transitions
//! that close or reopen storage require one.

use crate::server::config::{AuthConfig, AUTH_CONFIG};
use crate::server::error::{self, Result};
use datastore::snapshot::remove_tree;
use datastore::{ConfigStore, Database, StatePaths};
use fs2::FileExt;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use snafu::{OptionExt, ResultExt};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Operations that need exclusive control of the server's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Export,
    Import,
    Reconfigure,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Export => write!(f, "export"),
            Operation::Import => write!(f, "import"),
            Operation::Reconfigure => write!(f, "reconfiguration"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub(crate) enum Phase {
    Running { generation: u64 },
    Draining { generation: u64 },
    Reinitializing { generation: u64 },
    Failed { reason: String },
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Running { .. } => "running",
            Phase::Draining { .. } => "draining",
            Phase::Reinitializing { .. } => "reinitializing",
            Phase::Failed { .. } => "failed",
        }
    }
}

/// The live storage of a running server, and the configuration loaded along with it.
#[derive(Debug)]
pub(crate) struct ActiveState {
    pub(crate) database: Database,
    pub(crate) files_dir: PathBuf,
    pub(crate) auth: AuthConfig,
}

/// Exclusive hold on lifecycle-affecting operations.  The lock is released on drop.
#[derive(Debug)]
pub struct LifecycleGuard {
    lockfile: File,
    operation: Operation,
}

impl LifecycleGuard {
    pub fn operation(&self) -> Operation {
        self.operation
    }
}

impl Drop for LifecycleGuard {
    fn drop(&mut self) {
        // Closing the file releases the lock anyway; unlocking explicitly lets us log it.
        match self.lockfile.unlock() {
            Ok(()) => debug!("Released lifecycle lock held for {}", self.operation),
            Err(e) => warn!("Failed to release lifecycle lock for {}: {}", self.operation, e),
        }
    }
}

/// A request for the server loop to stop serving, reload storage and configuration, and serve
/// again.  The lock stays held until the request is dropped.
#[derive(Debug)]
pub struct RestartRequest {
    guard: LifecycleGuard,
}

impl RestartRequest {
    pub fn guard(&self) -> &LifecycleGuard {
        &self.guard
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    paths: StatePaths,
    drain_timeout: Duration,
    phase: RwLock<Phase>,
    active: RwLock<Option<ActiveState>>,
    restarts: mpsc::UnboundedSender<RestartRequest>,
}

impl Lifecycle {
    /// Opens storage under the data directory and returns the lifecycle along with the receiving
    /// end of its restart requests.  Scratch work left by an earlier process is removed first.
    pub fn open(
        paths: StatePaths,
        drain_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RestartRequest>)> {
        fs::create_dir_all(paths.root()).context(error::PrepareDirSnafu {
            path: paths.root(),
        })?;
        let scratch = paths.scratch_dir();
        remove_tree(&scratch).context(error::ClearScratchSnafu)?;
        fs::create_dir_all(&scratch).context(error::PrepareDirSnafu { path: &scratch })?;

        let state = open_state(&paths)?;
        info!(
            "Opened storage at {} with {} auth provider(s)",
            paths.root().display(),
            state.auth.providers.len()
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let lifecycle = Self {
            paths,
            drain_timeout,
            phase: RwLock::new(Phase::Running { generation: 1 }),
            active: RwLock::new(Some(state)),
            restarts: tx,
        };
        Ok((lifecycle, rx))
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase.read().clone()
    }

    /// Takes the lifecycle lock without waiting.  Fails if another export, import, or
    /// reconfiguration holds it.
    pub fn acquire(&self, operation: Operation) -> Result<LifecycleGuard> {
        let path = self.paths.lock_file();
        let lockfile = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .context(error::LockOpenSnafu { path: &path })?;
        lockfile
            .try_lock_exclusive()
            .context(error::LifecycleConflictSnafu { operation })?;
        debug!("Obtained lifecycle lock for {}", operation);
        Ok(LifecycleGuard {
            lockfile,
            operation,
        })
    }

    /// Runs `f` against live storage.  Fails without waiting if storage is closed for a
    /// transition, or failed.
    pub(crate) fn with_storage<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ActiveState) -> Result<T>,
    {
        self.check_running()?;
        let active = self.active.read();
        let state = active.as_ref().context(error::UnavailableSnafu {
            phase: self.phase.read().name(),
        })?;
        f(state)
    }

    /// Like [`Lifecycle::with_storage`], with exclusive access for writes.
    pub(crate) fn with_storage_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut ActiveState) -> Result<T>,
    {
        self.check_running()?;
        let mut active = self.active.write();
        let state = active.as_mut().context(error::UnavailableSnafu {
            phase: self.phase.read().name(),
        })?;
        f(state)
    }

    fn check_running(&self) -> Result<u64> {
        match &*self.phase.read() {
            Phase::Running { generation } => Ok(*generation),
            Phase::Failed { reason } => error::StorageFailedSnafu {
                reason: reason.as_str(),
            }
            .fail(),
            other => error::UnavailableSnafu {
                phase: other.name(),
            }
            .fail(),
        }
    }

    /// Stops new storage users and closes the database once current users finish.  If they don't
    /// finish within the drain timeout, storage stays open and the server keeps running.
    pub(crate) fn drain(&self, _guard: &LifecycleGuard) -> Result<()> {
        let generation = self.check_running()?;
        *self.phase.write() = Phase::Draining { generation };
        debug!("Draining storage, generation {}", generation);

        let mut active = match self.active.try_write_for(self.drain_timeout) {
            Some(active) => active,
            None => {
                *self.phase.write() = Phase::Running { generation };
                error!(
                    "Storage still in use after {}s, not closing it",
                    self.drain_timeout.as_secs()
                );
                return error::DrainTimeoutSnafu {
                    timeout: self.drain_timeout,
                }
                .fail();
            }
        };

        if let Some(state) = active.take() {
            // The connection is gone either way; SQLite recovers from its journal on reopen.
            if let Err(e) = state.database.close() {
                warn!("Error closing database during drain: {}", e);
            }
        }
        info!("Storage closed, generation {}", generation);
        Ok(())
    }

    /// Reopens storage and reloads configuration after a drain.  Failure leaves the lifecycle in
    /// the failed phase; the server must not keep running half up.
    pub(crate) fn reinitialize(&self, _guard: &LifecycleGuard) -> Result<()> {
        let generation = match &*self.phase.read() {
            Phase::Draining { generation } | Phase::Reinitializing { generation } => *generation,
            Phase::Running { .. } => {
                debug!("Storage already open, nothing to reinitialize");
                return Ok(());
            }
            Phase::Failed { reason } => {
                return error::StorageFailedSnafu {
                    reason: reason.as_str(),
                }
                .fail()
            }
        };
        *self.phase.write() = Phase::Reinitializing { generation };

        match open_state(&self.paths) {
            Ok(state) => {
                let providers = state.auth.providers.len();
                *self.active.write() = Some(state);
                *self.phase.write() = Phase::Running {
                    generation: generation + 1,
                };
                info!(
                    "Storage reopened, generation {} with {} auth provider(s)",
                    generation + 1,
                    providers
                );
                Ok(())
            }
            Err(e) => {
                self.mark_failed(format!("unable to reopen storage: {}", e));
                Err(e)
            }
        }
    }

    /// Drains and reopens storage so it picks up replaced files and new configuration.
    pub(crate) fn restart(&self, guard: &LifecycleGuard) -> Result<()> {
        self.drain(guard)?;
        self.reinitialize(guard)
    }

    /// Moves to the failed phase; storage-dependent requests are refused from now on.
    pub(crate) fn mark_failed<S: Into<String>>(&self, reason: S) {
        let reason = reason.into();
        error!("Server storage failed: {}", reason);
        *self.phase.write() = Phase::Failed { reason };
    }

    /// Hands the guard to the server loop, which restarts the server and releases the lock once
    /// it's serving again.
    pub(crate) fn restart_server(&self, guard: LifecycleGuard) -> Result<()> {
        info!("Requesting server restart after {}", guard.operation());
        self.restarts
            .send(RestartRequest { guard })
            .ok()
            .context(error::RestartUnavailableSnafu)
    }
}

/// Opens the database and files directory and loads the configuration stored with them.
fn open_state(paths: &StatePaths) -> Result<ActiveState> {
    let files_dir = paths.files_dir();
    fs::create_dir_all(&files_dir).context(error::PrepareDirSnafu { path: &files_dir })?;
    let database = Database::open(paths.database()).context(error::OpenStorageSnafu)?;
    let stored = database
        .get_config(AUTH_CONFIG)
        .context(error::DataStoreSnafu { op: "load auth config" })?;
    let auth = AuthConfig::from_payload(stored.as_ref().map(|r| r.payload.as_slice()))?;
    Ok(ActiveState {
        database,
        files_dir,
        auth,
    })
}

#[cfg(test)]
mod test {
    use super::{Lifecycle, Operation, Phase};
    use crate::server::error::Error;
    use datastore::{ConfigRecord, ConfigStore, StatePaths};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn lifecycle(dir: &TempDir) -> Lifecycle {
        let (lifecycle, _rx) =
            Lifecycle::open(StatePaths::new(dir.path()), Duration::from_millis(200)).unwrap();
        lifecycle
    }

    #[test]
    fn open_clears_scratch() {
        let dir = TempDir::new().unwrap();
        let debris = dir.path().join("tmp/extract-old/workspace.db");
        fs::create_dir_all(debris.parent().unwrap()).unwrap();
        fs::write(&debris, b"old").unwrap();

        let lifecycle = lifecycle(&dir);
        assert!(!debris.exists());
        assert!(lifecycle.paths().scratch_dir().is_dir());
        assert!(lifecycle.paths().files_dir().is_dir());
        assert_eq!(lifecycle.phase(), Phase::Running { generation: 1 });
    }

    #[test]
    fn second_acquire_conflicts() {
        let dir = TempDir::new().unwrap();
        let lifecycle = lifecycle(&dir);

        let guard = lifecycle.acquire(Operation::Export).unwrap();
        let err = lifecycle.acquire(Operation::Import).unwrap_err();
        assert!(matches!(err, Error::LifecycleConflict { .. }), "{}", err);

        drop(guard);
        lifecycle.acquire(Operation::Import).unwrap();
    }

    #[test]
    fn unavailable_while_drained() {
        let dir = TempDir::new().unwrap();
        let lifecycle = lifecycle(&dir);
        let guard = lifecycle.acquire(Operation::Reconfigure).unwrap();

        lifecycle.drain(&guard).unwrap();
        assert_eq!(lifecycle.phase(), Phase::Draining { generation: 1 });
        let err = lifecycle.with_storage(|_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::Unavailable { .. }), "{}", err);

        lifecycle.reinitialize(&guard).unwrap();
        assert_eq!(lifecycle.phase(), Phase::Running { generation: 2 });
        lifecycle.with_storage(|_| Ok(())).unwrap();
    }

    #[test]
    fn restart_reloads_config() {
        let dir = TempDir::new().unwrap();
        let lifecycle = lifecycle(&dir);
        lifecycle
            .with_storage(|state| {
                assert!(state.auth.providers.is_empty());
                Ok(())
            })
            .unwrap();

        lifecycle
            .with_storage_mut(|state| {
                state
                    .database
                    .upsert_config(&ConfigRecord::new(
                        "auth_config",
                        r#"{"providers":[{"id":"github"}]}"#,
                    ))
                    .unwrap();
                Ok(())
            })
            .unwrap();

        let guard = lifecycle.acquire(Operation::Reconfigure).unwrap();
        lifecycle.restart(&guard).unwrap();
        let ids = lifecycle
            .with_storage(|state| Ok(state.auth.provider_ids()))
            .unwrap();
        assert_eq!(ids, vec!["github"]);
    }

    #[test]
    fn drain_timeout_keeps_running() {
        let dir = TempDir::new().unwrap();
        let lifecycle = lifecycle(&dir);
        let guard = lifecycle.acquire(Operation::Import).unwrap();

        // Hold storage the way a slow request would
        let held = lifecycle.active.read();
        let err = lifecycle.drain(&guard).unwrap_err();
        drop(held);

        assert!(matches!(err, Error::DrainTimeout { .. }), "{}", err);
        assert_eq!(lifecycle.phase(), Phase::Running { generation: 1 });
        lifecycle.with_storage(|_| Ok(())).unwrap();
    }

    #[test]
    fn reopen_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let lifecycle = lifecycle(&dir);
        let guard = lifecycle.acquire(Operation::Import).unwrap();
        lifecycle.drain(&guard).unwrap();

        // A directory where the database file should be can't be opened
        let db = lifecycle.paths().database();
        fs::remove_file(&db).unwrap();
        fs::create_dir_all(&db).unwrap();

        assert!(lifecycle.reinitialize(&guard).is_err());
        assert!(matches!(lifecycle.phase(), Phase::Failed { .. }));
        let err = lifecycle.with_storage(|_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::StorageFailed { .. }), "{}", err);
    }

    #[test]
    fn restart_request_holds_lock() {
        let dir = TempDir::new().unwrap();
        let (lifecycle, mut rx) =
            Lifecycle::open(StatePaths::new(dir.path()), Duration::from_secs(1)).unwrap();

        let guard = lifecycle.acquire(Operation::Reconfigure).unwrap();
        lifecycle.restart_server(guard).unwrap();
        assert!(lifecycle.acquire(Operation::Export).is_err());

        let request = rx.try_recv().unwrap();
        assert_eq!(request.guard().operation(), Operation::Reconfigure);
        drop(request);
        lifecycle.acquire(Operation::Export).unwrap();
    }
}
