use std::env;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use chrono::{DateTime, Duration, Utc};
use keystage_domain::{EXECUTION_RECORD_VERSION, ExecutionRecord, LockInfo};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StateError;

/// Persistence for the execution record and its advisory lock.
pub trait StateStore {
    /// Load the record. A store that has never been written yields an empty
    /// record.
    ///
    /// # Errors
    ///
    /// Returns an error when the record cannot be read or decoded, or has an
    /// unsupported format version.
    fn load(&self) -> Result<ExecutionRecord, StateError>;

    /// Bump the serial and persist the record atomically, provided `lock` is
    /// still the current, unexpired lock.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockNotHeld`] without writing when `lock` was lost,
    /// or an error when the record cannot be encoded or written.
    fn save(&self, record: &mut ExecutionRecord, lock: &LockInfo) -> Result<(), StateError>;

    /// # Errors
    ///
    /// Returns [`StateError::ConcurrentExecutionConflict`] while another live
    /// lock exists.
    fn acquire_lock(&self, operation: &str, ttl: Duration) -> Result<LockInfo, StateError>;

    /// An expired lock counts as lost and is not renewed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockNotHeld`] when `lock` is no longer current or
    /// has expired.
    fn renew_lock(&self, lock: &LockInfo, ttl: Duration) -> Result<LockInfo, StateError>;

    /// # Errors
    ///
    /// Returns [`StateError::LockNotHeld`] when a different lock is current.
    fn release_lock(&self, lock_id: &str) -> Result<(), StateError>;

    /// Remove a lock left behind by another process.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockNotHeld`] unless `lock_id` names the current
    /// lock.
    fn force_unlock(&self, lock_id: &str) -> Result<(), StateError>;
}

/// Holds a lock for the duration of one operation and releases it on drop.
pub struct LockGuard<'a> {
    store: &'a dyn StateStore,
    lock: LockInfo,
    ttl: Duration,
    released: bool,
}

impl<'a> LockGuard<'a> {
    /// # Errors
    ///
    /// See [`StateStore::acquire_lock`].
    pub fn acquire(
        store: &'a dyn StateStore,
        operation: &str,
        ttl: Duration,
    ) -> Result<Self, StateError> {
        let lock = store.acquire_lock(operation, ttl)?;
        debug!(lock = %lock.id, operation, "acquired state lock");
        Ok(Self {
            store,
            lock,
            ttl,
            released: false,
        })
    }

    #[must_use]
    pub const fn info(&self) -> &LockInfo {
        &self.lock
    }

    /// Push the expiry forward by the original time-to-live.
    ///
    /// # Errors
    ///
    /// See [`StateStore::renew_lock`].
    pub fn renew(&mut self) -> Result<(), StateError> {
        self.lock = self.store.renew_lock(&self.lock, self.ttl)?;
        Ok(())
    }

    /// # Errors
    ///
    /// See [`StateStore::release_lock`].
    pub fn release(mut self) -> Result<(), StateError> {
        self.released = true;
        self.store.release_lock(&self.lock.id)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(error) = self.store.release_lock(&self.lock.id) {
            warn!(lock = %self.lock.id, %error, "failed to release state lock");
        }
    }
}

/// A locked, loaded execution record for one operation.
///
/// Only the coordinating thread holds a session, so it is the single writer of
/// the record.
pub struct Session<'a> {
    store: &'a dyn StateStore,
    lock: LockGuard<'a>,
    pub record: ExecutionRecord,
}

impl<'a> Session<'a> {
    /// Take the lock, then load the record.
    ///
    /// # Errors
    ///
    /// Returns an error when the lock is held elsewhere or the record cannot be
    /// loaded. The lock is released again if loading fails.
    pub fn open(
        store: &'a dyn StateStore,
        operation: &str,
        ttl: Duration,
    ) -> Result<Self, StateError> {
        let lock = LockGuard::acquire(store, operation, ttl)?;
        let record = store.load()?;
        Ok(Self {
            store,
            lock,
            record,
        })
    }

    #[must_use]
    pub const fn lock(&self) -> &LockInfo {
        self.lock.info()
    }

    /// Extend the lock, then persist the record under it.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockNotHeld`] without writing when the lock was
    /// lost, or an error when saving fails.
    pub fn checkpoint(&mut self) -> Result<(), StateError> {
        self.lock.renew()?;
        self.store.save(&mut self.record, self.lock.info())
    }

    /// Release the lock and hand back the final record.
    ///
    /// # Errors
    ///
    /// Returns an error when the lock cannot be released.
    pub fn close(self) -> Result<ExecutionRecord, StateError> {
        self.lock.release()?;
        Ok(self.record)
    }
}

/// Execution record stored as pretty JSON, with a sibling `.lock` file.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileStateStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        let mut lock_name = path
            .file_name()
            .map_or_else(|| OsString::from("state"), ToOwned::to_owned);
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self { path, lock_path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Current lock, if any.
    ///
    /// # Errors
    ///
    /// Returns an error when the lock file exists but cannot be read or decoded.
    pub fn current_lock(&self) -> Result<Option<LockInfo>, StateError> {
        read_lock(&self.lock_path)
    }

    fn remove_lock_file(&self) -> Result<(), StateError> {
        remove_if_present(&self.lock_path)
    }

    /// Move `expired` out of the lock path so a new lock can be created.
    ///
    /// The lock file is renamed aside before it is inspected, so two runs racing
    /// for the same expired lock cannot both remove it. Returns `false` when the
    /// file no longer held `expired`; whatever was moved aside is then put back
    /// unless a newer lock already took its place.
    fn claim_expired(&self, expired: &LockInfo) -> Result<bool, StateError> {
        let mut claim_name = self
            .lock_path
            .file_name()
            .map_or_else(|| OsString::from("state.lock"), ToOwned::to_owned);
        claim_name.push(format!(".claim-{}", Uuid::new_v4()));
        let claim_path = self.lock_path.with_file_name(claim_name);

        match fs::rename(&self.lock_path, &claim_path) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(source) => {
                return Err(StateError::LockIo {
                    path: self.lock_path.clone(),
                    source,
                });
            }
        }

        let claimed = read_lock(&claim_path);
        if matches!(&claimed, Ok(Some(lock)) if lock == expired) {
            remove_if_present(&claim_path)?;
            return Ok(true);
        }

        // hard_link never replaces an existing lock file.
        match fs::hard_link(&claim_path, &self.lock_path) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                warn!(path = %self.lock_path.display(), "lock changed while restoring it");
            }
            Err(source) => {
                return Err(StateError::LockIo {
                    path: self.lock_path.clone(),
                    source,
                });
            }
        }
        remove_if_present(&claim_path)?;
        claimed.map(|_| false)
    }

    fn ensure_parent(&self) -> Result<(), StateError> {
        let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty())
        else {
            return Ok(());
        };
        fs::create_dir_all(parent).map_err(|source| StateError::Write {
            path: parent.to_path_buf(),
            source,
        })
    }

    fn write_atomic(&self, target: &Path, bytes: &[u8]) -> Result<(), StateError> {
        self.ensure_parent()?;
        let parent = target
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let write_error = |source| StateError::Write {
            path: target.to_path_buf(),
            source,
        };
        let mut temp = NamedTempFile::new_in(parent).map_err(write_error)?;
        temp.write_all(bytes).map_err(write_error)?;
        temp.as_file().sync_all().map_err(write_error)?;
        temp.persist(target)
            .map_err(|source| StateError::Persist {
                path: target.to_path_buf(),
                source,
            })?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<ExecutionRecord, StateError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Ok(ExecutionRecord::default());
            }
            Err(source) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let decode_error = |source| StateError::Decode {
            path: self.path.clone(),
            source,
        };
        let document: serde_json::Value = serde_json::from_str(&raw).map_err(decode_error)?;
        let found = document
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        if found != u64::from(EXECUTION_RECORD_VERSION) {
            return Err(StateError::UnsupportedVersion {
                path: self.path.clone(),
                found: u32::try_from(found).unwrap_or(u32::MAX),
                expected: EXECUTION_RECORD_VERSION,
            });
        }
        serde_json::from_value(document).map_err(decode_error)
    }

    fn save(&self, record: &mut ExecutionRecord, lock: &LockInfo) -> Result<(), StateError> {
        match self.current_lock()? {
            Some(current) if current.id == lock.id && !current.is_expired_at(Utc::now()) => {}
            _ => {
                return Err(StateError::LockNotHeld {
                    lock_id: lock.id.clone(),
                });
            }
        }
        record.version = EXECUTION_RECORD_VERSION;
        record.serial += 1;
        let mut encoded = serde_json::to_vec_pretty(record)
            .map_err(|source| StateError::Encode { source })?;
        encoded.push(b'\n');
        self.write_atomic(&self.path, &encoded)?;
        debug!(path = %self.path.display(), serial = record.serial, "saved execution record");
        Ok(())
    }

    fn acquire_lock(&self, operation: &str, ttl: Duration) -> Result<LockInfo, StateError> {
        self.ensure_parent()?;

        // Later rounds follow the removal of an expired lock or a lock that
        // vanished between the create and the read.
        for _ in 0..3 {
            let now = Utc::now();
            let lock = LockInfo {
                id: Uuid::new_v4().to_string(),
                owner: lock_owner(),
                operation: operation.to_string(),
                acquired_at: now,
                expires_at: expiry(now, ttl)?,
            };

            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    let encoded = serde_json::to_vec_pretty(&lock)
                        .map_err(|source| StateError::Encode { source })?;
                    file.write_all(&encoded)
                        .and_then(|()| file.sync_all())
                        .map_err(|source| StateError::LockIo {
                            path: self.lock_path.clone(),
                            source,
                        })?;
                    return Ok(lock);
                }
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                    let Some(existing) = self.current_lock()? else {
                        continue;
                    };
                    if !existing.is_expired_at(now) {
                        return Err(conflict(existing));
                    }
                    if self.claim_expired(&existing)? {
                        warn!(
                            lock = %existing.id,
                            owner = %existing.owner,
                            expired_at = %existing.expires_at,
                            "took over expired state lock"
                        );
                    }
                }
                Err(source) => {
                    return Err(StateError::LockIo {
                        path: self.lock_path.clone(),
                        source,
                    });
                }
            }
        }

        match self.current_lock()? {
            Some(existing) => Err(conflict(existing)),
            None => Err(StateError::LockIo {
                path: self.lock_path.clone(),
                source: io::Error::other("lock file kept changing while acquiring"),
            }),
        }
    }

    fn renew_lock(&self, lock: &LockInfo, ttl: Duration) -> Result<LockInfo, StateError> {
        // Takeover only claims a lock whose file content has expired, so an
        // unexpired lock cannot change hands before this write lands.
        let now = Utc::now();
        match self.current_lock()? {
            Some(current) if current.id == lock.id && !current.is_expired_at(now) => {
                let renewed = LockInfo {
                    expires_at: expiry(now, ttl)?,
                    ..current
                };
                let encoded = serde_json::to_vec_pretty(&renewed)
                    .map_err(|source| StateError::Encode { source })?;
                self.write_atomic(&self.lock_path, &encoded)?;
                Ok(renewed)
            }
            _ => Err(StateError::LockNotHeld {
                lock_id: lock.id.clone(),
            }),
        }
    }

    fn release_lock(&self, lock_id: &str) -> Result<(), StateError> {
        match self.current_lock()? {
            None => Ok(()),
            Some(current) if current.id == lock_id => self.remove_lock_file(),
            Some(_) => Err(StateError::LockNotHeld {
                lock_id: lock_id.to_string(),
            }),
        }
    }

    fn force_unlock(&self, lock_id: &str) -> Result<(), StateError> {
        match self.current_lock()? {
            Some(current) if current.id == lock_id => {
                warn!(lock = %current.id, owner = %current.owner, "force-releasing state lock");
                self.remove_lock_file()
            }
            _ => Err(StateError::LockNotHeld {
                lock_id: lock_id.to_string(),
            }),
        }
    }
}

fn read_lock(path: &Path) -> Result<Option<LockInfo>, StateError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StateError::LockIo {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| StateError::LockDecode {
            path: path.to_path_buf(),
            source,
        })
}

fn remove_if_present(path: &Path) -> Result<(), StateError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StateError::LockIo {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, StateError> {
    now.checked_add_signed(ttl)
        .ok_or(StateError::LockTtlOutOfRange {
            seconds: ttl.num_seconds(),
        })
}

fn conflict(existing: LockInfo) -> StateError {
    StateError::ConcurrentExecutionConflict {
        lock_id: existing.id,
        owner: existing.owner,
        operation: existing.operation,
        expires_at: existing.expires_at,
    }
}

fn lock_owner() -> String {
    let user = env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{user} (pid {})", process::id())
}
