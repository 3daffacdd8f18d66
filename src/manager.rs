use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::contention::{ContentionHandler, WhenContended};
use crate::error::{LockError, Result};
use crate::lockfile::{self, LockInfo};
use crate::signal::{AwaitableSignal, LockReleasedSignal};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

// retry backoff while the lock is held elsewhere (doubling, capped)
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(1);
const MAX_RETRY_DELAY: Duration = Duration::from_millis(512);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    Shared,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exclusive => write!(f, "exclusive"),
            Self::Shared => write!(f, "shared"),
        }
    }
}

/// Where the lock file for `target` lives: inside a directory target, next
/// to a file target.
pub fn lock_file_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("cache"));
    name.push(".lock");
    if target.is_dir() {
        target.join(name)
    } else {
        target.with_file_name(name)
    }
}

fn random_lock_id() -> Result<u64> {
    let mut bytes = [0u8; 8];
    getrandom::fill(&mut bytes).map_err(|err| LockError::RandomSource(err.to_string()))?;
    Ok(u64::from_be_bytes(bytes))
}

/// Acquires whole-file locks on lock files next to cache targets, and wires
/// exclusively-held locks into cross-process release negotiation.
pub struct FileLockManager {
    handler: Arc<dyn ContentionHandler>,
    lock_timeout: Duration,
    locked_files: Arc<Mutex<HashSet<PathBuf>>>,
}

impl FileLockManager {
    pub fn new(handler: Arc<dyn ContentionHandler>) -> Self {
        Self::with_timeout(handler, DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_timeout(handler: Arc<dyn ContentionHandler>, lock_timeout: Duration) -> Self {
        Self {
            handler,
            lock_timeout,
            locked_files: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn lock(&self, target: &Path, mode: LockMode, display_name: &str) -> Result<FileLock> {
        self.lock_with(target, mode, display_name, None, None)
    }

    /// Acquire a lock on `target`, waiting out (and negotiating with) any
    /// current owner. `when_contended` registers this process as a
    /// negotiating holder: the callback must release the lock and then
    /// signal the handle it is given.
    pub fn lock_with(
        &self,
        target: &Path,
        mode: LockMode,
        display_name: &str,
        operation: Option<&str>,
        when_contended: Option<WhenContended>,
    ) -> Result<FileLock> {
        let lock_file_path = lock_file_path(target);
        if let Some(parent) = lock_file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_file_path)?;
        let canonical_key = fs::canonicalize(&lock_file_path).unwrap_or_else(|_| lock_file_path.clone());

        {
            let mut registry = self
                .locked_files
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !registry.insert(canonical_key.clone()) {
                return Err(LockError::AlreadyLockedByThisProcess(
                    display_name.to_string(),
                ));
            }
        }

        match self.lock_registered(&mut file, &lock_file_path, mode, display_name, operation, when_contended) {
            Ok(lock_id) => Ok(FileLock {
                file: Some(file),
                lock_file_path,
                canonical_key,
                mode,
                lock_id,
                display_name: display_name.to_string(),
                handler: Arc::clone(&self.handler),
                registry: Arc::clone(&self.locked_files),
            }),
            Err(err) => {
                self.locked_files
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&canonical_key);
                Err(err)
            }
        }
    }

    fn lock_registered(
        &self,
        file: &mut File,
        lock_file_path: &Path,
        mode: LockMode,
        display_name: &str,
        operation: Option<&str>,
        when_contended: Option<WhenContended>,
    ) -> Result<u64> {
        let lock_id = random_lock_id()?;
        let port = self.handler.reserve_port()?;
        let negotiating = when_contended.is_some();
        if let Some(callback) = when_contended {
            self.handler.start(lock_id, callback)?;
        }

        debug!(display_name, %mode, "waiting to acquire lock");
        if let Err(err) = self.acquire(file, lock_file_path, mode, display_name) {
            if negotiating {
                self.handler.stop_lock(lock_id);
            }
            return Err(err);
        }
        debug!(display_name, %mode, lock_id, "lock acquired");

        if mode == LockMode::Exclusive {
            let info = LockInfo::new(lock_id, port, operation.map(str::to_string));
            if let Err(err) = lockfile::write_info(file, &info) {
                let _ = file.unlock();
                if negotiating {
                    self.handler.stop_lock(lock_id);
                }
                return Err(err);
            }
        }
        Ok(lock_id)
    }

    fn acquire(
        &self,
        file: &File,
        lock_file_path: &Path,
        mode: LockMode,
        display_name: &str,
    ) -> Result<()> {
        let signal = Arc::new(AwaitableSignal::new());
        let mut delay = INITIAL_RETRY_DELAY;
        // restarted whenever the lock changes hands, so a new owner gets a
        // full patience window
        let mut patience = Instant::now();
        let mut last_owner_port: Option<u16> = None;
        let mut last_ping: Option<Instant> = None;
        let mut negotiate = true;

        loop {
            let attempt = match mode {
                LockMode::Exclusive => FileExt::try_lock_exclusive(file),
                LockMode::Shared => FileExt::try_lock_shared(file),
            };
            if attempt.is_ok() {
                return Ok(());
            }

            let info = lockfile::read_info(lock_file_path);
            if negotiate && self.handler.is_running() {
                if let Some(info) = &info {
                    if let Some(owner_port) = info.port {
                        if last_owner_port != Some(owner_port) {
                            patience = Instant::now();
                            last_owner_port = Some(owner_port);
                            last_ping = None;
                        }
                        let elapsed = last_ping.map_or(Duration::MAX, |at| at.elapsed());
                        let release_signal: Arc<dyn LockReleasedSignal> = Arc::clone(&signal) as _;
                        match self.handler.maybe_ping_owner(
                            owner_port,
                            info.lock_id,
                            display_name,
                            elapsed,
                            Some(release_signal),
                        ) {
                            Ok(true) => {
                                last_ping = Some(Instant::now());
                                debug!(
                                    display_name,
                                    owner_port,
                                    owner_pid = info.pid,
                                    owner_lock_id = info.lock_id,
                                    "lock is held by another process, pinged owner"
                                );
                            }
                            Ok(false) => {}
                            Err(err) => {
                                debug!(%err, "negotiation unavailable, waiting for the lock instead");
                                negotiate = false;
                            }
                        }
                    } else {
                        debug!(
                            display_name,
                            owner_pid = info.pid,
                            "lock owner did not advertise a contention port"
                        );
                    }
                }
            }

            if patience.elapsed() >= self.lock_timeout {
                return Err(LockError::LockTimeout {
                    display_name: display_name.to_string(),
                    lock_file: lock_file_path.display().to_string(),
                    owner_pid: info.as_ref().map(|i| i.pid),
                    owner_operation: info.as_ref().and_then(|i| i.operation.clone()),
                });
            }

            if signal.wait_for(delay) {
                // the owner confirmed release; retry immediately
                delay = INITIAL_RETRY_DELAY;
            } else {
                delay = (delay * 2).min(MAX_RETRY_DELAY);
            }
        }
    }
}

/// A held lock. Releasing clears the advertised discovery record, unlocks
/// the file, and deregisters the contention action; dropping does the same
/// with failures logged instead of raised.
pub struct FileLock {
    file: Option<File>,
    lock_file_path: PathBuf,
    canonical_key: PathBuf,
    mode: LockMode,
    lock_id: u64,
    display_name: String,
    handler: Arc<dyn ContentionHandler>,
    registry: Arc<Mutex<HashSet<PathBuf>>>,
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock")
            .field("file", &self.file)
            .field("lock_file_path", &self.lock_file_path)
            .field("canonical_key", &self.canonical_key)
            .field("mode", &self.mode)
            .field("lock_id", &self.lock_id)
            .field("display_name", &self.display_name)
            .field("handler", &"<dyn ContentionHandler>")
            .field("registry", &self.registry)
            .finish()
    }
}

impl FileLock {
    pub fn lock_id(&self) -> u64 {
        self.lock_id
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file_path
    }

    pub fn is_lock_file(&self, path: &Path) -> bool {
        path == self.lock_file_path
    }

    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        debug!(display_name = %self.display_name, lock_id = self.lock_id, "releasing lock");
        let mut result = Ok(());
        if self.mode == LockMode::Exclusive {
            if let Err(err) = lockfile::clear_info(&mut file) {
                result = Err(err);
            }
        }
        if let Err(err) = file.unlock() {
            if result.is_ok() {
                result = Err(err.into());
            }
        }
        self.handler.stop_lock(self.lock_id);
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.canonical_key);
        result
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(display_name = %self.display_name, %err, "failed to release lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::contention::RejectingContentionHandler;

    fn rejecting_manager() -> FileLockManager {
        FileLockManager::new(Arc::new(RejectingContentionHandler))
    }

    #[test]
    fn lock_file_path_for_directory_target_is_inside_it() {
        let dir = tempdir().unwrap();
        assert_eq!(
            lock_file_path(dir.path()),
            dir.path().join(format!(
                "{}.lock",
                dir.path().file_name().unwrap().to_string_lossy()
            ))
        );
    }

    #[test]
    fn lock_file_path_for_file_target_is_a_sibling() {
        assert_eq!(
            lock_file_path(Path::new("/caches/artifacts.bin")),
            Path::new("/caches/artifacts.bin.lock")
        );
    }

    #[test]
    fn exclusive_lock_round_trip() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("artifacts.bin");
        let manager = rejecting_manager();

        let lock = manager
            .lock(&target, LockMode::Exclusive, "artifact cache")
            .unwrap();
        assert_eq!(lock.mode(), LockMode::Exclusive);
        assert!(lock.is_lock_file(&dir.path().join("artifacts.bin.lock")));
        lock.close().unwrap();

        // reacquirable after release
        let lock = manager
            .lock(&target, LockMode::Exclusive, "artifact cache")
            .unwrap();
        drop(lock);
    }

    #[test]
    fn locking_the_same_target_twice_in_one_process_is_rejected() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("artifacts.bin");
        let manager = rejecting_manager();

        let _held = manager
            .lock(&target, LockMode::Exclusive, "artifact cache")
            .unwrap();
        let err = manager
            .lock(&target, LockMode::Exclusive, "artifact cache")
            .unwrap_err();
        assert!(matches!(err, LockError::AlreadyLockedByThisProcess(_)));
    }

    #[test]
    fn release_clears_the_discovery_record() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("artifacts.bin");
        let manager = rejecting_manager();

        let lock = manager
            .lock(&target, LockMode::Exclusive, "artifact cache")
            .unwrap();
        let lock_file = lock.lock_file().to_path_buf();
        assert!(lockfile::read_info(&lock_file).is_some());

        lock.close().unwrap();
        assert!(lockfile::read_info(&lock_file).is_none());
    }

    #[test]
    fn discovery_record_carries_this_process_identity() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("artifacts.bin");
        let manager = rejecting_manager();

        let lock = manager
            .lock_with(
                &target,
                LockMode::Exclusive,
                "artifact cache",
                Some("rebuild index"),
                None,
            )
            .unwrap();
        let info = lockfile::read_info(lock.lock_file()).unwrap();
        assert_eq!(info.lock_id, lock.lock_id());
        assert_eq!(info.pid, std::process::id());
        assert_eq!(info.port, None);
        assert_eq!(info.operation.as_deref(), Some("rebuild index"));
    }

    #[test]
    fn shared_locks_from_separate_managers_coexist() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("artifacts.bin");
        let first = rejecting_manager();
        let second = rejecting_manager();

        let _a = first
            .lock(&target, LockMode::Shared, "artifact cache")
            .unwrap();
        let _b = second
            .lock(&target, LockMode::Shared, "artifact cache")
            .unwrap();
    }

    #[test]
    fn exclusive_lock_times_out_while_shared_lock_is_held() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("artifacts.bin");
        let first = rejecting_manager();
        let second = FileLockManager::with_timeout(
            Arc::new(RejectingContentionHandler),
            Duration::from_millis(200),
        );

        let _held = first
            .lock(&target, LockMode::Shared, "artifact cache")
            .unwrap();
        let err = second
            .lock(&target, LockMode::Exclusive, "artifact cache")
            .unwrap_err();
        assert!(matches!(err, LockError::LockTimeout { .. }));
    }
}
