use std::fs;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// Format version of the discovery record. Bumped when the field set
/// changes incompatibly; readers ignore records from other versions.
pub const INFO_VERSION: u32 = 1;

/// Discovery record a lock holder leaves in the lock file while the lock is
/// held. A later process that fails to acquire the lock reads this to learn
/// where the owner listens for unlock requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    pub version: u32,
    pub lock_id: u64,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(lock_id: u64, port: Option<u16>, operation: Option<String>) -> Self {
        Self {
            version: INFO_VERSION,
            lock_id,
            pid: std::process::id(),
            port,
            operation,
            acquired_at: Utc::now(),
        }
    }
}

/// Replace the lock file contents with the holder's discovery record.
/// Callers must hold the exclusive lock on `file`.
pub fn write_info(file: &mut File, info: &LockInfo) -> Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(serde_json::to_string(info)?.as_bytes())?;
    file.flush()?;
    Ok(())
}

/// Read the owner's discovery record, tolerating absence and corruption:
/// the holder may be mid-write, already gone, or running an incompatible
/// version, and in each case the requester falls back to blind retrying.
pub fn read_info(lock_file: &Path) -> Option<LockInfo> {
    let raw = match fs::read_to_string(lock_file) {
        Ok(raw) => raw,
        Err(err) => {
            debug!(lock_file = %lock_file.display(), %err, "could not read lock info");
            return None;
        }
    };
    if raw.is_empty() {
        return None;
    }
    let info: LockInfo = match serde_json::from_str(&raw) {
        Ok(info) => info,
        Err(err) => {
            debug!(lock_file = %lock_file.display(), %err, "ignoring unparseable lock info");
            return None;
        }
    };
    if info.version != INFO_VERSION {
        debug!(
            lock_file = %lock_file.display(),
            version = info.version,
            "ignoring lock info from incompatible version"
        );
        return None;
    }
    Some(info)
}

/// Truncate the discovery record on release so later requesters do not ping
/// a dead owner.
pub fn clear_info(file: &mut File) -> Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;

    use tempfile::tempdir;

    use super::*;

    fn open_lock_file(path: &Path) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.lock");
        let mut file = open_lock_file(&path);

        let info = LockInfo::new(42, Some(9125), Some("rebuild index".into()));
        write_info(&mut file, &info).unwrap();

        assert_eq!(read_info(&path), Some(info));
    }

    #[test]
    fn rewrite_replaces_previous_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.lock");
        let mut file = open_lock_file(&path);

        write_info(&mut file, &LockInfo::new(1, Some(1000), None)).unwrap();
        let second = LockInfo::new(2, Some(2000), None);
        write_info(&mut file, &second).unwrap();

        assert_eq!(read_info(&path), Some(second));
    }

    #[test]
    fn missing_empty_and_garbled_files_read_as_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.lock");
        assert_eq!(read_info(&path), None);

        let mut file = open_lock_file(&path);
        assert_eq!(read_info(&path), None);

        file.write_all(b"{ not json").unwrap();
        assert_eq!(read_info(&path), None);
    }

    #[test]
    fn incompatible_version_reads_as_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.lock");
        let mut file = open_lock_file(&path);

        let mut info = LockInfo::new(42, Some(9125), None);
        info.version = INFO_VERSION + 1;
        write_info(&mut file, &info).unwrap();

        assert_eq!(read_info(&path), None);
    }

    #[test]
    fn clear_leaves_an_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.lock");
        let mut file = open_lock_file(&path);

        write_info(&mut file, &LockInfo::new(42, Some(9125), None)).unwrap();
        clear_info(&mut file).unwrap();

        assert_eq!(read_info(&path), None);
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }
}
