//! Cross-process file-lock contention negotiation for shared cache
//! directories.
//!
//! Processes sharing a cache directory take whole-file locks on lock files
//! next to the data they guard. A holder advertises a loopback UDP port in
//! the lock file; a process that fails to acquire the lock pings that port
//! to ask for an early release instead of waiting out the holder. The
//! protocol is best-effort and retry-driven: lost packets and vanished
//! peers degrade to plain blocking acquisition, never to deadlock.

pub mod contention;
pub mod error;
pub mod lockfile;
pub mod manager;
pub mod protocol;
pub mod signal;
pub mod transport;

pub use contention::{
    ContentionConfig, ContentionHandler, RejectingContentionHandler, ReleaseHandle,
    UdpContentionHandler, WhenContended,
};
pub use error::{LockError, Result};
pub use manager::{DEFAULT_LOCK_TIMEOUT, FileLock, FileLockManager, LockMode};
pub use signal::{AwaitableSignal, LockReleasedSignal};
