use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("{0} is already locked by this process")]
    AlreadyLockedByThisProcess(String),

    #[error("timeout waiting to lock {display_name} (lock file: {lock_file})")]
    LockTimeout {
        display_name: String,
        lock_file: String,
        owner_pid: Option<u32>,
        owner_operation: Option<String>,
    },

    #[error("contention handler has been stopped")]
    HandlerStopped,

    #[error("lock {0} already has a contention action registered")]
    AlreadyContended(u64),

    #[error("requesters for lock {0} were already notified")]
    RequestersConsumed(u64),

    #[error("cross-process lock negotiation is not supported by this handler")]
    NegotiationUnsupported,

    #[error("malformed contention packet: {0}")]
    Decode(String),

    #[error("random source unavailable: {0}")]
    RandomSource(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LockError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyLockedByThisProcess(_) => "already_locked_by_this_process",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::HandlerStopped => "handler_stopped",
            Self::AlreadyContended(_) => "already_contended",
            Self::RequestersConsumed(_) => "requesters_consumed",
            Self::NegotiationUnsupported => "negotiation_unsupported",
            Self::Decode(_) => "decode_error",
            Self::RandomSource(_) => "random_source",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
