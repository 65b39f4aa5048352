//! Crate-wide error kinds surfaced to clients (spec §7).
//!
//! Each module that can fail defines its own narrow error enum; this module
//! is the umbrella every one of them converts into at the boundaries that
//! need a single type (session teardown, the net layer, `main`).

use std::fmt;
use thiserror::Error;

/// Error kinds surfaced to socket clients, one per spec.md §7 entry.
#[derive(Debug, Error, PartialEq)]
pub enum CoreError {
    #[error("io error: {detail}")]
    Io { detail: String },

    #[error("protocol desync: {detail}")]
    ProtocolDesync { detail: String },

    #[error("line too long ({len} bytes, capacity {capacity})")]
    ErrorLineTooLong { len: usize, capacity: usize },

    #[error("session busy: a job is running")]
    SessionBusy,

    #[error("illegal state for {verb}: observed {observed}")]
    IllegalState { verb: String, observed: String },

    #[error("jog cancel fence timed out")]
    JogCancelTimeout,

    #[error("alarm raised: {code}")]
    AlarmRaised { code: u32 },

    #[error("timeout waiting for {what} ({ms} ms)")]
    Timeout { what: String, ms: u64 },

    #[error("port not open")]
    NotOpen,

    #[error("port already open")]
    AlreadyOpen,

    #[error("port gone: {detail}")]
    PortGone { detail: String },

    #[error("no such port: {port}")]
    NoSuchPort { port: String },
}

impl CoreError {
    /// Stable string tag used as the `error` field on the wire (§6 Socket API).
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Io { .. } => "IoError",
            CoreError::ProtocolDesync { .. } => "ProtocolDesync",
            CoreError::ErrorLineTooLong { .. } => "ErrorLineTooLong",
            CoreError::SessionBusy => "SessionBusy",
            CoreError::IllegalState { .. } => "IllegalState",
            CoreError::JogCancelTimeout => "JogCancelTimeout",
            CoreError::AlarmRaised { .. } => "AlarmRaised",
            CoreError::Timeout { .. } => "Timeout",
            CoreError::NotOpen => "NotOpen",
            CoreError::AlreadyOpen => "AlreadyOpen",
            CoreError::PortGone { .. } => "PortGone",
            CoreError::NoSuchPort { .. } => "NoSuchPort",
        }
    }
}

/// Wire-level error payload sent to a client on a rejected message (§6).
#[derive(Clone, Debug, serde::Serialize)]
pub struct ErrorPayload {
    pub error: String,
    pub message: String,
}

impl From<&CoreError> for ErrorPayload {
    fn from(e: &CoreError) -> Self {
        ErrorPayload {
            error: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error, self.message)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
