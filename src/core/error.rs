use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("permission denied for {0}")]
    PermissionDenied(String),
    #[error("device removed: {0}")]
    Removed(String),
    #[error("no {0} device available")]
    NoneAvailable(&'static str),
    #[error("unsupported sample format: {0}")]
    Unsupported(String),
    #[error("audio backend error: {0}")]
    Backend(String),
    #[error("device {0} did not produce audio in time")]
    NotLive(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("timed out connecting to channel {0}")]
    Timeout(String),
    #[error("timed out leaving channel {0}")]
    LeaveTimeout(String),
    #[error("join rejected: {0}")]
    Rejected(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("screen capture permission denied")]
    PermissionDenied,
    #[error("no capturable surface")]
    NoCapturableSurface,
    #[error("not connected to a voice channel")]
    NotConnected,
    #[error("share backend error: {0}")]
    Backend(String),
}

/// Delayed or dropped remote reports. Never fatal; the registry expires
/// state instead of waiting.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransientNetworkError {
    #[error("no report from {user_id} for {elapsed_ms}ms")]
    ReportTimeout { user_id: String, elapsed_ms: u64 },
    #[error("report for unknown participant {0}")]
    UnknownParticipant(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VoiceError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Network(#[from] TransientNetworkError),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Device,
    Connection,
    Stream,
    Network,
}

/// Error as it appears on the published snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorStatus {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl VoiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Device(_) => ErrorKind::Device,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Stream(_) => ErrorKind::Stream,
            Self::Network(_) => ErrorKind::Network,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(ConnectionError::Rejected(_)) => false,
            Self::Stream(StreamError::PermissionDenied) => false,
            Self::Device(DeviceError::PermissionDenied(_)) => false,
            _ => true,
        }
    }

    pub fn status(&self) -> ErrorStatus {
        ErrorStatus {
            kind: self.kind(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}
