use fleet_core::contracts::{FrameError, PatchError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Transport(String),
    #[error("{endpoint} returned {status}: {detail}")]
    Status {
        endpoint: String,
        status: u16,
        detail: String,
    },
    #[error("invalid backend payload: {0}")]
    Decode(#[from] FrameError),
    #[error("cannot build endpoint: {0}")]
    Endpoint(String),
    #[error("terminal stream failed: {0}")]
    Stream(String),
    #[error("invalid request: {0}")]
    Invalid(#[from] PatchError),
}

impl BackendError {
    /// Worth retrying on the next poll or interaction.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Transport(_) | BackendError::Stream(_) => true,
            BackendError::Status { status, .. } => *status >= 500 || *status == 429,
            BackendError::Decode(_) | BackendError::Endpoint(_) | BackendError::Invalid(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Transport(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session establishment aborted")]
    Aborted,
    #[error("could not open terminal session: {0}")]
    Establish(String),
    #[error("terminal stream error: {0}")]
    Stream(String),
    #[error("session disposed")]
    Disposed,
    #[error("terminal not connected")]
    NotConnected,
    #[error("unknown robot: {0}")]
    UnknownRobot(String),
}

impl SessionError {
    /// Message shown to the operator while the session sits in `error`.
    pub fn actionable(&self) -> String {
        match self {
            SessionError::Aborted => "Connection attempt was cancelled. Reconnect to retry.".to_string(),
            SessionError::Establish(reason) | SessionError::Stream(reason) => {
                format!("{reason}. Reconnect to retry.")
            }
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid backend url {url:?}: {reason}")]
    BackendUrl { url: String, reason: String },
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("countdown window {mode} is inverted: min {min_ms}ms > max {max_ms}ms")]
    InvertedWindow {
        mode: &'static str,
        min_ms: u128,
        max_ms: u128,
    },
}

#[derive(Debug, Error)]
pub enum OperationError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("fix {fix_id} failed: {reason}")]
    FixFailed { fix_id: String, reason: String },
    #[error("fix {fix_id} did not finish within {waited_ms}ms")]
    FixTimedOut { fix_id: String, waited_ms: u128 },
    #[error("backend returned no result for {0}")]
    MissingResult(String),
}
