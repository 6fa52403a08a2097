//! Error types for the device coordinator

use thiserror::Error;

use crate::ids::{CompositeId, DeviceId, HostId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    #[error("Driver host not found: {0}")]
    HostNotFound(HostId),

    #[error("Composite device not found: {0}")]
    CompositeNotFound(CompositeId),

    #[error("Invalid state: device is {current}, expected {expected}")]
    InvalidState { current: String, expected: String },

    #[error("Device {0} is already bound")]
    AlreadyBound(DeviceId),

    #[error("Operation already in progress: {0}")]
    AlreadyExists(String),

    #[error("Ambiguous composite match for '{composite}': fragment {index} is bound to {bound} and also matches {candidate}")]
    AmbiguousMatch {
        composite: String,
        index: usize,
        bound: DeviceId,
        candidate: DeviceId,
    },

    #[error("Invalid composite descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Fragment proxies for composite '{0}' would span multiple driver hosts")]
    CrossHostProxy(String),

    #[error("Composite '{0}' is not ready to assemble")]
    ShouldWait(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Driver host is shutting down: {0}")]
    HostDying(HostId),

    #[error("Cannot remove immortal device {0}")]
    Immortal(DeviceId),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Terminal status carried by an asynchronous lifecycle task.
///
/// Distinct from [`Error`]: task statuses fan out to dependents and are
/// recorded on completed tasks, so they stay small and cloneable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The remote end is gone; the task was completed locally.
    #[error("driver host unavailable")]
    Unavailable,

    /// The watchdog expired before the operation completed.
    #[error("timed out")]
    Timeout,

    /// The driver reported a failure for the operation.
    #[error("driver failure: {0}")]
    Failed(String),

    /// The request could not be delivered to the driver host.
    #[error("transport: {0}")]
    Transport(String),
}

/// Completion status of a lifecycle task.
pub type TaskStatus = std::result::Result<(), TaskError>;

impl Error {
    /// Collapse a synchronous error into the status reported through a
    /// task completion.
    pub fn into_task_error(self) -> TaskError {
        match self {
            Error::Transport(msg) => TaskError::Transport(msg),
            Error::HostDying(_) | Error::HostNotFound(_) => TaskError::Unavailable,
            other => TaskError::Failed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidState {
            current: "Dead".into(),
            expected: "Active".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state: device is Dead, expected Active"
        );
    }

    #[test]
    fn test_into_task_error() {
        let err = Error::Transport("channel closed".into());
        assert_eq!(
            err.into_task_error(),
            TaskError::Transport("channel closed".into())
        );
        assert_eq!(
            Error::HostNotFound(HostId(3)).into_task_error(),
            TaskError::Unavailable
        );
    }
}
