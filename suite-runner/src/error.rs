// Error types
// Errors surfaced by planning, device handling and harness execution.

use std::time::Duration;

use thiserror::Error;

use crate::device::DeviceError;

pub type SuiteResult<T> = Result<T, SuiteError>;

#[derive(Debug, Error)]
pub enum SuiteError {
    /// The run configuration is contradictory or incomplete.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A standalone device was requested that no registry provides.
    #[error("unknown standalone device '{requested}'. Known devices are: {known}")]
    UnknownStandalone { requested: String, known: String },

    /// A device operation failed.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// The harness process could not be spawned.
    #[error("failed to launch test harness: {0}")]
    Launch(#[source] std::io::Error),

    /// A harness process exceeded its wall clock budget and was killed.
    #[error("test process timed out after {0:?}")]
    Timeout(Duration),

    /// A harness process exited without producing a report.
    #[error("test process {0}")]
    Crashed(String),

    /// The harness produced a report line that could not be decoded.
    #[error("malformed harness report: {0}")]
    Report(String),

    /// A worker task panicked or was cancelled.
    #[error("worker task failed: {0}")]
    WorkerPanic(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_standalone_lists_known_devices() {
        let err = SuiteError::UnknownStandalone {
            requested: "gpu".to_string(),
            known: "runtime, c-standalone".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("'gpu'"));
        assert!(message.contains("runtime, c-standalone"));
    }

    #[test]
    fn device_errors_convert() {
        let err: SuiteError = DeviceError::Unknown("gpu".to_string()).into();
        assert!(matches!(err, SuiteError::Device(_)));
    }
}
