//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all public interfaces in `darter`.
pub type DarterResult<T> = Result<T, DarterError>;

/// High-level error categories shared across the workspace.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DarterError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// A lifecycle transition was rejected because another operation holds the
    /// global state. Carries the name of the state that was observed instead.
    #[error("{0} - can not save database")]
    OperationInProgress(String),

    /// Peer payload is malformed or semantically invalid (`bad_message`).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// DNS resolution produced no usable address for a replication peer.
    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    /// Filesystem or socket I/O failed.
    #[error("io error: {0}")]
    Io(String),
}

impl DarterError {
    /// Wraps one `std::io::Error` preserving its display form.
    #[must_use]
    pub fn io(error: &std::io::Error) -> Self {
        Self::Io(error.to_string())
    }

    /// Builds the `bad_message` protocol error used by replication handshakes.
    #[must_use]
    pub fn bad_message(detail: impl Into<String>) -> Self {
        Self::Protocol(detail.into())
    }
}

#[cfg(test)]
mod tests {
    use super::DarterError;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn operation_in_progress_renders_observed_state_name() {
        let error = DarterError::OperationInProgress("SAVING".to_owned());
        assert_that!(
            format!("{error}").as_str(),
            eq("SAVING - can not save database")
        );
    }

    #[rstest]
    fn io_wrapper_preserves_source_message() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let error = DarterError::io(&source);
        assert_that!(format!("{error}").contains("no such file"), eq(true));
    }
}
