//! Error taxonomy for store, pool and lock operations.
//!
//! Configuration loading and the CLI use `anyhow`; everything that talks to
//! the engine returns [`StoreError`] so callers can tell a dead endpoint from a
//! malformed record.

use thiserror::Error;

/// Errors surfaced by the store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Engine unreachable, connect failure, or pool checkout timed out.
    #[error("connection error: {0}")]
    Connection(String),

    /// The engine answered but rejected the command.
    #[error("{command} failed: {message}")]
    Command {
        command: &'static str,
        message: String,
    },

    /// A value could not be encoded, or stored bytes could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// No serializer is registered under this name.
    #[error("unknown serializer: {0}")]
    UnknownSerializer(String),

    /// The endpoint URI could not be parsed.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub(crate) fn command(command: &'static str, message: impl Into<String>) -> Self {
        Self::Command {
            command,
            message: message.into(),
        }
    }

    /// `true` for errors caused by the transport rather than the data.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<fred::error::Error> for StoreError {
    fn from(err: fred::error::Error) -> Self {
        use fred::error::ErrorKind;

        match err.kind() {
            ErrorKind::IO | ErrorKind::Canceled | ErrorKind::Timeout | ErrorKind::Tls => {
                Self::Connection(err.details().to_string())
            }
            ErrorKind::Auth => Self::Connection(format!("authentication failed: {}", err.details())),
            _ => Self::Command {
                command: "engine",
                message: err.details().to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for StoreError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_flagged() {
        assert!(StoreError::Connection("refused".into()).is_connection());
        assert!(!StoreError::Serialization("bad".into()).is_connection());
    }

    #[test]
    fn command_error_display() {
        let err = StoreError::command("HGET", "WRONGTYPE");
        assert_eq!(err.to_string(), "HGET failed: WRONGTYPE");
    }

    #[test]
    fn fred_io_error_maps_to_connection() {
        let err: StoreError =
            fred::error::Error::new(fred::error::ErrorKind::IO, "connection refused").into();
        assert!(err.is_connection());
    }

    #[test]
    fn fred_parse_error_maps_to_command() {
        let err: StoreError =
            fred::error::Error::new(fred::error::ErrorKind::Parse, "unexpected frame").into();
        assert!(matches!(err, StoreError::Command { .. }));
    }
}
