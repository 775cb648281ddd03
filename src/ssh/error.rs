//! Forwarding error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForwardError {
    /// Remote host unreachable, handshake failure, rejected host key or timeout
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The local listening port is already bound by someone else
    #[error("Port already in use: {0}")]
    PortInUse(String),

    /// Local bind failure other than a port conflict
    #[error("Bind failed: {0}")]
    Bind(String),

    /// Per connection pair only. Logged, never returned to callers of `start`.
    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("Disconnected")]
    Disconnected,
}

impl ForwardError {
    /// Errors the caller should not retry with unchanged parameters
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ForwardError::Authentication(_) | ForwardError::PortInUse(_) | ForwardError::Key(_)
        )
    }
}

impl From<russh::Error> for ForwardError {
    fn from(err: russh::Error) -> Self {
        ForwardError::Protocol(err.to_string())
    }
}

impl From<russh::keys::Error> for ForwardError {
    fn from(err: russh::keys::Error) -> Self {
        ForwardError::Key(err.to_string())
    }
}
