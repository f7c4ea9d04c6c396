use thiserror::Error;

/// Errors surfaced by the session, streaming and recording core.
///
/// Every variant carries a message meant for a person: most failures are
/// recoverable by a user action (grant permission, check the backend).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Not connected to the relay")]
    NotConnected,
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Capture error: {0}")]
    Capture(String),
    #[error("Session error: {0}")]
    Session(String),
    #[error("Stream error: {0}")]
    Stream(String),
    #[error("Recording error: {0}")]
    Recording(String),
    #[error("No frames received yet; wait for the stream to start before recording")]
    NoFrames,
    #[error("Encoding error: {0}")]
    Encoding(String),
    #[error("Upload error: {0}")]
    Upload(String),
    #[error("Directory error: {0}")]
    Directory(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(String),
}

impl RelayError {
    /// Whether the auto-reconnect loop can be expected to clear this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::Transport(_) | RelayError::NotConnected)
    }
}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        RelayError::Io(e.to_string())
    }
}

impl From<image::ImageError> for RelayError {
    fn from(e: image::ImageError) -> Self {
        RelayError::Encoding(e.to_string())
    }
}
