use thiserror::Error;

/// Failure taxonomy for the synchronization core.
///
/// Connection loss and join refusals are recoverable and end up as store
/// state; only a failed room fetch is fatal for an open view.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("join refused: {0}")]
    Join(String),

    #[error("room fetch failed: {0}")]
    Fetch(String),

    #[error("transport closed: {0}")]
    Transport(String),

    #[error("malformed frame: {0}")]
    Protocol(String),
}

impl SyncError {
    /// A recoverable error is shown as a dismissible notice; anything else
    /// replaces the room view.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SyncError::Fetch(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            SyncError::Connection(err.to_string())
        } else {
            SyncError::Fetch(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
