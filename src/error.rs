//! Error taxonomy for the ingestion pipeline.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing or inconsistent configuration. Raised before any work starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Token or ticket exchange rejected by the identity service.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Non-2xx response from a data endpoint.
    #[error("upstream api error: status={status} path={path}")]
    UpstreamApi { status: u16, path: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("storage error: {0}")]
    StorageMessage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Fatal errors end the whole run; everything else skips one unit of work.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Authentication(_))
    }

    /// Errors worth another attempt when bounded retries are enabled.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::UpstreamApi { status, .. } => *status == 429 || *status >= 500,
            Self::Transport(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
