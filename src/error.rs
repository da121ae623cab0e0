use std::path::PathBuf;

use thiserror::Error;

/// Failure of an outbound backend call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response body: {0}")]
    MalformedBody(String),

    /// The caller gave up on the request. Never shown to the user.
    #[error("request cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TransportError::MalformedBody(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

/// Failure to turn a picked file into an uploadable image.
#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is not a supported image")]
    UnsupportedFormat(PathBuf),
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum TimelineError {
    #[error("cannot replace the last entry of an empty timeline")]
    EmptyTimeline,
}
