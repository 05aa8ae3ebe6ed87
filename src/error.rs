use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("storage failure on {}: {source}", path.display())]
    StorageFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed record {record:?}: {reason}")]
    MalformedRecord { record: String, reason: String },

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("invalid instrument identifier: {0:?}")]
    InvalidInstrument(String),

    #[error("inconsistent observation for {instrument}: {reason}")]
    InvalidObservation { instrument: String, reason: String },
}

impl WatchError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        WatchError::StorageFailure {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(record: &str, reason: impl Into<String>) -> Self {
        WatchError::MalformedRecord {
            record: record.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WatchError>;
