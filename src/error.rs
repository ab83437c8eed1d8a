//! Error types for the relay.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Blank payload or unusable destination. Callers report "not queued".
    #[error("Validation error: {0}")]
    Validation(String),

    /// A stored record could not be parsed. Skipped by the queue store.
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// A durable write did not complete.
    #[error("Store write failed for '{destination}': {source}")]
    StoreWrite {
        destination: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn store_write(destination: &str, source: std::io::Error) -> Self {
        Error::StoreWrite {
            destination: destination.to_string(),
            source,
        }
    }

    /// True for errors the boundary reports as "not queued" rather than a fault.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}
