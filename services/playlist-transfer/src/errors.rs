//!
//! src/errors.rs  Andrew Belles  Oct 2nd, 2025
//!
//! Defines enums and methods of error conversion
//! for errors the transfer service uses
//!
//!

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("config error: {0}")]
    Config(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("unexpected status {status} from {path}")]
    Status { status: u16, path: String },
    #[error("too many retries for {0}")]
    RetriesExhausted(String),
    #[error("credential error: {0}")]
    Credential(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("csv error: {0}")]
    Csv(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error)
}

impl TransferError {
    /// Errors that end a whole job rather than a single track
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransferError::Credential(_))
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self { TransferError::Http(e.to_string()) }
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self { TransferError::Parse(e.to_string()) }
}

impl From<csv::Error> for TransferError {
    fn from(e: csv::Error) -> Self { TransferError::Csv(e.to_string()) }
}
