//! Error types for remote file management

use remote_file_ssh::RemoteError;
use thiserror::Error;

/// Main error type for remote file operations
#[derive(Debug, Error)]
pub enum FileError {
    /// Connection, command or transfer failure
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Neither the file nor the provider configures a connection
    #[error("No connection configured for {0}: set `conn` on the file or the provider")]
    MissingConnection(String),

    /// The file target is inconsistent
    #[error("Invalid file target: {0}")]
    InvalidTarget(String),

    /// Configuration could not be parsed
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl FileError {
    /// True if the remote path does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Remote(e) if e.is_not_found())
    }
}
