//! # Remote File
//!
//! Manage files on hosts reachable over SSH, directly or through a jump
//! host. Connections are pooled per credential set and capped at
//! `max_sessions` concurrent sessions each.
//!
//! ```no_run
//! use remote_file::{FileTarget, ProviderConfig, RemoteFiles};
//! use remote_file::ssh::ConnectionOptions;
//!
//! # async fn example() -> remote_file::Result<()> {
//! let config = ProviderConfig::default()
//!     .with_conn(ConnectionOptions::new("remotehost", "root").with_agent(true));
//! let files = RemoteFiles::new(config)?;
//!
//! let state = files.apply(&FileTarget::new("/etc/motd", "hello\n")).await?;
//! assert_eq!(state.permissions, "0644");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub use remote_file_ssh as ssh;

/// Error types for remote file management
pub mod error;

/// Provider and file-target configuration
pub mod config;

/// Pooled file operations
pub mod files;

pub use config::{FileTarget, ProviderConfig};
pub use error::FileError;
pub use files::{FileState, RemoteFiles};

/// Result type alias for remote file operations
pub type Result<T> = std::result::Result<T, FileError>;
