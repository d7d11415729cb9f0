//! # Remote File SSH
//!
//! Pooled SSH connections and the file operations built on them.
//!
//! Connections are described by [`ConnectionOptions`], validated into a
//! [`ConnectionDescriptor`] and shared through a [`ConnectionPool`] keyed by
//! [`ConnectionIdentity`]. [`FileOps`] reads, writes and inspects remote
//! files over SCP, SFTP or `sudo` shell commands.
//!
//! Unix only: agent probing and proxy tunnels use Unix domain sockets.

#![warn(missing_docs)]

/// Connection options and descriptor building
pub mod config;

/// SSH connection management
pub mod connection;

/// SSH-specific error types
pub mod error;

/// File operations and transport strategy selection
pub mod file_ops;

/// Connection identity hashing
pub mod identity;

/// Connection pool and admission control
pub mod pool;

/// In-memory host for tests
pub mod test_utils;

/// Transport abstraction
pub mod transport;

/// Proxy tunnel pump
pub mod tunnel;

pub use config::{build_connection, build_proxy_connection, AuthMethod, ConnectionDescriptor, ConnectionOptions};
pub use connection::{Connector, SshClient, SshConnector};
pub use error::{CommandError, CommandFailure, ConnectionStage, KeySource, RemoteError, TransferProtocol};
pub use file_ops::{select_strategy, FileOperation, FileOps, Strategy};
pub use identity::ConnectionIdentity;
pub use pool::{ConnectionPool, PoolConfig, PoolLease, PoolStats};
pub use transport::{CommandOutput, ConnectionInfo, Transport, TransportType};

/// Result type for remote operations
pub type Result<T> = std::result::Result<T, RemoteError>;
