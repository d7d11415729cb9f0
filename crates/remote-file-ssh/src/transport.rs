//! Transport abstraction shared by the SSH client and test doubles

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Primitive remote operations the file layer is composed from
///
/// Every command runs on its own fresh channel; nothing is reused between
/// calls. Implementations report a non-zero exit as
/// [`RemoteError::Command`](crate::RemoteError::Command) carrying the
/// captured stderr.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run one command and capture its output
    async fn run_command(&self, command: &str) -> Result<CommandOutput>;

    /// Run one command with `input` written to its stdin
    async fn run_command_with_input(&self, command: &str, input: Bytes) -> Result<CommandOutput>;

    /// Copy `content` to `path` with `mode` using SCP
    async fn scp_write(&self, path: &str, mode: i32, content: Bytes) -> Result<()>;

    /// Read the whole file at `path` using SFTP
    async fn sftp_read(&self, path: &str) -> Result<Bytes>;

    /// Remove the file at `path` using SFTP
    async fn sftp_remove(&self, path: &str) -> Result<()>;

    /// Get connection information
    fn connection_info(&self) -> ConnectionInfo;

    /// Close the underlying connection; called exactly once, by the pool
    async fn close(&self) -> Result<()>;
}

/// Connection information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Username
    pub username: String,
    /// Connection type
    pub transport_type: TransportType,
}

/// How the connection reaches its host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportType {
    /// TCP straight to the target
    Direct,
    /// Forwarded through the proxy at this `host:port`
    ProxyJump(String),
    /// In-process double (for testing)
    Local,
}

/// Output of a successful command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Captured standard output
    pub stdout: Bytes,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Stdout decoded as UTF-8, replacing invalid sequences
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}
