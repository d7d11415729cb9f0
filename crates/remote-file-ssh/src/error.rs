//! SSH-specific error types

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Where a private key was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Inline `private_key` option
    Inline,
    /// `private_key_path` option
    File,
    /// `private_key_env_var` option
    EnvVar,
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Inline => f.write_str("private key"),
            KeySource::File => f.write_str("private key file"),
            KeySource::EnvVar => f.write_str("private key env var"),
        }
    }
}

/// Which hop of a connection attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStage {
    /// Dialing or authenticating against the proxy host
    Proxy,
    /// Opening the forwarded channel through the proxy
    Tunnel,
    /// Dialing or authenticating against the target host
    Target,
}

impl fmt::Display for ConnectionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStage::Proxy => f.write_str("proxy"),
            ConnectionStage::Tunnel => f.write_str("tunnel"),
            ConnectionStage::Target => f.write_str("target"),
        }
    }
}

/// File protocol that reported a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferProtocol {
    /// SCP bulk copy
    Scp,
    /// SFTP
    Sftp,
}

impl fmt::Display for TransferProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferProtocol::Scp => f.write_str("scp"),
            TransferProtocol::Sftp => f.write_str("sftp"),
        }
    }
}

/// Why a remote command did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandFailure {
    /// The command ran and exited with a non-zero status
    #[error("Process exited with status {0}")]
    ExitStatus(i32),

    /// The command could not be started or the channel broke mid-run
    #[error("{0}")]
    Channel(String),
}

/// A failed remote command, with everything needed to diagnose it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    /// Command text as sent to the remote shell
    pub command: String,
    /// Underlying failure
    pub failure: CommandFailure,
    /// Captured standard error
    pub stderr: String,
}

impl CommandError {
    /// True when the command ran to completion and reported failure
    pub fn exited(&self) -> bool {
        matches!(self.failure, CommandFailure::ExitStatus(_))
    }

    /// Exit status, if the command ran to completion
    pub fn exit_status(&self) -> Option<i32> {
        match self.failure {
            CommandFailure::ExitStatus(code) => Some(code),
            CommandFailure::Channel(_) => None,
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "`{}`\n  {}\n  {}",
            self.command,
            self.failure,
            self.stderr.trim_end_matches('\n')
        )
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.failure)
    }
}

/// Errors raised by connection building, transports, file operations and the pool
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Missing or invalid connection parameters
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A local file (key file) could not be read
    #[error("Couldn't read {}: {source}", path.display())]
    Io {
        /// File that was being read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Key material could not be parsed
    #[error("Couldn't create a ssh client config from {origin}: {message}")]
    Credential {
        /// Option the key came from
        origin: KeySource,
        /// Parser message
        message: String,
    },

    /// The local SSH agent socket is not reachable
    #[error("Couldn't connect to SSH agent: {0}")]
    AgentUnavailable(String),

    /// Dial, handshake or authentication failure
    #[error("Couldn't establish a connection to the {stage} {address}: {message}")]
    Connection {
        /// Hop that failed
        stage: ConnectionStage,
        /// `host:port` of the hop
        address: String,
        /// Underlying cause
        message: String,
    },

    /// Remote command failure
    #[error("{0}")]
    Command(#[from] CommandError),

    /// The remote path does not exist
    #[error("Remote path not found: {0}")]
    NotFound(String),

    /// SCP or SFTP failure other than a missing path
    #[error("{protocol} transfer failed for {path}: {message}")]
    Transfer {
        /// Protocol in use
        protocol: TransferProtocol,
        /// Remote path
        path: String,
        /// Underlying cause
        message: String,
    },

    /// Release called for an identity with no active sessions
    #[error("No active session to release for connection {0}")]
    NotAcquired(String),
}

impl RemoteError {
    /// Shorthand for a connection failure
    pub fn connection(
        stage: ConnectionStage,
        address: impl Into<String>,
        message: impl fmt::Display,
    ) -> Self {
        Self::Connection {
            stage,
            address: address.into(),
            message: message.to_string(),
        }
    }

    /// Shorthand for a transfer failure
    pub fn transfer(protocol: TransferProtocol, path: &str, message: impl fmt::Display) -> Self {
        Self::Transfer {
            protocol,
            path: path.to_string(),
            message: message.to_string(),
        }
    }

    /// The command error, if this is one
    pub fn as_command(&self) -> Option<&CommandError> {
        match self {
            Self::Command(err) => Some(err),
            _ => None,
        }
    }

    /// True if this is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_display() {
        let err = CommandError {
            command: "sudo rm '/tmp/x'".to_string(),
            failure: CommandFailure::ExitStatus(1),
            stderr: "rm: cannot remove '/tmp/x': Permission denied\n".to_string(),
        };

        assert_eq!(
            err.to_string(),
            "`sudo rm '/tmp/x'`\n  Process exited with status 1\n  rm: cannot remove '/tmp/x': Permission denied"
        );
        assert!(err.exited());
        assert_eq!(err.exit_status(), Some(1));
    }

    #[test]
    fn test_channel_failure_is_not_an_exit() {
        let err = CommandError {
            command: "test -f '/tmp/x'".to_string(),
            failure: CommandFailure::Channel("channel closed".to_string()),
            stderr: String::new(),
        };

        assert!(!err.exited());
        assert_eq!(err.exit_status(), None);
    }

    #[test]
    fn test_connection_error_names_stage() {
        let err = RemoteError::connection(ConnectionStage::Proxy, "bastion:22", "refused");
        assert_eq!(
            err.to_string(),
            "Couldn't establish a connection to the proxy bastion:22: refused"
        );
    }

    #[test]
    fn test_credential_error_names_source() {
        let err = RemoteError::Credential {
            origin: KeySource::EnvVar,
            message: "bad key".to_string(),
        };
        assert!(err.to_string().contains("private key env var"));
    }
}
