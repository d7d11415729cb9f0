//! File operations over a connected transport
//!
//! SCP and SFTP run as the login user only, so whenever elevation is
//! requested every operation falls back to a `sudo`-prefixed shell command.
//! Ownership and mode changes always go through the shell: neither protocol
//! can express them.

use crate::error::RemoteError;
use crate::transport::Transport;
use crate::Result;
use bytes::Bytes;
use tracing::debug;

/// How an operation reaches the remote file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Whole-file SCP upload
    BulkCopy,
    /// SFTP
    NativeTransfer,
    /// Shell command, `sudo`-prefixed when elevated
    ShellCommand,
}

/// Operations the file layer performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperation {
    /// Replace file content
    Write,
    /// Read file content
    Read,
    /// Remove the file
    Delete,
    /// Change permission bits
    Chmod,
    /// Change owner
    Chown,
    /// Change group
    Chgrp,
    /// Test for a regular file
    Exists,
    /// Read mode or ownership
    Stat,
}

/// Pick the strategy for `operation`; `sudo` forces the shell
pub fn select_strategy(operation: FileOperation, sudo: bool) -> Strategy {
    match (operation, sudo) {
        (FileOperation::Write, false) => Strategy::BulkCopy,
        (FileOperation::Read, false) | (FileOperation::Delete, false) => Strategy::NativeTransfer,
        _ => Strategy::ShellCommand,
    }
}

/// Quote `value` as a single POSIX shell word
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Parse an octal permission string such as `"0644"`
pub fn parse_mode(permissions: &str) -> Result<i32> {
    let valid = (1..=4).contains(&permissions.len())
        && permissions.bytes().all(|b| (b'0'..=b'7').contains(&b));
    if !valid {
        return Err(RemoteError::Configuration(format!(
            "invalid permissions {:?}: expected 1 to 4 octal digits",
            permissions
        )));
    }
    i32::from_str_radix(permissions, 8)
        .map_err(|e| RemoteError::Configuration(format!("invalid permissions {:?}: {}", permissions, e)))
}

/// Normalize `stat -c %a` output to four digits
///
/// `"644\n"` becomes `"0644"`; four-digit modes such as `"1755"` are kept.
pub fn canonical_permissions(raw: &str) -> String {
    let permissions = raw.replace('\n', "");
    if (1..4).contains(&permissions.len()) {
        format!("0{}", permissions)
    } else {
        permissions
    }
}

/// File operations on one transport
pub struct FileOps<'a, T: Transport + ?Sized> {
    transport: &'a T,
    sudo: bool,
}

impl<'a, T: Transport + ?Sized> FileOps<'a, T> {
    /// Operations over `transport`, elevated with sudo when `sudo` is set
    pub fn new(transport: &'a T, sudo: bool) -> Self {
        Self { transport, sudo }
    }

    /// Whether operations are elevated
    pub fn sudo(&self) -> bool {
        self.sudo
    }

    fn strategy(&self, operation: FileOperation, path: &str) -> Strategy {
        let strategy = select_strategy(operation, self.sudo);
        debug!("{:?} {} via {:?}", operation, path, strategy);
        strategy
    }

    fn shell(&self, command: String) -> String {
        if self.sudo {
            format!("sudo {}", command)
        } else {
            command
        }
    }

    /// Replace the content of `path`
    ///
    /// SCP applies `permissions` only when it creates the file; callers that
    /// need the mode enforced follow up with [`chmod`](Self::chmod).
    pub async fn write(&self, path: &str, content: &str, permissions: &str) -> Result<()> {
        match self.strategy(FileOperation::Write, path) {
            Strategy::BulkCopy => {
                let mode = parse_mode(permissions)?;
                self.transport
                    .scp_write(path, mode, Bytes::copy_from_slice(content.as_bytes()))
                    .await
            }
            _ => {
                // tee would echo the content back; discard it so nothing backs up.
                let command = format!("cat /dev/stdin | sudo tee {} > /dev/null", shell_quote(path));
                self.transport
                    .run_command_with_input(&command, Bytes::copy_from_slice(content.as_bytes()))
                    .await
                    .map(|_| ())
            }
        }
    }

    /// Read the content of `path`
    pub async fn read(&self, path: &str) -> Result<String> {
        let content = match self.strategy(FileOperation::Read, path) {
            Strategy::NativeTransfer => self.transport.sftp_read(path).await?,
            _ => {
                let command = format!("sudo cat {}", shell_quote(path));
                match self.transport.run_command(&command).await {
                    Ok(output) => output.stdout,
                    Err(e) => return Err(self.classify_missing(path, e).await),
                }
            }
        };
        Ok(String::from_utf8_lossy(&content).into_owned())
    }

    /// Remove `path`
    pub async fn delete(&self, path: &str) -> Result<()> {
        match self.strategy(FileOperation::Delete, path) {
            Strategy::NativeTransfer => self.transport.sftp_remove(path).await,
            _ => {
                let command = format!("sudo rm {}", shell_quote(path));
                match self.transport.run_command(&command).await {
                    Ok(_) => Ok(()),
                    Err(e) => Err(self.classify_missing(path, e).await),
                }
            }
        }
    }

    /// Set the permission bits of `path`
    pub async fn chmod(&self, path: &str, permissions: &str) -> Result<()> {
        parse_mode(permissions)?;
        self.strategy(FileOperation::Chmod, path);
        let command = self.shell(format!("chmod {} {}", permissions, shell_quote(path)));
        self.transport.run_command(&command).await.map(|_| ())
    }

    /// Set the owner of `path`, by id or name
    pub async fn chown(&self, path: &str, owner: &str) -> Result<()> {
        self.strategy(FileOperation::Chown, path);
        let command = self.shell(format!("chown {} {}", shell_quote(owner), shell_quote(path)));
        self.transport.run_command(&command).await.map(|_| ())
    }

    /// Set the group of `path`, by id or name
    pub async fn chgrp(&self, path: &str, group: &str) -> Result<()> {
        self.strategy(FileOperation::Chgrp, path);
        let command = self.shell(format!("chgrp {} {}", shell_quote(group), shell_quote(path)));
        self.transport.run_command(&command).await.map(|_| ())
    }

    /// Whether `path` is a regular file
    ///
    /// A failed `test -f` is confirmed with `test ! -f`, so a path that
    /// cannot be inspected (permission denied, broken channel) is an error
    /// rather than a silent `false`.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        self.strategy(FileOperation::Exists, path);
        let check = self.shell(format!("test -f {}", shell_quote(path)));
        match self.transport.run_command(&check).await {
            Ok(_) => Ok(true),
            Err(RemoteError::Command(e)) if e.exited() => {
                let confirm = self.shell(format!("test ! -f {}", shell_quote(path)));
                self.transport.run_command(&confirm).await.map(|_| false)
            }
            Err(e) => Err(e),
        }
    }

    /// Permission bits of `path` as four octal digits
    pub async fn permissions(&self, path: &str) -> Result<String> {
        self.stat(path, "%a").await.map(|raw| canonical_permissions(&raw))
    }

    /// Numeric owner of `path`
    pub async fn owner(&self, path: &str) -> Result<String> {
        self.stat(path, "%u").await
    }

    /// Numeric group of `path`
    pub async fn group(&self, path: &str) -> Result<String> {
        self.stat(path, "%g").await
    }

    /// Owner name of `path`
    pub async fn owner_name(&self, path: &str) -> Result<String> {
        self.stat(path, "%U").await
    }

    /// Group name of `path`
    pub async fn group_name(&self, path: &str) -> Result<String> {
        self.stat(path, "%G").await
    }

    async fn stat(&self, path: &str, format: &str) -> Result<String> {
        self.strategy(FileOperation::Stat, path);
        let command = self.shell(format!("stat -c {} {}", format, shell_quote(path)));
        let output = self.transport.run_command(&command).await?;
        Ok(output.stdout_lossy().replace('\n', ""))
    }

    // A failed elevated command only means "not found" if the path really
    // is absent; ask with `test -e` instead of parsing stderr.
    async fn classify_missing(&self, path: &str, error: RemoteError) -> RemoteError {
        let exited = error.as_command().map_or(false, |e| e.exited());
        if !exited {
            return error;
        }
        let check = format!("sudo test -e {}", shell_quote(path));
        match self.transport.run_command(&check).await {
            Err(RemoteError::Command(e)) if e.exited() => RemoteError::NotFound(path.to_string()),
            _ => error,
        }
    }
}

#[cfg(test)]
mod tests;
