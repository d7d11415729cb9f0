//! Test utilities: an in-memory remote host
//!
//! [`MockHost`] understands exactly the shell commands and transfers the
//! file layer issues, keeps a tiny filesystem, and records every call so
//! tests can assert which strategy served an operation.

use crate::config::ConnectionDescriptor;
use crate::connection::Connector;
use crate::error::{CommandError, CommandFailure, ConnectionStage, RemoteError, TransferProtocol};
use crate::transport::{CommandOutput, ConnectionInfo, Transport, TransportType};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// One recorded interaction with the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// Shell command, as sent
    Command(String),
    /// SCP upload to a path
    ScpWrite(String),
    /// SFTP read of a path
    SftpRead(String),
    /// SFTP removal of a path
    SftpRemove(String),
}

impl Call {
    /// True for shell commands
    pub fn is_command(&self) -> bool {
        matches!(self, Call::Command(_))
    }
}

/// A file on the mock host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockFile {
    /// Raw content
    pub content: Vec<u8>,
    /// Permission bits
    pub mode: u32,
    /// Numeric owner
    pub uid: u32,
    /// Numeric group
    pub gid: u32,
}

const ACCOUNTS: &[(u32, &str)] = &[(0, "root"), (1000, "deploy"), (1001, "www-data")];

#[derive(Debug, Default)]
struct State {
    files: BTreeMap<String, MockFile>,
    calls: Vec<Call>,
    denied: HashSet<String>,
    broken: bool,
    closes: usize,
}

/// In-memory stand-in for a remote host
#[derive(Debug, Clone, Default)]
pub struct MockHost {
    state: Arc<Mutex<State>>,
}

impl MockHost {
    /// Empty host
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a file owned by root
    pub fn put_file(&self, path: &str, content: &str, mode: u32) {
        self.state.lock().files.insert(
            path.to_string(),
            MockFile {
                content: content.as_bytes().to_vec(),
                mode,
                uid: 0,
                gid: 0,
            },
        );
    }

    /// Current state of a file
    pub fn file(&self, path: &str) -> Option<MockFile> {
        self.state.lock().files.get(path).cloned()
    }

    /// Every call made so far
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Number of times `close` was called
    pub fn closes(&self) -> usize {
        self.state.lock().closes
    }

    /// Make every access to `path` fail with permission denied
    ///
    /// `test -e` still answers truthfully.
    pub fn deny(&self, path: &str) {
        self.state.lock().denied.insert(path.to_string());
    }

    /// Make every channel fail before a command can run
    pub fn set_broken(&self, broken: bool) {
        self.state.lock().broken = broken;
    }

    fn command(&self, command: &str, input: Option<&[u8]>) -> Result<CommandOutput> {
        let mut state = self.state.lock();
        state.calls.push(Call::Command(command.to_string()));

        let fail = |code: i32, stderr: String| -> Result<CommandOutput> {
            Err(RemoteError::Command(CommandError {
                command: command.to_string(),
                failure: CommandFailure::ExitStatus(code),
                stderr,
            }))
        };
        if state.broken {
            return Err(RemoteError::Command(CommandError {
                command: command.to_string(),
                failure: CommandFailure::Channel("channel closed".to_string()),
                stderr: String::new(),
            }));
        }

        let words = split_words(command);
        let mut args: Vec<&str> = words.iter().map(String::as_str).collect();
        if args.first() == Some(&"sudo") {
            args.remove(0);
        }
        let path = match args.iter().position(|a| *a == "tee") {
            Some(tee) => args.get(tee + 1),
            None => args.last(),
        };
        let path = match path {
            Some(path) if path.starts_with('/') => path.to_string(),
            _ => return fail(2, format!("mock: unsupported command `{}`", command)),
        };
        let probing = matches!(args.as_slice(), ["test", "-e", _]);
        if state.denied.contains(&path) && !probing {
            return fail(1, format!("{}: Permission denied\n", path));
        }
        let missing = format!("{}: No such file or directory\n", path);

        match args.as_slice() {
            ["cat", "/dev/stdin", "|", "sudo", "tee", _, ">", "/dev/null"] => {
                let content = input.unwrap_or_default().to_vec();
                state
                    .files
                    .entry(path)
                    .and_modify(|f| f.content = content.clone())
                    .or_insert(MockFile {
                        content,
                        mode: 0o644,
                        uid: 0,
                        gid: 0,
                    });
                Ok(CommandOutput::default())
            }
            ["cat", _] => match state.files.get(&path) {
                Some(file) => Ok(CommandOutput {
                    stdout: Bytes::from(file.content.clone()),
                    stderr: String::new(),
                }),
                None => fail(1, missing),
            },
            ["test", "-e", _] | ["test", "-f", _] => {
                if state.files.contains_key(&path) {
                    Ok(CommandOutput::default())
                } else {
                    fail(1, String::new())
                }
            }
            ["test", "!", "-f", _] => {
                if state.files.contains_key(&path) {
                    fail(1, String::new())
                } else {
                    Ok(CommandOutput::default())
                }
            }
            ["rm", _] => match state.files.remove(&path) {
                Some(_) => Ok(CommandOutput::default()),
                None => fail(1, missing),
            },
            ["chmod", mode, _] => {
                let mode = match u32::from_str_radix(mode, 8) {
                    Ok(mode) => mode,
                    Err(_) => return fail(1, format!("chmod: invalid mode: '{}'\n", mode)),
                };
                match state.files.get_mut(&path) {
                    Some(file) => {
                        file.mode = mode;
                        Ok(CommandOutput::default())
                    }
                    None => fail(1, missing),
                }
            }
            ["chown", who, _] | ["chgrp", who, _] => {
                let id = match lookup_account(who) {
                    Some(id) => id,
                    None => return fail(1, format!("invalid user or group: '{}'\n", who)),
                };
                let owner = args[0] == "chown";
                match state.files.get_mut(&path) {
                    Some(file) if owner => {
                        file.uid = id;
                        Ok(CommandOutput::default())
                    }
                    Some(file) => {
                        file.gid = id;
                        Ok(CommandOutput::default())
                    }
                    None => fail(1, missing),
                }
            }
            ["stat", "-c", format, _] => {
                let file = match state.files.get(&path) {
                    Some(file) => file,
                    None => return fail(1, format!("stat: {}", missing)),
                };
                let value = match *format {
                    "%a" => format!("{:o}", file.mode),
                    "%u" => file.uid.to_string(),
                    "%g" => file.gid.to_string(),
                    "%U" => account_name(file.uid),
                    "%G" => account_name(file.gid),
                    other => return fail(1, format!("mock: unsupported format {}\n", other)),
                };
                Ok(CommandOutput {
                    stdout: Bytes::from(format!("{}\n", value)),
                    stderr: String::new(),
                })
            }
            _ => fail(2, format!("mock: unsupported command `{}`", command)),
        }
    }

    fn transfer_guard(&self, state: &State, protocol: TransferProtocol, path: &str) -> Result<()> {
        if state.broken {
            return Err(RemoteError::transfer(protocol, path, "channel closed"));
        }
        if state.denied.contains(path) {
            return Err(RemoteError::transfer(protocol, path, "permission denied"));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockHost {
    async fn run_command(&self, command: &str) -> Result<CommandOutput> {
        self.command(command, None)
    }

    async fn run_command_with_input(&self, command: &str, input: Bytes) -> Result<CommandOutput> {
        self.command(command, Some(&input[..]))
    }

    async fn scp_write(&self, path: &str, mode: i32, content: Bytes) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::ScpWrite(path.to_string()));
        self.transfer_guard(&state, TransferProtocol::Scp, path)?;

        // scp only applies the mode when it creates the file.
        let content = content.to_vec();
        state
            .files
            .entry(path.to_string())
            .and_modify(|f| f.content = content.clone())
            .or_insert(MockFile {
                content,
                mode: mode as u32,
                uid: 1000,
                gid: 1000,
            });
        Ok(())
    }

    async fn sftp_read(&self, path: &str) -> Result<Bytes> {
        let mut state = self.state.lock();
        state.calls.push(Call::SftpRead(path.to_string()));
        self.transfer_guard(&state, TransferProtocol::Sftp, path)?;
        match state.files.get(path) {
            Some(file) => Ok(Bytes::from(file.content.clone())),
            None => Err(RemoteError::NotFound(path.to_string())),
        }
    }

    async fn sftp_remove(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::SftpRemove(path.to_string()));
        self.transfer_guard(&state, TransferProtocol::Sftp, path)?;
        match state.files.remove(path) {
            Some(_) => Ok(()),
            None => Err(RemoteError::NotFound(path.to_string())),
        }
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: "mock".to_string(),
            port: 22,
            username: "mock".to_string(),
            transport_type: TransportType::Local,
        }
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().closes += 1;
        Ok(())
    }
}

/// Connector handing out clients of one shared [`MockHost`]
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    host: MockHost,
    dials: Arc<Mutex<Vec<(String, Option<String>)>>>,
    refuse: Arc<Mutex<bool>>,
    delay: Option<Duration>,
}

impl MockConnector {
    /// Connector for `host`
    pub fn new(host: MockHost) -> Self {
        Self {
            host,
            ..Default::default()
        }
    }

    /// Sleep this long inside every dial
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The host every client talks to
    pub fn host(&self) -> &MockHost {
        &self.host
    }

    /// `(target, proxy)` addresses of every dial attempt
    pub fn dials(&self) -> Vec<(String, Option<String>)> {
        self.dials.lock().clone()
    }

    /// Make subsequent dials fail
    pub fn refuse(&self, refuse: bool) {
        *self.refuse.lock() = refuse;
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Client = MockHost;

    async fn connect(
        &self,
        target: &ConnectionDescriptor,
        proxy: Option<&ConnectionDescriptor>,
    ) -> Result<MockHost> {
        self.dials
            .lock()
            .push((target.address(), proxy.map(ConnectionDescriptor::address)));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if *self.refuse.lock() {
            return Err(RemoteError::connection(
                ConnectionStage::Target,
                target.address(),
                "connection refused",
            ));
        }
        Ok(self.host.clone())
    }
}

fn lookup_account(who: &str) -> Option<u32> {
    match who.parse::<u32>() {
        Ok(id) => Some(id),
        Err(_) => ACCOUNTS
            .iter()
            .find(|(_, name)| *name == who)
            .map(|(id, _)| *id),
    }
}

fn account_name(id: u32) -> String {
    ACCOUNTS
        .iter()
        .find(|(account, _)| *account == id)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| id.to_string())
}

// Minimal POSIX word splitting: single quotes and backslash escapes.
fn split_words(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                quoted = !quoted;
                in_word = true;
            }
            '\\' if !quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_words_handles_escaped_quotes() {
        assert_eq!(
            split_words(r"sudo cat '/tmp/it'\''s here'"),
            vec!["sudo", "cat", "/tmp/it's here"]
        );
    }

    #[tokio::test]
    async fn test_stat_reports_octal_mode() {
        let host = MockHost::new();
        host.put_file("/etc/motd", "hi", 0o755);
        let out = host.run_command("stat -c %a '/etc/motd'").await.unwrap();
        assert_eq!(out.stdout_lossy(), "755\n");
    }

    #[tokio::test]
    async fn test_unknown_command_fails() {
        let host = MockHost::new();
        let err = host.run_command("uname -a").await.unwrap_err();
        assert_eq!(err.as_command().unwrap().exit_status(), Some(2));
    }
}
