//! SSH connection management
//!
//! [`SshClient`] wraps a blocking libssh2 session. Every call hops onto the
//! blocking thread pool so the async pool and file layers never stall the
//! runtime while a channel is in flight.

use crate::config::{AuthMethod, ConnectionDescriptor};
use crate::error::{CommandError, CommandFailure, ConnectionStage, RemoteError, TransferProtocol};
use crate::transport::{CommandOutput, ConnectionInfo, Transport, TransportType};
use crate::tunnel::Tunnel;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use ssh2::{Channel, ErrorCode, Session, Sftp};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::path::Path;
use tracing::{debug, info, warn};

// libssh2 SFTP status codes for a missing file or directory.
const SFTP_NO_SUCH_FILE: i32 = 2;
const SFTP_NO_SUCH_PATH: i32 = 10;

/// Creates transports for the pool
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Transport this connector produces
    type Client: Transport + 'static;

    /// Dial and authenticate `target`, through `proxy` when given
    async fn connect(
        &self,
        target: &ConnectionDescriptor,
        proxy: Option<&ConnectionDescriptor>,
    ) -> Result<Self::Client>;
}

/// Connector producing real [`SshClient`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    type Client = SshClient;

    async fn connect(
        &self,
        target: &ConnectionDescriptor,
        proxy: Option<&ConnectionDescriptor>,
    ) -> Result<SshClient> {
        match proxy {
            Some(proxy) => SshClient::connect_via_proxy(target, proxy).await,
            None => SshClient::connect(target).await,
        }
    }
}

/// An authenticated SSH session, optionally tunnelled through a proxy
pub struct SshClient {
    session: Session,
    info: ConnectionInfo,
    tunnel: Mutex<Option<Tunnel>>,
}

impl std::fmt::Debug for SshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient").field("info", &self.info).finish()
    }
}

impl SshClient {
    /// Dial and authenticate directly against `target`
    pub async fn connect(target: &ConnectionDescriptor) -> Result<Self> {
        let target = target.clone();
        let address = target.address();
        blocking(
            move || {
                let stream = dial(&target, ConnectionStage::Target)?;
                let session = establish(&target, ConnectionStage::Target, |session| {
                    session.set_tcp_stream(stream)
                })?;
                info!("Connected to {}@{}", target.user(), target.address());
                Ok(Self {
                    session,
                    info: info_for(&target, TransportType::Direct),
                    tunnel: Mutex::new(None),
                })
            },
            |message| RemoteError::connection(ConnectionStage::Target, address, message),
        )
        .await
    }

    /// Authenticate against `proxy`, then reach `target` through a forwarded channel
    pub async fn connect_via_proxy(
        target: &ConnectionDescriptor,
        proxy: &ConnectionDescriptor,
    ) -> Result<Self> {
        let target = target.clone();
        let proxy = proxy.clone();
        let address = target.address();
        blocking(
            move || {
                let stream = dial(&proxy, ConnectionStage::Proxy)?;
                let proxy_session = establish(&proxy, ConnectionStage::Proxy, |session| {
                    session.set_tcp_stream(stream)
                })?;
                debug!("Connected to proxy {}", proxy.address());

                let tunnel_error =
                    |e: &dyn std::fmt::Display| RemoteError::connection(ConnectionStage::Tunnel, target.address(), e);
                let channel = proxy_session
                    .channel_direct_tcpip(target.host(), target.port(), None)
                    .map_err(|e| tunnel_error(&e))?;
                let (local, remote) = UnixStream::pair().map_err(|e| tunnel_error(&e))?;
                let tunnel = Tunnel::spawn(proxy_session, channel, remote, target.address())
                    .map_err(|e| tunnel_error(&e))?;

                let session = match establish(&target, ConnectionStage::Target, |session| {
                    session.set_tcp_stream(local)
                }) {
                    Ok(session) => session,
                    Err(e) => {
                        tunnel.shutdown();
                        return Err(e);
                    }
                };

                info!(
                    "Connected to {}@{} via {}",
                    target.user(),
                    target.address(),
                    proxy.address()
                );
                Ok(Self {
                    session,
                    info: info_for(&target, TransportType::ProxyJump(proxy.address())),
                    tunnel: Mutex::new(Some(tunnel)),
                })
            },
            |message| RemoteError::connection(ConnectionStage::Target, address, message),
        )
        .await
    }

    /// Open an SCP upload channel for a file of `size` bytes
    ///
    /// Blocking; callers on the runtime go through [`Transport::scp_write`].
    pub fn open_bulk_copy(&self, path: &str, mode: i32, size: u64) -> Result<Channel> {
        self.session
            .scp_send(Path::new(path), mode, size, None)
            .map_err(|e| RemoteError::transfer(TransferProtocol::Scp, path, e))
    }

    /// Open an SFTP subsystem on a new channel
    ///
    /// Blocking; callers on the runtime go through [`Transport::sftp_read`].
    pub fn open_file_transfer(&self) -> Result<Sftp> {
        self.session
            .sftp()
            .map_err(|e| RemoteError::transfer(TransferProtocol::Sftp, "", e))
    }

    fn exec(&self, command: &str, input: Option<&[u8]>) -> Result<CommandOutput> {
        let channel_failure = |message: String, stderr: String| {
            RemoteError::Command(CommandError {
                command: command.to_string(),
                failure: CommandFailure::Channel(message),
                stderr,
            })
        };

        // The channel is freed when dropped, on every path out of here.
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| channel_failure(e.to_string(), String::new()))?;
        channel
            .exec(command)
            .map_err(|e| channel_failure(e.to_string(), String::new()))?;

        if let Some(input) = input {
            channel
                .write_all(input)
                .map_err(|e| channel_failure(e.to_string(), String::new()))?;
        }
        channel
            .send_eof()
            .map_err(|e| channel_failure(e.to_string(), String::new()))?;

        let mut stdout = Vec::new();
        channel
            .read_to_end(&mut stdout)
            .map_err(|e| channel_failure(e.to_string(), String::new()))?;
        let mut stderr = String::new();
        if let Err(e) = channel.stderr().read_to_string(&mut stderr) {
            debug!("Couldn't read stderr of `{}`: {}", command, e);
        }

        channel
            .wait_close()
            .map_err(|e| channel_failure(e.to_string(), stderr.clone()))?;
        let status = channel
            .exit_status()
            .map_err(|e| channel_failure(e.to_string(), stderr.clone()))?;

        if status != 0 {
            return Err(RemoteError::Command(CommandError {
                command: command.to_string(),
                failure: CommandFailure::ExitStatus(status),
                stderr,
            }));
        }

        Ok(CommandOutput {
            stdout: Bytes::from(stdout),
            stderr,
        })
    }

    fn scp_write_blocking(&self, path: &str, mode: i32, content: &[u8]) -> Result<()> {
        let scp_error = |e: &dyn std::fmt::Display| RemoteError::transfer(TransferProtocol::Scp, path, e);
        let mut channel = self.open_bulk_copy(path, mode, content.len() as u64)?;
        channel.write_all(content).map_err(|e| scp_error(&e))?;
        channel.send_eof().map_err(|e| scp_error(&e))?;
        channel.wait_eof().map_err(|e| scp_error(&e))?;
        channel.close().map_err(|e| scp_error(&e))?;
        channel.wait_close().map_err(|e| scp_error(&e))?;
        Ok(())
    }

    fn sftp_read_blocking(&self, path: &str) -> Result<Bytes> {
        let sftp = self.open_file_transfer()?;
        let mut file = sftp.open(Path::new(path)).map_err(|e| sftp_error(path, e))?;
        let mut content = Vec::new();
        file.read_to_end(&mut content)
            .map_err(|e| RemoteError::transfer(TransferProtocol::Sftp, path, e))?;
        Ok(Bytes::from(content))
    }

    fn sftp_remove_blocking(&self, path: &str) -> Result<()> {
        let sftp = self.open_file_transfer()?;
        sftp.unlink(Path::new(path)).map_err(|e| sftp_error(path, e))
    }

    fn address(&self) -> String {
        format!("{}:{}", self.info.host, self.info.port)
    }
}

#[async_trait]
impl Transport for SshClient {
    async fn run_command(&self, command: &str) -> Result<CommandOutput> {
        debug!("Running `{}` on {}", command, self.address());
        let command_text = command.to_string();
        blocking_ref(
            self,
            move |client| client.exec(&command_text, None),
            command_join_error(command),
        )
        .await
    }

    async fn run_command_with_input(&self, command: &str, input: Bytes) -> Result<CommandOutput> {
        debug!(
            "Running `{}` with {} bytes of input on {}",
            command,
            input.len(),
            self.address()
        );
        let command_text = command.to_string();
        blocking_ref(
            self,
            move |client| client.exec(&command_text, Some(&input[..])),
            command_join_error(command),
        )
        .await
    }

    async fn scp_write(&self, path: &str, mode: i32, content: Bytes) -> Result<()> {
        debug!("SCP {} bytes to {} with mode {:o}", content.len(), path, mode);
        let target = path.to_string();
        blocking_ref(
            self,
            move |client| client.scp_write_blocking(&target, mode, &content),
            transfer_join_error(TransferProtocol::Scp, path),
        )
        .await
    }

    async fn sftp_read(&self, path: &str) -> Result<Bytes> {
        debug!("SFTP read {}", path);
        let target = path.to_string();
        blocking_ref(
            self,
            move |client| client.sftp_read_blocking(&target),
            transfer_join_error(TransferProtocol::Sftp, path),
        )
        .await
    }

    async fn sftp_remove(&self, path: &str) -> Result<()> {
        debug!("SFTP remove {}", path);
        let target = path.to_string();
        blocking_ref(
            self,
            move |client| client.sftp_remove_blocking(&target),
            transfer_join_error(TransferProtocol::Sftp, path),
        )
        .await
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.info.clone()
    }

    async fn close(&self) -> Result<()> {
        info!("Closing connection to {}", self.address());
        let session = self.session.clone();
        let tunnel = self.tunnel.lock().take();
        let address = self.address();
        let join_address = address.clone();
        blocking(
            move || {
                let result = session
                    .disconnect(None, "closed by client", None)
                    .map_err(|e| RemoteError::connection(ConnectionStage::Target, address, e));
                if let Some(tunnel) = tunnel {
                    tunnel.shutdown();
                }
                result
            },
            move |message| RemoteError::connection(ConnectionStage::Target, join_address, message),
        )
        .await
    }
}

fn info_for(descriptor: &ConnectionDescriptor, transport_type: TransportType) -> ConnectionInfo {
    ConnectionInfo {
        host: descriptor.host().to_string(),
        port: descriptor.port(),
        username: descriptor.user().to_string(),
        transport_type,
    }
}

fn dial(descriptor: &ConnectionDescriptor, stage: ConnectionStage) -> Result<TcpStream> {
    let address = descriptor.address();
    let addrs = (descriptor.host(), descriptor.port())
        .to_socket_addrs()
        .map_err(|e| RemoteError::connection(stage, &address, e))?;

    let mut last_error = None;
    for addr in addrs {
        let attempt = match descriptor.timeout() {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("Dial {} ({}) failed: {}", address, addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(match last_error {
        Some(e) => RemoteError::connection(stage, address, e),
        None => RemoteError::connection(stage, address, "no addresses resolved"),
    })
}

/// Handshake and authenticate on a fresh session
///
/// `attach` hands the session its socket. The descriptor's timeout bounds
/// the handshake and authentication only; it is lifted afterwards so long
/// transfers are not cut off.
fn establish(
    descriptor: &ConnectionDescriptor,
    stage: ConnectionStage,
    attach: impl FnOnce(&mut Session),
) -> Result<Session> {
    let address = descriptor.address();
    let fail = |e: &dyn std::fmt::Display| RemoteError::connection(stage, &address, e);

    let mut session = Session::new().map_err(|e| fail(&e))?;
    attach(&mut session);
    if let Some(timeout) = descriptor.timeout() {
        session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
    }

    session.handshake().map_err(|e| fail(&e))?;
    authenticate(&session, descriptor).map_err(|message| fail(&message))?;
    session.set_timeout(0);
    Ok(session)
}

fn authenticate(session: &Session, descriptor: &ConnectionDescriptor) -> std::result::Result<(), String> {
    let user = descriptor.user();

    // Listing methods attempts "none" auth, which some servers accept outright.
    let listing = session.auth_methods(user).err();
    if session.authenticated() {
        debug!("{} accepted none auth for {}", descriptor.address(), user);
        return Ok(());
    }
    if let Some(e) = &listing {
        debug!("Listing auth methods for {} on {} failed: {}", user, descriptor.address(), e);
    }

    let mut attempted = Vec::new();
    for method in descriptor.auth_methods() {
        let (name, outcome) = match method {
            AuthMethod::Password(password) => ("password", session.userauth_password(user, password)),
            AuthMethod::PrivateKey { pem, .. } => (
                "publickey",
                session.userauth_pubkey_memory(user, None, pem, None),
            ),
            AuthMethod::Agent => ("agent", agent_auth(session, user)),
        };

        match outcome {
            Ok(()) if session.authenticated() => {
                debug!("Authenticated {} on {} with {}", user, descriptor.address(), name);
                return Ok(());
            }
            Ok(()) => attempted.push(name.to_string()),
            Err(e) => {
                debug!("{} auth for {} failed: {}", name, user, e);
                attempted.push(name.to_string());
            }
        }
    }

    Err(auth_failure(&attempted, listing.as_ref()))
}

fn auth_failure(attempted: &[String], listing: Option<&ssh2::Error>) -> String {
    let mut message = format!(
        "ssh: unable to authenticate, attempted methods [none {}], no supported methods remain",
        attempted.join(" ")
    );
    if let Some(e) = listing {
        message.push_str(&format!(" (listing auth methods failed: {})", e));
    }
    message
}

fn agent_auth(session: &Session, user: &str) -> std::result::Result<(), ssh2::Error> {
    let mut agent = session.agent()?;
    agent.connect()?;
    agent.list_identities()?;
    let identities = agent.identities()?;

    let mut last_error = None;
    for identity in &identities {
        match agent.userauth(user, identity) {
            Ok(()) => {
                let _ = agent.disconnect();
                return Ok(());
            }
            Err(e) => last_error = Some(e),
        }
    }
    let _ = agent.disconnect();

    Err(last_error.unwrap_or_else(|| {
        ssh2::Error::new(ErrorCode::Session(-18), "agent holds no identities")
    }))
}

fn sftp_error(path: &str, e: ssh2::Error) -> RemoteError {
    match e.code() {
        ErrorCode::SFTP(SFTP_NO_SUCH_FILE) | ErrorCode::SFTP(SFTP_NO_SUCH_PATH) => {
            RemoteError::NotFound(path.to_string())
        }
        _ => RemoteError::transfer(TransferProtocol::Sftp, path, e),
    }
}

fn command_join_error(command: &str) -> impl FnOnce(String) -> RemoteError {
    let command = command.to_string();
    move |message| {
        RemoteError::Command(CommandError {
            command,
            failure: CommandFailure::Channel(message),
            stderr: String::new(),
        })
    }
}

fn transfer_join_error(protocol: TransferProtocol, path: &str) -> impl FnOnce(String) -> RemoteError {
    let path = path.to_string();
    move |message| RemoteError::transfer(protocol, &path, message)
}

async fn blocking<T, F>(f: F, on_join: impl FnOnce(String) -> RemoteError) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => {
            warn!("Blocking SSH task failed: {}", e);
            Err(on_join(e.to_string()))
        }
    }
}

// The session is reference counted inside ssh2, so a cheap handle moves to
// the blocking thread while `self` stays borrowed.
async fn blocking_ref<T, F>(
    client: &SshClient,
    f: F,
    on_join: impl FnOnce(String) -> RemoteError,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&SshClient) -> Result<T> + Send + 'static,
{
    let handle = SshClient {
        session: client.session.clone(),
        info: client.info.clone(),
        tunnel: Mutex::new(None),
    };
    blocking(move || f(&handle), on_join).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sftp_missing_file_is_not_found() {
        for code in [SFTP_NO_SUCH_FILE, SFTP_NO_SUCH_PATH] {
            let err = sftp_error("/tmp/x", ssh2::Error::new(ErrorCode::SFTP(code), "no such file"));
            assert!(matches!(err, RemoteError::NotFound(ref path) if path == "/tmp/x"));
        }
    }

    #[test]
    fn test_sftp_other_failures_are_transfer_errors() {
        // SSH_FX_PERMISSION_DENIED
        let err = sftp_error("/root/x", ssh2::Error::new(ErrorCode::SFTP(3), "permission denied"));
        match err {
            RemoteError::Transfer { protocol, path, .. } => {
                assert_eq!(protocol, TransferProtocol::Sftp);
                assert_eq!(path, "/root/x");
            }
            other => panic!("expected transfer error, got {:?}", other),
        }

        let err = sftp_error("/tmp/x", ssh2::Error::new(ErrorCode::Session(-7), "socket send"));
        assert!(matches!(err, RemoteError::Transfer { .. }));
    }

    #[test]
    fn test_auth_failure_message() {
        let attempted = vec!["password".to_string(), "publickey".to_string()];
        assert_eq!(
            auth_failure(&attempted, None),
            "ssh: unable to authenticate, attempted methods [none password publickey], no supported methods remain"
        );

        let dropped = ssh2::Error::new(ErrorCode::Session(-13), "socket disconnected");
        let message = auth_failure(&attempted, Some(&dropped));
        assert!(message.ends_with("(listing auth methods failed: [Session(-13)] socket disconnected)"));
    }
}
