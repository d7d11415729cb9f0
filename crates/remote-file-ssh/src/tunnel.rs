//! Byte pump carrying a target SSH session through a proxy's forwarded channel
//!
//! libssh2 needs a real socket under every session, so the target session is
//! given one end of a local socket pair and this pump shuttles bytes between
//! the other end and a `direct-tcpip` channel on the proxy session.

use ssh2::{Channel, Session};
use std::io::{self, ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const BUFFER_SIZE: usize = 32 * 1024;
const MIN_IDLE_SLEEP: Duration = Duration::from_millis(1);
const MAX_IDLE_SLEEP: Duration = Duration::from_millis(20);
const TEARDOWN_TIMEOUT_MS: u32 = 5_000;

/// A running proxy tunnel
#[derive(Debug)]
pub struct Tunnel {
    target: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Tunnel {
    /// Start pumping between `channel` (on `proxy`) and `socket`
    ///
    /// The pump owns the proxy session and disconnects it when it exits.
    pub fn spawn(
        proxy: Session,
        channel: Channel,
        socket: UnixStream,
        target: String,
    ) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let name = target.clone();

        let handle = thread::Builder::new()
            .name(format!("ssh-tunnel-{}", target))
            .spawn(move || {
                proxy.set_blocking(false);
                let result = pump(channel, socket, &flag);
                proxy.set_blocking(true);
                proxy.set_timeout(TEARDOWN_TIMEOUT_MS);
                if let Err(e) = proxy.disconnect(None, "tunnel closed", None) {
                    debug!("Proxy disconnect for {} failed: {}", name, e);
                }
                match result {
                    Ok(()) => debug!("Tunnel to {} closed", name),
                    Err(e) => warn!("Tunnel to {} failed: {}", name, e),
                }
            })?;

        debug!("Tunnel to {} started", target);
        Ok(Self {
            target,
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the pump and wait for it to tear the proxy session down
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Tunnel thread for {} panicked", self.target);
            }
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// The forwarded side of a tunnel
trait Forwarded: Read + Write {
    /// Whether the far end has sent EOF
    fn remote_eof(&self) -> bool;

    /// Signal EOF and close, ignoring errors
    fn finish(&mut self);
}

impl Forwarded for Channel {
    fn remote_eof(&self) -> bool {
        self.eof()
    }

    fn finish(&mut self) {
        let _ = self.send_eof();
        let _ = self.close();
    }
}

/// Copy bytes both ways between `channel` and `socket` until either side
/// hangs up or `stop` is set. Both must be non-blocking.
fn pump<F: Forwarded>(mut channel: F, mut socket: UnixStream, stop: &AtomicBool) -> io::Result<()> {
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut idle = MIN_IDLE_SLEEP;
    // socket -> channel
    let mut upstream: Vec<u8> = Vec::new();
    // channel -> socket
    let mut downstream: Vec<u8> = Vec::new();
    let mut socket_eof = false;
    let mut channel_eof = false;

    while !stop.load(Ordering::SeqCst) {
        let mut progressed = false;

        if upstream.is_empty() && !socket_eof {
            match socket.read(&mut buf) {
                Ok(0) => {
                    socket_eof = true;
                    progressed = true;
                }
                Ok(n) => {
                    upstream.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        if !upstream.is_empty() {
            match channel.write(&upstream) {
                Ok(n) => {
                    upstream.drain(..n);
                    progressed |= n > 0;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        if downstream.is_empty() && !channel_eof {
            match channel.read(&mut buf) {
                Ok(0) if channel.remote_eof() => {
                    channel_eof = true;
                    progressed = true;
                }
                Ok(0) => {}
                Ok(n) => {
                    downstream.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        if !downstream.is_empty() {
            match socket.write(&downstream) {
                Ok(n) => {
                    downstream.drain(..n);
                    progressed |= n > 0;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        // Either side hanging up ends the tunnel once pending bytes are flushed.
        if (socket_eof && upstream.is_empty()) || (channel_eof && downstream.is_empty()) {
            break;
        }

        if progressed {
            idle = MIN_IDLE_SLEEP;
        } else {
            thread::sleep(idle);
            idle = (idle * 2).min(MAX_IDLE_SLEEP);
        }
    }

    let _ = socket.shutdown(Shutdown::Both);
    channel.finish();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A forwarded end backed by a local socket
    struct StreamEnd {
        stream: UnixStream,
        eof: bool,
    }

    impl StreamEnd {
        fn new(stream: UnixStream) -> Self {
            stream.set_nonblocking(true).unwrap();
            Self { stream, eof: false }
        }
    }

    impl Read for StreamEnd {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.stream.read(buf)?;
            if n == 0 && !buf.is_empty() {
                self.eof = true;
            }
            Ok(n)
        }
    }

    impl Write for StreamEnd {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.stream.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.stream.flush()
        }
    }

    impl Forwarded for StreamEnd {
        fn remote_eof(&self) -> bool {
            self.eof
        }

        fn finish(&mut self) {
            let _ = self.stream.shutdown(Shutdown::Write);
        }
    }

    struct Harness {
        /// What the target session would see
        local: UnixStream,
        /// What the proxy's far end would see
        remote: UnixStream,
        stop: Arc<AtomicBool>,
        handle: JoinHandle<io::Result<()>>,
    }

    fn start() -> Harness {
        let (local, pump_socket) = UnixStream::pair().unwrap();
        let (remote, pump_channel) = UnixStream::pair().unwrap();
        pump_socket.set_nonblocking(true).unwrap();
        for end in [&local, &remote] {
            end.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        }

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let channel = StreamEnd::new(pump_channel);
        let handle = thread::spawn(move || pump(channel, pump_socket, &flag));
        Harness {
            local,
            remote,
            stop,
            handle,
        }
    }

    fn read_exact(stream: &mut UnixStream, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        stream.read_exact(&mut out).unwrap();
        out
    }

    #[test]
    fn test_bytes_flow_both_ways() {
        let mut h = start();

        h.local.write_all(b"SSH-2.0-client\r\n").unwrap();
        assert_eq!(read_exact(&mut h.remote, 16), b"SSH-2.0-client\r\n");

        h.remote.write_all(b"SSH-2.0-server\r\n").unwrap();
        assert_eq!(read_exact(&mut h.local, 16), b"SSH-2.0-server\r\n");

        h.stop.store(true, Ordering::SeqCst);
        h.handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_large_transfer_is_buffered() {
        let mut h = start();
        let payload: Vec<u8> = (0..BUFFER_SIZE * 8).map(|i| (i % 251) as u8).collect();

        let writer = {
            let mut local = h.local.try_clone().unwrap();
            let payload = payload.clone();
            thread::spawn(move || local.write_all(&payload).unwrap())
        };
        assert_eq!(read_exact(&mut h.remote, payload.len()), payload);
        writer.join().unwrap();

        h.stop.store(true, Ordering::SeqCst);
        h.handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_remote_eof_ends_tunnel() {
        let mut h = start();

        h.remote.write_all(b"bye").unwrap();
        h.remote.shutdown(Shutdown::Write).unwrap();

        h.handle.join().unwrap().unwrap();
        // Pending bytes are flushed before the local side is hung up.
        let mut rest = Vec::new();
        h.local.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"bye");
    }

    #[test]
    fn test_local_eof_ends_tunnel() {
        let mut h = start();

        h.local.write_all(b"last").unwrap();
        h.local.shutdown(Shutdown::Write).unwrap();

        h.handle.join().unwrap().unwrap();
        let mut rest = Vec::new();
        h.remote.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"last");
    }

    #[test]
    fn test_stop_flag_ends_idle_tunnel() {
        let mut h = start();

        thread::sleep(Duration::from_millis(100));
        assert!(!h.handle.is_finished());

        h.stop.store(true, Ordering::SeqCst);
        h.handle.join().unwrap().unwrap();

        let mut rest = Vec::new();
        h.local.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }
}
