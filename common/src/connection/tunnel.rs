// SSH forwarding tunnel
//
// Logs in to the tunnel host, listens on a loopback port and forwards every
// accepted connection to `remote_host:remote_port` through a direct-tcpip
// channel. Forwarding runs on one dedicated thread with the session in
// non-blocking mode; when the session dies the thread exits and flips the
// `closed` watch so owners can react.

use crate::config::{TunnelAuth, TunnelConfig};
use crate::errors::ConnectionError;
use ssh2::{Channel, ErrorCode, Session};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_EAGAIN: i32 = -37;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

const IDLE_SLEEP: Duration = Duration::from_millis(2);
const BUFFER_SIZE: usize = 16 * 1024;

/// A live forwarding tunnel; dropping it stops forwarding
pub struct SshTunnel {
    local_addr: SocketAddr,
    closed_rx: watch::Receiver<bool>,
    shutdown: Arc<AtomicBool>,
}

impl SshTunnel {
    /// Log in and start forwarding. Fails if the tunnel is not ready within
    /// the configured ready timeout.
    #[instrument(skip(config), fields(ssh_host = %config.ssh_host, ssh_port = config.ssh_port))]
    pub async fn open(config: &TunnelConfig) -> Result<Self, ConnectionError> {
        let auth = config
            .auth()
            .map_err(ConnectionError::InvalidConfiguration)?;
        let ready_timeout = config.ready_timeout();

        info!("Establishing SSH tunnel");

        let login_config = config.clone();
        let login = tokio::task::spawn_blocking(move || login(&login_config, &auth));

        let (session, listener) = match tokio::time::timeout(ready_timeout, login).await {
            Err(_) => {
                error!(ready_timeout_ms = config.ready_timeout_ms, "SSH tunnel not ready in time");
                return Err(ConnectionError::TunnelTimeout(config.ready_timeout_ms));
            }
            Ok(Err(join_error)) => {
                return Err(ConnectionError::TunnelConnectFailed(join_error.to_string()));
            }
            Ok(Ok(result)) => result?,
        };

        let local_addr = listener
            .local_addr()
            .map_err(|e| ConnectionError::ListenerBindFailed(e.to_string()))?;

        let forwarder = Forwarder {
            session,
            listener,
            remote_host: config.remote_host.clone(),
            remote_port: config.remote_port,
            keepalive: config.keepalive_interval(),
            shutdown: Arc::new(AtomicBool::new(false)),
        };
        let tunnel = Self::start(forwarder, local_addr)?;

        info!(local_addr = %local_addr, remote_host = %config.remote_host, remote_port = config.remote_port, "SSH tunnel ready");

        Ok(tunnel)
    }

    /// Run the forwarder on its own thread
    fn start(forwarder: Forwarder, local_addr: SocketAddr) -> Result<Self, ConnectionError> {
        let (closed_tx, closed_rx) = watch::channel(false);
        let shutdown = forwarder.shutdown.clone();

        thread::Builder::new()
            .name(format!("ssh-tunnel-{}", local_addr.port()))
            .spawn(move || {
                // `run` consumes the forwarder, so the listener is gone before the close event fires
                let reason = forwarder.run();
                warn!(reason = %reason, "SSH tunnel closed");
                let _ = closed_tx.send(true);
            })
            .map_err(|e| ConnectionError::TunnelConnectFailed(format!("Failed to spawn forwarder: {}", e)))?;

        Ok(Self {
            local_addr,
            closed_rx,
            shutdown,
        })
    }

    /// Loopback endpoint the store client should target
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Subscribe to the close event
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    /// Stop forwarding; the close event fires once the forwarder exits
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Stop forwarding and wait until the local port has been released.
    ///
    /// Use this instead of dropping when a fixed `local_port` is about to be
    /// bound again.
    pub async fn shutdown(self) {
        self.close();
        let mut closed = self.closed_rx.clone();
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                break;
            }
        }
        debug!(local_addr = %self.local_addr, "SSH tunnel released its local port");
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Blocking login: TCP connect, handshake, authenticate, bind the listener
fn login(config: &TunnelConfig, auth: &TunnelAuth) -> Result<(Session, TcpListener), ConnectionError> {
    let timeout = config.ready_timeout();

    let addr = (config.ssh_host.as_str(), config.ssh_port)
        .to_socket_addrs()
        .map_err(|e| {
            ConnectionError::TunnelConnectFailed(format!(
                "Failed to resolve {}:{}: {}",
                config.ssh_host, config.ssh_port, e
            ))
        })?
        .next()
        .ok_or_else(|| {
            ConnectionError::TunnelConnectFailed(format!(
                "No address for {}:{}",
                config.ssh_host, config.ssh_port
            ))
        })?;

    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
        error!(error = %e, addr = %addr, "Failed to connect to tunnel host");
        ConnectionError::TunnelConnectFailed(format!("Failed to connect to {}: {}", addr, e))
    })?;
    tcp.set_read_timeout(Some(timeout))
        .and_then(|_| tcp.set_write_timeout(Some(timeout)))
        .map_err(|e| ConnectionError::TunnelConnectFailed(format!("Failed to set socket timeouts: {}", e)))?;

    let mut session = Session::new().map_err(|e| {
        ConnectionError::TunnelConnectFailed(format!("Failed to create SSH session: {}", e))
    })?;
    session.set_tcp_stream(tcp);
    session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));

    session.handshake().map_err(|e| {
        error!(error = %e, "SSH handshake failed");
        ConnectionError::TunnelConnectFailed(format!("SSH handshake failed: {}", e))
    })?;

    log_host_key(&session);
    authenticate(&session, auth)?;

    if !session.authenticated() {
        return Err(ConnectionError::TunnelAuthenticationFailed(
            "session not authenticated".to_string(),
        ));
    }

    let keepalive_secs = (config.keepalive_interval_ms / 1000).max(1);
    session.set_keepalive(true, u32::try_from(keepalive_secs).unwrap_or(u32::MAX));

    let listener = TcpListener::bind(("127.0.0.1", config.local_port.unwrap_or(0)))
        .map_err(|e| ConnectionError::ListenerBindFailed(e.to_string()))?;

    Ok((session, listener))
}

fn log_host_key(session: &Session) {
    if let Some((_, host_key_type)) = session.host_key() {
        if let Some(hash) = session.host_key_hash(ssh2::HashType::Sha256) {
            let fingerprint = hash
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(":");
            info!(host_key_type = ?host_key_type, fingerprint = %fingerprint, "Tunnel host key");
        }
    }
}

fn authenticate(session: &Session, auth: &TunnelAuth) -> Result<(), ConnectionError> {
    match auth {
        TunnelAuth::KeyData {
            username,
            private_key,
        } => {
            debug!(username = %username, "Authenticating with inline key");
            session
                .userauth_pubkey_memory(username, None, private_key, None)
                .map_err(|e| {
                    error!(error = %e, username = %username, "Key authentication failed");
                    ConnectionError::TunnelAuthenticationFailed(format!(
                        "Key authentication failed for user {}: {}",
                        username, e
                    ))
                })
        }
        TunnelAuth::KeyFile {
            username,
            private_key_path,
        } => {
            debug!(username = %username, key_path = %private_key_path, "Authenticating with key file");
            session
                .userauth_pubkey_file(username, None, Path::new(private_key_path), None)
                .map_err(|e| {
                    error!(error = %e, username = %username, key_path = %private_key_path, "Key authentication failed");
                    ConnectionError::TunnelAuthenticationFailed(format!(
                        "Key authentication failed for user {}: {}",
                        username, e
                    ))
                })
        }
    }
}

fn would_block(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

fn is_session_fatal(e: &ssh2::Error) -> bool {
    matches!(
        e.code(),
        ErrorCode::Session(
            LIBSSH2_ERROR_SOCKET_SEND | LIBSSH2_ERROR_SOCKET_DISCONNECT | LIBSSH2_ERROR_SOCKET_RECV
        )
    )
}

struct Forwarder {
    session: Session,
    listener: TcpListener,
    remote_host: String,
    remote_port: u16,
    keepalive: Duration,
    shutdown: Arc<AtomicBool>,
}

impl Forwarder {
    /// Forward until the session dies or shutdown is requested; returns why it stopped
    fn run(self) -> String {
        if let Err(e) = self.listener.set_nonblocking(true) {
            return format!("listener setup failed: {}", e);
        }
        self.session.set_blocking(false);

        let mut pending: Vec<TcpStream> = Vec::new();
        let mut pipes: Vec<Pipe> = Vec::new();
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut next_keepalive = Instant::now() + self.keepalive;

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return "shutdown requested".to_string();
            }

            let mut progressed = false;

            if Instant::now() >= next_keepalive {
                match self.session.keepalive_send() {
                    Ok(_) => {}
                    Err(e) if would_block(&e) => {}
                    Err(e) => return format!("keepalive failed: {}", e),
                }
                next_keepalive = Instant::now() + self.keepalive;
            }

            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted tunnel client");
                    pending.push(stream);
                    progressed = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return format!("listener failed: {}", e),
            }

            let mut still_pending = Vec::with_capacity(pending.len());
            for stream in pending.drain(..) {
                match self
                    .session
                    .channel_direct_tcpip(&self.remote_host, self.remote_port, None)
                {
                    Ok(channel) => match Pipe::new(stream, channel) {
                        Ok(pipe) => {
                            pipes.push(pipe);
                            progressed = true;
                        }
                        Err(e) => warn!(error = %e, "Failed to prepare tunnel client"),
                    },
                    Err(e) if would_block(&e) => still_pending.push(stream),
                    Err(e) if is_session_fatal(&e) => return format!("channel open failed: {}", e),
                    Err(e) => warn!(error = %e, "Failed to open forwarding channel"),
                }
            }
            pending = still_pending;

            pipes.retain_mut(|pipe| match pipe.pump(&mut buf) {
                Ok(Pump { moved, finished }) => {
                    progressed |= moved;
                    !finished
                }
                Err(e) => {
                    debug!(error = %e, "Tunnel client closed");
                    false
                }
            });

            if !progressed {
                thread::sleep(IDLE_SLEEP);
            }
        }
    }
}

struct Pump {
    moved: bool,
    finished: bool,
}

/// One local client bridged to one forwarding channel
struct Pipe {
    stream: TcpStream,
    channel: Channel,
    to_remote: Vec<u8>,
    to_local: Vec<u8>,
    local_eof: bool,
    remote_eof: bool,
}

impl Pipe {
    fn new(stream: TcpStream, channel: Channel) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            channel,
            to_remote: Vec::new(),
            to_local: Vec::new(),
            local_eof: false,
            remote_eof: false,
        })
    }

    fn pump(&mut self, buf: &mut [u8]) -> io::Result<Pump> {
        let mut moved = false;

        if self.to_remote.is_empty() && !self.local_eof {
            match self.stream.read(buf) {
                Ok(0) => {
                    self.local_eof = true;
                    let _ = self.channel.send_eof();
                }
                Ok(n) => {
                    self.to_remote.extend_from_slice(&buf[..n]);
                    moved = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        if !self.to_remote.is_empty() {
            match self.channel.write(&self.to_remote) {
                Ok(n) => {
                    self.to_remote.drain(..n);
                    moved |= n > 0;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        if self.to_local.is_empty() && !self.remote_eof {
            match self.channel.read(buf) {
                Ok(0) => {
                    if self.channel.eof() {
                        self.remote_eof = true;
                    }
                }
                Ok(n) => {
                    self.to_local.extend_from_slice(&buf[..n]);
                    moved = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        if !self.to_local.is_empty() {
            match self.stream.write(&self.to_local) {
                Ok(n) => {
                    self.to_local.drain(..n);
                    moved |= n > 0;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        let finished = (self.remote_eof && self.to_local.is_empty())
            || (self.local_eof && self.to_remote.is_empty());

        Ok(Pump { moved, finished })
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        let _ = self.channel.close();
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
