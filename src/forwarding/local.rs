//! Local Port Forwarding
//!
//! Forwards connections from a local port to a remote host:port through SSH.
//! Example: forward 127.0.0.1:1430 -> localhost:143 on the mail host.
//!
//! One accept task owns the listener. Every accepted socket gets its own
//! direct-tcpip channel and two relay tasks, one per direction. A relay that
//! hits end-of-stream or an error cancels its pair, which makes the other
//! direction drop its halves too. Stopping the forward cancels every pair.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ssh::{ForwardError, HandleController};

const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Local port forwarding configuration
#[derive(Debug, Clone)]
pub struct LocalForward {
    /// Local address to bind to (e.g., "127.0.0.1:1430")
    pub local_addr: String,
    /// Remote host to connect to through SSH (e.g., "localhost")
    pub remote_host: String,
    /// Remote port to connect to
    pub remote_port: u16,
}

impl LocalForward {
    pub fn new(
        local_addr: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            local_addr: local_addr.into(),
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    /// Loopback-only forward of `local_port` to `remote_host:remote_port`
    pub fn loopback(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self::new(format!("127.0.0.1:{}", local_port), remote_host, remote_port)
    }

    /// IMAP on the remote host's loopback interface
    pub fn imap(local_port: u16) -> Self {
        Self::loopback(local_port, "localhost", 143)
    }
}

/// Statistics for a port forward
#[derive(Debug, Clone, Default)]
pub struct ForwardStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Active connection pairs right now
    pub active_connections: u64,
    /// Total bytes sent (client -> server)
    pub bytes_sent: u64,
    /// Total bytes received (server -> client)
    pub bytes_received: u64,
}

/// Bind a listener, mapping the failure modes callers care about
pub async fn bind_local(addr: &str) -> Result<TcpListener, ForwardError> {
    TcpListener::bind(addr).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::AddrInUse => ForwardError::PortInUse(format!(
            "{}. Another application (or another forward) is using this port.",
            addr
        )),
        std::io::ErrorKind::PermissionDenied => ForwardError::Bind(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            addr
        )),
        std::io::ErrorKind::AddrNotAvailable => ForwardError::Bind(format!(
            "Address not available: {}. The specified address is not valid on this system.",
            addr
        )),
        _ => ForwardError::Bind(format!("Failed to bind to {}: {}", addr, e)),
    })
}

/// Handle to a running local port forward
pub struct LocalForwardHandle {
    /// Forward configuration
    pub config: LocalForward,
    /// Actual bound address (may differ from requested if port was 0)
    pub bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    /// Parent of every connection pair's token
    shutdown: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<RwLock<ForwardStats>>,
}

impl LocalForwardHandle {
    /// Close the listener and every connection pair.
    ///
    /// Returns once the listening socket is released. Relay tasks are not
    /// joined; they drop their sockets as soon as they observe the cancel.
    pub async fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Stopping local port forward on {}", self.bound_addr);
        }
        self.shutdown.cancel();

        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Check if the accept loop is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get current statistics
    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }
}

/// Start local port forwarding
///
/// Binds the listener, then spawns the accept loop. Returns as soon as the
/// listener is ready. The loop ends on [`LocalForwardHandle::stop`] or when
/// the SSH connection behind `handle_controller` goes away.
pub async fn start_local_forward(
    handle_controller: HandleController,
    config: LocalForward,
) -> Result<LocalForwardHandle, ForwardError> {
    let disconnect_rx = handle_controller.subscribe_disconnect();
    let listener = bind_local(&config.local_addr).await?;

    let bound_addr = listener
        .local_addr()
        .map_err(|e| ForwardError::Bind(format!("Failed to get bound address: {}", e)))?;

    info!(
        "Started local port forward: {} -> {}:{}",
        bound_addr, config.remote_host, config.remote_port
    );

    let running = Arc::new(AtomicBool::new(true));
    let shutdown = CancellationToken::new();
    let stats = Arc::new(RwLock::new(ForwardStats::default()));

    let accept_task = tokio::spawn(forward_loop(
        listener,
        handle_controller,
        config.remote_host.clone(),
        config.remote_port,
        disconnect_rx,
        shutdown.clone(),
        running.clone(),
        stats.clone(),
    ));

    Ok(LocalForwardHandle {
        config,
        bound_addr,
        running,
        shutdown,
        accept_task: Mutex::new(Some(accept_task)),
        stats,
    })
}

#[allow(clippy::too_many_arguments)]
async fn forward_loop(
    listener: TcpListener,
    handle_controller: HandleController,
    remote_host: String,
    remote_port: u16,
    mut disconnect_rx: broadcast::Receiver<()>,
    shutdown: CancellationToken,
    running: Arc<AtomicBool>,
    stats: Arc<RwLock<ForwardStats>>,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Local port forward stopped by request");
                break;
            }

            _ = disconnect_rx.recv() => {
                info!("Local port forward stopped: SSH disconnected");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }

                        debug!("Accepted connection from {} for forward", peer_addr);

                        {
                            let mut s = stats.write();
                            s.connection_count += 1;
                        }

                        let controller = handle_controller.clone();
                        let remote_host = remote_host.clone();
                        let stats = stats.clone();
                        let pair_token = shutdown.child_token();

                        // Channel open is a round-trip to the owner task
                        tokio::spawn(async move {
                            if let Err(e) = open_connection_pair(
                                controller,
                                stream,
                                peer_addr,
                                &remote_host,
                                remote_port,
                                pair_token,
                                stats,
                            )
                            .await
                            {
                                warn!("Forward connection from {} failed: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    // Closing the listener is what the caller waits for; pairs still running
    // after an SSH disconnect are cancelled here as well.
    drop(listener);
    shutdown.cancel();
    running.store(false, Ordering::SeqCst);
    info!("Local port forward task exited");
}

/// Decrements the active pair count once both relay tasks are gone
struct PairGuard {
    stats: Arc<RwLock<ForwardStats>>,
}

impl PairGuard {
    fn new(stats: Arc<RwLock<ForwardStats>>) -> Arc<Self> {
        stats.write().active_connections += 1;
        Arc::new(Self { stats })
    }
}

impl Drop for PairGuard {
    fn drop(&mut self) {
        let mut s = self.stats.write();
        s.active_connections = s.active_connections.saturating_sub(1);
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    /// local -> remote
    Upstream,
    /// remote -> local
    Downstream,
}

/// Bond one accepted socket to a fresh remote channel
async fn open_connection_pair(
    handle_controller: HandleController,
    local_stream: TcpStream,
    peer_addr: SocketAddr,
    remote_host: &str,
    remote_port: u16,
    pair_token: CancellationToken,
    stats: Arc<RwLock<ForwardStats>>,
) -> Result<(), ForwardError> {
    let channel = handle_controller
        .open_direct_tcpip(
            remote_host,
            remote_port as u32,
            &peer_addr.ip().to_string(),
            peer_addr.port() as u32,
        )
        .await?;

    debug!(
        "Opened channel for forward {} -> {}:{}",
        peer_addr, remote_host, remote_port
    );

    let (remote_read, remote_write) = tokio::io::split(channel.into_stream());
    let (local_read, local_write) = local_stream.into_split();
    let guard = PairGuard::new(stats.clone());

    tokio::spawn(relay(
        local_read,
        remote_write,
        Direction::Upstream,
        pair_token.clone(),
        stats.clone(),
        guard.clone(),
    ));
    tokio::spawn(relay(
        remote_read,
        local_write,
        Direction::Downstream,
        pair_token,
        stats,
        guard,
    ));

    Ok(())
}

/// Copy bytes one way until end-of-stream, an error or cancellation.
/// On exit the whole pair is cancelled so the opposite direction closes too.
async fn relay<R, W>(
    mut source: R,
    mut dest: W,
    direction: Direction,
    pair_token: CancellationToken,
    stats: Arc<RwLock<ForwardStats>>,
    _guard: Arc<PairGuard>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = pair_token.cancelled() => break,
            read = source.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("{:?} relay reached end of stream", direction);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("{:?} relay ended: {}", direction, ForwardError::Relay(e.to_string()));
                    break;
                }
            },
        };

        let written = tokio::select! {
            _ = pair_token.cancelled() => break,
            written = dest.write_all(&buf[..n]) => written,
        };
        if let Err(e) = written {
            debug!("{:?} relay ended: {}", direction, ForwardError::Relay(e.to_string()));
            break;
        }

        let mut s = stats.write();
        match direction {
            Direction::Upstream => s.bytes_sent += n as u64,
            Direction::Downstream => s.bytes_received += n as u64,
        }
    }

    let _ = dest.shutdown().await;
    pair_token.cancel();
}
