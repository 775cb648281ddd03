//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. The forwarder, the SFTP
//! source and the liveness probe reach it through a cloneable [`HandleController`] which
//! sends commands over an mpsc channel, so no lock is ever held across an
//! `.await` on the handle.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, session_id);
//! let channel = controller.open_direct_tcpip("localhost", 143, "127.0.0.1", 0).await?;
//! ```

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::ForwardError;

/// Keepalive answer deadline inside the owner task
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a caller waits for the owner task to answer a ping. Covers the
/// time the command sits behind slow channel opens.
pub const PING_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a keepalive probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    /// Connection is alive
    Ok,
    /// No answer in time (may be transient)
    Timeout,
    /// The connection is gone
    IoError,
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (used for the SFTP subsystem)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Open a direct-tcpip channel (one per forwarded connection)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Probe the connection
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (copies the sender). Every clone has full control over the
/// connection, including disconnecting it.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Fires once when the owner task exits
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Subscribe to SSH disconnect notifications.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Open a new session channel
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, ForwardError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| ForwardError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| ForwardError::Disconnected)?
            .map_err(|e| ForwardError::Channel(e.to_string()))
    }

    /// Open a direct-tcpip channel to `host:port` on the remote side
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, ForwardError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| ForwardError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| ForwardError::Disconnected)?
            .map_err(|e| ForwardError::Channel(e.to_string()))
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Send a keepalive and report whether the connection answered within
    /// [`PING_REPLY_TIMEOUT`]
    pub async fn ping(&self) -> PingResult {
        self.ping_within(PING_REPLY_TIMEOUT).await
    }

    pub async fn ping_within(&self, timeout: Duration) -> PingResult {
        let exchange = async {
            let (reply_tx, reply_rx) = oneshot::channel();
            if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
                return PingResult::IoError;
            }
            reply_rx.await.unwrap_or(PingResult::IoError)
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Handle owner did not answer ping within {:?}", timeout);
                PingResult::Timeout
            }
        }
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes the Handle and returns a controller for sending commands.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_id: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let handle = handle;

        info!("Handle owner task started for session {}", session_id);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::ChannelOpenSession { reply_tx } => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving session channel");
                    }
                }

                HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving direct_tcpip result");
                    }
                }

                HandleCommand::Ping { reply_tx } => {
                    if handle.is_closed() {
                        let _ = reply_tx.send(PingResult::IoError);
                        continue;
                    }
                    let result = match tokio::time::timeout(
                        KEEPALIVE_TIMEOUT,
                        handle.send_keepalive(true),
                    )
                    .await
                    {
                        Ok(Ok(())) => PingResult::Ok,
                        Ok(Err(e)) => {
                            warn!("Keepalive failed for session {}: {:?}", session_id, e);
                            PingResult::IoError
                        }
                        Err(_) => {
                            warn!("Keepalive timeout for session {} (5s)", session_id);
                            PingResult::Timeout
                        }
                    };
                    debug!("Keepalive for session {}: {:?}", session_id, result);
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Disconnect => {
                    info!("Disconnect requested for session {}", session_id);
                    break;
                }
            }
        }

        let _ = disconnect_tx_clone.send(());

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for session {}", session_id);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Answer everything still queued with a disconnect
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}
