//! Port Forwarding Module
//!
//! Makes a service that only listens on a remote host (typically IMAP on the
//! mail server's loopback) reachable on a local port.

mod local;
mod system;
mod tunnel;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

pub use local::{bind_local, start_local_forward, ForwardStats, LocalForward, LocalForwardHandle};
pub use system::{classify_client_failure, ssh_args, start_system_tunnel, SystemTunnel};
pub use tunnel::{ForwardSession, LocalPortForwarder};

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Whether something accepts TCP connections on `addr`
pub async fn probe_local_port(addr: SocketAddr) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}
