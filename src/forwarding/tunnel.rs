//! Local Port Forwarder
//!
//! Owns one forward session: the SSH connection plus the local listener that
//! exposes the remote service. The backend follows the credential: password
//! or key use the in-process client, no credential uses the system client.

use std::net::SocketAddr;

use tracing::{info, warn};

use super::local::{start_local_forward, ForwardStats, LocalForward, LocalForwardHandle};
use super::probe_local_port;
use super::system::{start_system_tunnel, SystemTunnel};
use crate::ssh::{
    spawn_handle_owner_task, ForwardError, HandleController, PingResult, SshClient, SshConfig,
};

/// Everything needed to establish one forward
#[derive(Debug, Clone)]
pub struct ForwardSession {
    pub ssh: SshConfig,
    pub forward: LocalForward,
}

impl ForwardSession {
    pub fn new(ssh: SshConfig, forward: LocalForward) -> Self {
        Self { ssh, forward }
    }
}

enum ActiveForward {
    Native {
        controller: HandleController,
        handle: LocalForwardHandle,
    },
    System(SystemTunnel),
}

/// Start/check/stop lifecycle around a [`ForwardSession`]
pub struct LocalPortForwarder {
    session: ForwardSession,
    active: Option<ActiveForward>,
}

impl LocalPortForwarder {
    pub fn new(session: ForwardSession) -> Self {
        Self {
            session,
            active: None,
        }
    }

    pub fn session(&self) -> &ForwardSession {
        &self.session
    }

    /// Authenticate, bind the local port and start relaying in the background.
    ///
    /// Returns the bound address once the listener is ready. Calling `start`
    /// on a running forwarder returns the existing address.
    pub async fn start(&mut self) -> Result<SocketAddr, ForwardError> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let ssh = &self.session.ssh;
        let forward = &self.session.forward;
        info!(
            "Creating SSH tunnel {}@{}:{}, {} -> {}:{}",
            ssh.username,
            ssh.host,
            ssh.port,
            forward.local_addr,
            forward.remote_host,
            forward.remote_port
        );

        let active = if ssh.auth.is_native() {
            let handle = SshClient::new(ssh.clone()).connect().await?;
            let session_id = uuid::Uuid::new_v4().to_string();
            let controller = spawn_handle_owner_task(handle, session_id);

            match start_local_forward(controller.clone(), forward.clone()).await {
                Ok(handle) => ActiveForward::Native { controller, handle },
                Err(e) => {
                    controller.disconnect().await;
                    return Err(e);
                }
            }
        } else {
            ActiveForward::System(start_system_tunnel(ssh, forward).await?)
        };

        self.active = Some(active);
        let addr = self.local_addr().ok_or(ForwardError::Disconnected)?;
        info!("SSH tunnel ready on {}", addr);
        Ok(addr)
    }

    /// True iff the SSH session is alive and the local port accepts connections
    pub async fn check(&mut self) -> bool {
        match &mut self.active {
            None => false,
            Some(ActiveForward::Native { controller, handle }) => {
                if !handle.is_running() || !controller.is_connected() {
                    return false;
                }
                match controller.ping().await {
                    PingResult::Ok => probe_local_port(handle.bound_addr).await,
                    other => {
                        warn!("SSH session did not answer keepalive: {:?}", other);
                        false
                    }
                }
            }
            Some(ActiveForward::System(tunnel)) => tunnel.check().await,
        }
    }

    /// Close the session and the listener. Safe to call repeatedly or before
    /// `start`.
    pub async fn stop(&mut self) {
        match self.active.take() {
            None => {}
            Some(ActiveForward::Native { controller, handle }) => {
                handle.stop().await;
                controller.disconnect().await;
                info!("SSH tunnel on {} stopped", handle.bound_addr);
            }
            Some(ActiveForward::System(mut tunnel)) => tunnel.stop().await,
        }
    }

    pub fn is_running(&self) -> bool {
        match &self.active {
            None => false,
            Some(ActiveForward::Native { handle, .. }) => handle.is_running(),
            Some(ActiveForward::System(_)) => true,
        }
    }

    /// Bound local address while started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.active {
            None => None,
            Some(ActiveForward::Native { handle, .. }) => Some(handle.bound_addr),
            Some(ActiveForward::System(tunnel)) => Some(tunnel.bound_addr()),
        }
    }

    /// Relay statistics (in-process backend only)
    pub fn stats(&self) -> Option<ForwardStats> {
        match &self.active {
            Some(ActiveForward::Native { handle, .. }) => Some(handle.stats()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::test_server::{spawn_echo_server, spawn_test_server, TEST_PASSWORD};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn echo_session(local_port: u16) -> (crate::ssh::test_server::TestSshServer, ForwardSession) {
        let server = spawn_test_server().await;
        let echo = spawn_echo_server().await;
        let session = ForwardSession::new(
            server.client_config(TEST_PASSWORD),
            LocalForward::loopback(local_port, "127.0.0.1", echo.port()),
        );
        (server, session)
    }

    #[tokio::test]
    async fn test_start_then_check_then_stop() {
        let (_server, session) = echo_session(0).await;
        let mut forwarder = LocalPortForwarder::new(session);

        let addr = forwarder.start().await.unwrap();
        assert!(forwarder.is_running());
        assert!(forwarder.check().await);

        forwarder.stop().await;
        assert!(!forwarder.is_running());
        assert!(!forwarder.check().await);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut never_started = LocalPortForwarder::new(echo_session(0).await.1);
        never_started.stop().await;
        never_started.stop().await;

        let (_server, session) = echo_session(0).await;
        let mut forwarder = LocalPortForwarder::new(session);
        forwarder.start().await.unwrap();
        forwarder.stop().await;
        forwarder.stop().await;
        assert!(forwarder.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_second_session_on_same_port_is_port_in_use() {
        let (_server, session) = echo_session(0).await;
        let mut first = LocalPortForwarder::new(session.clone());
        let addr = first.start().await.unwrap();

        let mut conflicting = session;
        conflicting.forward = LocalForward::loopback(
            addr.port(),
            conflicting.forward.remote_host.clone(),
            conflicting.forward.remote_port,
        );
        let mut second = LocalPortForwarder::new(conflicting);
        let err = second.start().await.unwrap_err();
        assert!(matches!(err, ForwardError::PortInUse(_)), "{err}");
        assert!(first.check().await);

        first.stop().await;
    }

    #[tokio::test]
    async fn test_wrong_password_leaves_port_free() {
        let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = spare.local_addr().unwrap().port();
        drop(spare);

        let server = spawn_test_server().await;
        let session = ForwardSession::new(
            server.client_config("wrong-password"),
            LocalForward::loopback(port, "127.0.0.1", 143),
        );
        let mut forwarder = LocalPortForwarder::new(session);

        let err = forwarder.start().await.unwrap_err();
        assert!(matches!(err, ForwardError::Authentication(_)), "{err}");
        assert!(!forwarder.is_running());
        assert!(TcpListener::bind(("127.0.0.1", port)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connect_error() {
        let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = spare.local_addr().unwrap().port();
        drop(spare);

        let ssh = SshConfig {
            host: "127.0.0.1".into(),
            port: dead_port,
            username: "operator".into(),
            auth: crate::ssh::AuthMethod::password("x"),
            timeout_secs: 2,
            ..Default::default()
        };
        let mut forwarder =
            LocalPortForwarder::new(ForwardSession::new(ssh, LocalForward::imap(0)));
        let err = forwarder.start().await.unwrap_err();
        assert!(matches!(err, ForwardError::Connect(_)), "{err}");
    }

    #[tokio::test]
    async fn test_parallel_connections_get_their_own_bytes() {
        const CONNECTIONS: usize = 4;
        const BYTES: usize = 64 * 1024;

        let (_server, session) = echo_session(0).await;
        let mut forwarder = LocalPortForwarder::new(session);
        let addr = forwarder.start().await.unwrap();

        let mut clients = Vec::new();
        for i in 0..CONNECTIONS {
            clients.push(tokio::spawn(async move {
                let payload: Vec<u8> = (0..BYTES).map(|n| (n * 7 + i) as u8).collect();
                let stream = TcpStream::connect(addr).await.unwrap();
                let (mut reader, mut writer) = stream.into_split();

                let expected = payload.clone();
                let send = tokio::spawn(async move {
                    writer.write_all(&payload).await.unwrap();
                    writer
                });

                let mut echoed = vec![0u8; BYTES];
                reader.read_exact(&mut echoed).await.unwrap();
                let _writer = send.await.unwrap();
                assert_eq!(echoed, expected, "connection {} got foreign bytes", i);
            }));
        }
        for client in clients {
            client.await.unwrap();
        }

        let stats = forwarder.stats().unwrap();
        assert!(stats.connection_count >= CONNECTIONS as u64);
        assert!(stats.bytes_sent >= (CONNECTIONS * BYTES) as u64);
        forwarder.stop().await;
    }

    #[tokio::test]
    async fn test_closing_one_connection_leaves_others_flowing() {
        let (_server, session) = echo_session(0).await;
        let mut forwarder = LocalPortForwarder::new(session);
        let addr = forwarder.start().await.unwrap();

        let mut keep = TcpStream::connect(addr).await.unwrap();
        let mut closed = TcpStream::connect(addr).await.unwrap();

        closed.write_all(b"first").await.unwrap();
        let mut buf = [0u8; 5];
        closed.read_exact(&mut buf).await.unwrap();
        drop(closed);

        keep.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        keep.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");

        forwarder.stop().await;
    }

    #[tokio::test]
    async fn test_writes_fail_after_stop() {
        let (_server, session) = echo_session(0).await;
        let mut forwarder = LocalPortForwarder::new(session);
        let addr = forwarder.start().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();

        forwarder.stop().await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut failed = false;
        while tokio::time::Instant::now() < deadline {
            if stream.write_all(b"x").await.is_err() {
                failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(failed, "write kept succeeding after stop()");
    }
}
