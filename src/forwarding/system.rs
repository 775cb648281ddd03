//! Port forwarding through the platform's own ssh client
//!
//! Used when no password or key is configured: `ssh -N -L ...` runs as a child
//! process and relies on whatever keys and agent the user has set up. The
//! child owns the listening socket, so this backend only supervises it.

use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use super::local::{bind_local, LocalForward};
use super::probe_local_port;
use crate::ssh::{ForwardError, SshConfig};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A running `ssh -N -L` child process
#[derive(Debug)]
pub struct SystemTunnel {
    child: Child,
    bound_addr: SocketAddr,
}

impl SystemTunnel {
    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    /// Child still running and the forwarded port accepts connections
    pub async fn check(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => probe_local_port(self.bound_addr).await,
            Ok(Some(status)) => {
                warn!("ssh client exited: {}", status);
                false
            }
            Err(e) => {
                warn!("Failed to poll ssh client: {}", e);
                false
            }
        }
    }

    /// Terminate and reap the child
    pub async fn stop(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        if let Err(e) = self.child.kill().await {
            debug!("Failed to kill ssh client: {}", e);
        }
        info!("System ssh tunnel on {} stopped", self.bound_addr);
    }
}

/// Arguments for `ssh` establishing `forward` over `ssh`
pub fn ssh_args(ssh: &SshConfig, forward: &LocalForward, local_port: u16) -> Vec<String> {
    let known_hosts_file = if cfg!(windows) { "NUL" } else { "/dev/null" };
    vec![
        "-N".to_string(),
        "-L".to_string(),
        format!("{}:{}:{}", local_port, forward.remote_host, forward.remote_port),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        format!("UserKnownHostsFile={}", known_hosts_file),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
        "-o".to_string(),
        "ServerAliveInterval=60".to_string(),
        "-o".to_string(),
        "ServerAliveCountMax=3".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", ssh.timeout_secs),
        "-p".to_string(),
        ssh.port.to_string(),
        format!("{}@{}", ssh.username, ssh.host),
    ]
}

/// Map the stderr of a failed ssh client to the forwarding error taxonomy
pub fn classify_client_failure(stderr: &str) -> ForwardError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();
    if lower.contains("permission denied") || lower.contains("too many authentication failures")
    {
        ForwardError::Authentication(message)
    } else if lower.contains("address already in use") || lower.contains("cannot listen to port")
    {
        ForwardError::PortInUse(message)
    } else {
        ForwardError::Connect(message)
    }
}

/// Spawn the platform ssh client and wait until the forward accepts connections
pub async fn start_system_tunnel(
    ssh: &SshConfig,
    forward: &LocalForward,
) -> Result<SystemTunnel, ForwardError> {
    // The child binds the port itself; check it up front so a conflict is
    // reported as such instead of as a generic client failure.
    let probe = bind_local(&forward.local_addr).await?;
    let bound_addr = probe.local_addr()?;
    drop(probe);

    info!(
        "Starting system ssh tunnel: {} -> {}:{} via {}@{}:{}",
        bound_addr, forward.remote_host, forward.remote_port, ssh.username, ssh.host, ssh.port
    );

    let mut child = Command::new(&ssh.client_program)
        .args(ssh_args(ssh, forward, bound_addr.port()))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ForwardError::Connect(format!(
                "ssh client '{}' not found. Install the OpenSSH client.",
                ssh.client_program
            )),
            _ => ForwardError::Connect(format!(
                "Failed to start '{}': {}",
                ssh.client_program, e
            )),
        })?;

    let mut stderr = child.stderr.take();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(ssh.timeout_secs);

    loop {
        if let Some(status) = child.try_wait()? {
            let output = read_stderr(stderr.take()).await;
            let output = if output.trim().is_empty() {
                format!("ssh client exited with {}", status)
            } else {
                output
            };
            return Err(classify_client_failure(&output));
        }

        if probe_local_port(bound_addr).await {
            break;
        }

        if tokio::time::Instant::now() >= deadline {
            let _ = child.kill().await;
            return Err(ForwardError::Connect(format!(
                "ssh client did not open {} within {}s",
                bound_addr, ssh.timeout_secs
            )));
        }

        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }

    if let Some(stderr) = stderr {
        tokio::spawn(log_stderr(stderr));
    }

    info!("System ssh tunnel ready on {}", bound_addr);

    Ok(SystemTunnel { child, bound_addr })
}

async fn read_stderr(stderr: Option<ChildStderr>) -> String {
    let mut output = String::new();
    if let Some(mut stderr) = stderr {
        let _ = stderr.read_to_string(&mut output).await;
    }
    output
}

async fn log_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!("ssh: {}", line);
    }
}
