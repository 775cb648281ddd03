//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::config::{AuthMethod, HostKeyPolicy, SshConfig};
use super::error::ForwardError;

/// Establishes one authenticated SSH connection
pub struct SshClient {
    config: SshConfig,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Connect and authenticate. The configured timeout bounds both steps.
    pub async fn connect(self) -> Result<Handle<ClientHandler>, ForwardError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);

        if !self.config.auth.is_native() {
            return Err(ForwardError::Authentication(
                "No password or key configured; the system ssh client must be used".to_string(),
            ));
        }

        info!("Connecting to SSH server at {}", addr);

        let timeout = Duration::from_secs(self.config.timeout_secs);
        match tokio::time::timeout(timeout, self.establish(&addr)).await {
            Ok(result) => result,
            Err(_) => Err(ForwardError::Connect(format!(
                "Connection to {} timed out after {}s",
                addr, self.config.timeout_secs
            ))),
        }
    }

    async fn establish(&self, addr: &str) -> Result<Handle<ClientHandler>, ForwardError> {
        let socket_addr = tokio::net::lookup_host(addr)
            .await
            .map_err(|e| ForwardError::Connect(format!("Failed to resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| ForwardError::Connect(format!("No address found for {}", addr)))?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.config.host_key.clone(),
        );

        let mut handle = client::connect(Arc::new(ssh_config), socket_addr, handler)
            .await
            .map_err(|e| match e {
                ForwardError::Connect(_) => e,
                other => ForwardError::Connect(other.to_string()),
            })?;

        debug!("SSH handshake completed");

        let authenticated = match &self.config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&self.config.username, password)
                .await
                .map_err(|e| ForwardError::Authentication(e.to_string()))?,
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|e| ForwardError::Key(format!("{}: {}", key_path, e)))?;

                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(|e| ForwardError::Authentication(e.to_string()))?
            }
            AuthMethod::System => {
                return Err(ForwardError::Authentication(
                    "System ssh client credentials cannot be used in-process".to_string(),
                ));
            }
        };

        if !authenticated.success() {
            return Err(ForwardError::Authentication(format!(
                "Authentication rejected by server for user {}",
                self.config.username
            )));
        }

        info!("SSH authentication successful for {}@{}", self.config.username, addr);

        Ok(handle)
    }
}

/// Compute the OpenSSH-style SHA256 fingerprint of a public key
pub fn fingerprint(key: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Client handler for russh callbacks
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, policy: HostKeyPolicy) -> Self {
        Self { host, port, policy }
    }
}

impl client::Handler for ClientHandler {
    type Error = ForwardError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let actual = fingerprint(server_public_key);

        match &self.policy {
            HostKeyPolicy::AcceptAny => {
                debug!(
                    "Accepting host key for {}:{} (fingerprint: {})",
                    self.host, self.port, actual
                );
                Ok(true)
            }
            HostKeyPolicy::Pinned { fingerprint: expected } if *expected == actual => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyPolicy::Pinned { fingerprint: expected } => {
                warn!(
                    "Host key mismatch for {}:{}: expected {}, got {}",
                    self.host, self.port, expected, actual
                );
                Err(ForwardError::Connect(format!(
                    "Host key verification failed for {}:{}. Expected: {}, Actual: {}",
                    self.host, self.port, expected, actual
                )))
            }
        }
    }
}
