//! Configuration Management Module
//!
//! One JSON document describes where mail comes from, how the SSH tunnel to
//! the mail host is set up and what happens to downloaded attachments.

pub mod storage;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::forwarding::{ForwardSession, LocalForward};
use crate::launcher::DEFAULT_SPREADSHEET_EXTENSIONS;
use crate::ssh::{AuthMethod, HostKeyPolicy, SshConfig};

pub use storage::{config_dir, default_config_file, ConfigStorage, StorageError};

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub source: SourceConfig,

    /// Where attachments are written (default: the user's Downloads)
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Open spreadsheets right after download
    #[serde(default = "default_true")]
    pub auto_open: bool,

    #[serde(default = "default_spreadsheet_extensions")]
    pub spreadsheet_extensions: Vec<String>,

    /// Program used instead of the platform opener
    #[serde(default)]
    pub opener: Option<String>,

    /// Delete downloaded files older than this many minutes
    #[serde(default)]
    pub cleanup_after_minutes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    Imap {
        host: String,
        /// 143, or 993 with `tls`
        #[serde(default)]
        port: Option<u16>,
        username: String,
        password: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        /// Implicit TLS (IMAPS)
        #[serde(default)]
        tls: bool,
        #[serde(default = "default_true")]
        tls_verify_cert: bool,
        /// PEM file with extra trusted CA certificates
        #[serde(default)]
        tls_ca_file: Option<PathBuf>,
        /// Reach the server through an SSH local forward
        #[serde(default)]
        tunnel: Option<TunnelConfig>,
    },
    Directory {
        path: PathBuf,
        /// Also pick up records written before startup
        #[serde(default)]
        include_existing: bool,
    },
    Sftp(SftpConfig),
}

/// Metadata directory on the mail host, read over SFTP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Absolute path of the remote directory
    pub path: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
    #[serde(default)]
    pub include_existing: bool,
}

/// SSH tunnel to the mail host. Without `password` and `key_path` the
/// platform's ssh client is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    #[serde(default = "default_remote_host")]
    pub remote_host: String,
    #[serde(default = "default_imap_port")]
    pub remote_port: u16,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// `SHA256:...`; any host key is accepted when unset
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
    #[serde(default = "default_client_program")]
    pub client_program: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("Downloads"))
}

fn default_check_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_spreadsheet_extensions() -> Vec<String> {
    DEFAULT_SPREADSHEET_EXTENSIONS
        .iter()
        .map(|e| e.to_string())
        .collect()
}

fn default_imap_port() -> u16 {
    143
}

fn default_imaps_port() -> u16 {
    993
}

/// Port of the IMAP server when none is configured
pub fn imap_port(port: Option<u16>, tls: bool) -> u16 {
    port.unwrap_or_else(if tls { default_imaps_port } else { default_imap_port })
}

fn host_key_policy(fingerprint: &Option<String>) -> HostKeyPolicy {
    match fingerprint {
        Some(fingerprint) => HostKeyPolicy::Pinned {
            fingerprint: fingerprint.clone(),
        },
        None => HostKeyPolicy::AcceptAny,
    }
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_local_port() -> u16 {
    1430
}

fn default_remote_host() -> String {
    "localhost".to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_client_program() -> String {
    "ssh".to_string()
}

impl TunnelConfig {
    pub fn auth(&self) -> AuthMethod {
        match (&self.key_path, &self.password) {
            (Some(key_path), _) => AuthMethod::key(key_path.clone(), self.passphrase.clone()),
            (None, Some(password)) => AuthMethod::password(password.clone()),
            (None, None) => AuthMethod::System,
        }
    }

    pub fn to_session(&self) -> ForwardSession {
        let ssh = SshConfig {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            auth: self.auth(),
            timeout_secs: self.timeout_secs,
            host_key: host_key_policy(&self.host_key_fingerprint),
            client_program: self.client_program.clone(),
        };
        let forward = LocalForward::loopback(self.local_port, &self.remote_host, self.remote_port);
        ForwardSession::new(ssh, forward)
    }
}

impl SftpConfig {
    /// None without a password or key; SFTP needs the built-in client
    pub fn auth(&self) -> Option<AuthMethod> {
        match (&self.key_path, &self.password) {
            (Some(key_path), _) => Some(AuthMethod::key(key_path.clone(), self.passphrase.clone())),
            (None, Some(password)) => Some(AuthMethod::password(password.clone())),
            (None, None) => None,
        }
    }

    pub fn to_ssh(&self) -> Result<SshConfig, ConfigError> {
        let auth = self.auth().ok_or_else(|| {
            ConfigError::Invalid("SFTP source needs a password or key_path".into())
        })?;
        Ok(SshConfig {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            auth,
            timeout_secs: self.timeout_secs,
            host_key: host_key_policy(&self.host_key_fingerprint),
            ..Default::default()
        })
    }
}

impl AppConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn cleanup_after(&self) -> Option<Duration> {
        self.cleanup_after_minutes
            .map(|minutes| Duration::from_secs(minutes.saturating_mul(60)))
    }

    pub fn tunnel(&self) -> Option<&TunnelConfig> {
        match &self.source {
            SourceConfig::Imap { tunnel, .. } => tunnel.as_ref(),
            SourceConfig::Directory { .. } | SourceConfig::Sftp(_) => None,
        }
    }

    /// Reject settings that would only fail later at runtime
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "check_interval_secs must be at least 1".into(),
            ));
        }
        match &self.source {
            SourceConfig::Imap {
                host,
                username,
                tunnel,
                ..
            } => {
                if host.trim().is_empty() || username.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "IMAP host and username are required".into(),
                    ));
                }
                if let Some(tunnel) = tunnel {
                    if tunnel.host.trim().is_empty() || tunnel.username.trim().is_empty() {
                        return Err(ConfigError::Invalid(
                            "Tunnel host and username are required".into(),
                        ));
                    }
                    if tunnel.local_port == 0 {
                        return Err(ConfigError::Invalid(
                            "Tunnel local_port must not be 0".into(),
                        ));
                    }
                }
            }
            SourceConfig::Directory { path, .. } => {
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::Invalid("Source directory is empty".into()));
                }
            }
            SourceConfig::Sftp(sftp) => {
                if sftp.host.trim().is_empty() || sftp.username.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "SFTP host and username are required".into(),
                    ));
                }
                if !sftp.path.starts_with('/') {
                    return Err(ConfigError::Invalid(format!(
                        "SFTP path must be absolute: {:?}",
                        sftp.path
                    )));
                }
                sftp.to_ssh()?;
            }
        }
        Ok(())
    }

    /// Starting point written by `mailtunnel init`
    pub fn sample() -> Self {
        Self {
            source: SourceConfig::Imap {
                host: "127.0.0.1".into(),
                port: Some(default_local_port()),
                username: "operator1@example.com".into(),
                password: "change-me".into(),
                mailbox: default_mailbox(),
                tls: false,
                tls_verify_cert: true,
                tls_ca_file: None,
                tunnel: Some(TunnelConfig {
                    host: "mail.example.com".into(),
                    port: default_ssh_port(),
                    username: "operator".into(),
                    password: None,
                    key_path: None,
                    passphrase: None,
                    local_port: default_local_port(),
                    remote_host: default_remote_host(),
                    remote_port: default_imap_port(),
                    timeout_secs: default_timeout(),
                    host_key_fingerprint: None,
                    client_program: default_client_program(),
                }),
            },
            download_dir: default_download_dir(),
            check_interval_secs: default_check_interval(),
            auto_open: true,
            spreadsheet_extensions: default_spreadsheet_extensions(),
            opener: None,
            cleanup_after_minutes: None,
        }
    }
}
