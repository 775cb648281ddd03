//! SSH Configuration

use serde::{Deserialize, Serialize};

/// SSH connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Connect + authenticate timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Host key acceptance policy
    #[serde(default)]
    pub host_key: HostKeyPolicy,

    /// Program used for [`AuthMethod::System`] (default: `ssh`)
    #[serde(default = "default_client_program")]
    pub client_program: String,
}

/// Authentication methods supported
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },

    /// No credential: delegate to the platform's own ssh client, which picks
    /// up keys and agent configuration by itself
    System,
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }

    /// Whether this method is handled by the in-process SSH client
    pub fn is_native(&self) -> bool {
        !matches!(self, AuthMethod::System)
    }
}

/// Host key verification policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept whatever key the server presents
    #[default]
    AcceptAny,
    /// Accept only the key with this `SHA256:...` fingerprint
    Pinned { fingerprint: String },
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    10
}

fn default_client_program() -> String {
    "ssh".to_string()
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            auth: AuthMethod::System,
            timeout_secs: 10,
            host_key: HostKeyPolicy::AcceptAny,
            client_program: default_client_program(),
        }
    }
}
