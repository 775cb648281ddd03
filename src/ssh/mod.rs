//! SSH module - authenticated connections for port forwarding
//!
//! Built on the russh client. One [`SshClient::connect`] call yields a
//! handle that is moved into a single owner task; everything else talks to it
//! through a [`HandleController`].

mod client;
mod config;
mod error;
mod handle_owner;
#[cfg(test)]
pub(crate) mod test_server;

pub use client::{fingerprint, ClientHandler, SshClient};
pub use config::{AuthMethod, HostKeyPolicy, SshConfig};
pub use error::ForwardError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
