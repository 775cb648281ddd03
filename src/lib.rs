//! MailTunnel - mailbox automation for back-office operators
//!
//! Exposes a remote IMAP server on a local port through an SSH local forward,
//! polls it for new messages, saves their attachments and opens spreadsheets
//! so their macros can run.

pub mod automation;
pub mod config;
pub mod forwarding;
pub mod launcher;
pub mod mail;
pub mod materialize;
pub mod source;
pub mod ssh;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` overrides the default `info`.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
