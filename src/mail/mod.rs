//! Mail access: a minimal IMAP client, TLS and MIME attachment extraction

pub mod imap;
pub mod mime;
pub mod tls;

use thiserror::Error;

pub use imap::ImapClient;
pub use mime::{parse_message, MimeAttachment, ParsedMessage};
pub use tls::{MailStream, TlsOptions};

#[derive(Error, Debug)]
pub enum MailError {
    #[error("Mail server connection failed: {0}")]
    Connect(String),

    #[error("Mail login rejected: {0}")]
    Authentication(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Mail command failed: {0}")]
    Command(String),

    #[error("Mail protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MailError {
    /// A retry with the same settings cannot succeed
    pub fn is_fatal(&self) -> bool {
        matches!(self, MailError::Authentication(_))
    }
}
