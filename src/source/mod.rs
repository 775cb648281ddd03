//! Item Sources
//!
//! Where incoming reports come from: an IMAP mailbox (usually reached through
//! the SSH tunnel), a shared directory filled by another process, or the same
//! kind of directory on the mail host read over SFTP.

mod directory;
mod imap;
mod metadata;
mod sftp;

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::mail::MailError;

pub use directory::DirectorySource;
pub use imap::{ImapSource, ImapSourceConfig};
pub use sftp::SftpSource;

/// Attachment content, either already in memory or on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentPayload {
    Bytes(Vec<u8>),
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Name as announced by the sender, unsanitised
    pub filename: String,
    pub payload: AttachmentPayload,
}

/// One message (or metadata record) carrying attachments
#[derive(Debug, Clone)]
pub struct IncomingItem {
    /// Stable identifier used to skip already processed items
    pub id: String,
    pub sender: String,
    pub subject: String,
    pub attachments: Vec<Attachment>,
}

#[async_trait]
pub trait MailSource: Send {
    /// Fetch items whose id is not in `processed`. Polling alone never marks
    /// anything as handled on the source side.
    async fn poll(&mut self, processed: &HashSet<String>) -> Result<Vec<IncomingItem>, MailError>;

    /// Record on the source that `id` was fully handled
    async fn acknowledge(&mut self, _id: &str) -> Result<(), MailError> {
        Ok(())
    }

    /// Drop any open connection; the next poll reconnects
    async fn reset(&mut self) {}

    /// Human readable description for logs
    fn describe(&self) -> String;
}
