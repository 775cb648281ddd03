//! `<name>_metadata.json` records written by the mail collector

use std::time::SystemTime;

use serde::Deserialize;
use tracing::{debug, info};

pub(super) const METADATA_SUFFIX: &str = "_metadata.json";

#[derive(Debug, Deserialize)]
pub(super) struct MessageMetadata {
    #[serde(rename = "type", default = "unknown")]
    pub kind: String,
    #[serde(default = "unknown")]
    pub from: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentMetadata>,
}

#[derive(Debug, Deserialize)]
pub(super) struct AttachmentMetadata {
    pub filename: String,
    /// File name inside the shared directory
    pub saved_as: String,
}

fn unknown() -> String {
    "unknown".to_string()
}

pub(super) fn is_metadata_file(name: &str) -> bool {
    name.ends_with(METADATA_SUFFIX)
}

/// False for records modified before `since`. A missing mtime counts as new.
pub(super) fn is_fresh(name: &str, modified: Option<SystemTime>, since: Option<SystemTime>) -> bool {
    match (modified, since) {
        (Some(modified), Some(since)) if modified < since => {
            debug!("Skipping {} from before startup", name);
            false
        }
        _ => true,
    }
}

impl MessageMetadata {
    pub fn parse(contents: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(contents)
    }

    pub fn log(&self, name: &str) {
        info!(
            "Message {:?}: type {}, from {}, subject {:?}, company {}",
            name,
            self.kind,
            self.from,
            self.subject,
            self.company.as_deref().unwrap_or("-")
        );
    }
}
