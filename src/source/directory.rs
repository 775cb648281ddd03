//! Shared-directory source
//!
//! Another process (the mail collector container) drops one
//! `<name>_metadata.json` per message next to the saved attachment files.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, error, warn};

use super::metadata::{is_fresh, is_metadata_file, MessageMetadata};
use super::{Attachment, AttachmentPayload, IncomingItem, MailSource};
use crate::mail::MailError;

pub struct DirectorySource {
    dir: PathBuf,
    /// Records modified before this are ignored
    since: Option<SystemTime>,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            since: None,
        }
    }

    /// Ignore metadata files last modified before `since`
    pub fn skip_older_than(mut self, since: SystemTime) -> Self {
        self.since = Some(since);
        self
    }

    async fn metadata_files(&self) -> Result<Vec<PathBuf>, MailError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Source directory {:?} does not exist", self.dir);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !is_metadata_file(name) {
                continue;
            }
            let modified = entry.metadata().await.and_then(|m| m.modified()).ok();
            if is_fresh(name, modified, self.since) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn load_item(&self, path: &Path) -> Option<IncomingItem> {
        let contents = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) => {
                error!("Failed to read {:?}: {}", path, e);
                return None;
            }
        };
        let metadata = match MessageMetadata::parse(&contents) {
            Ok(metadata) => metadata,
            Err(e) => {
                error!("Malformed metadata {:?}: {}", path, e);
                return None;
            }
        };
        metadata.log(&path.file_name().unwrap_or_default().to_string_lossy());

        let mut attachments = Vec::new();
        for attachment in metadata.attachments {
            let stored = self.dir.join(&attachment.saved_as);
            if fs::metadata(&stored).await.is_err() {
                warn!("Attachment file {:?} is missing, skipping", stored);
                continue;
            }
            attachments.push(Attachment {
                filename: attachment.filename,
                payload: AttachmentPayload::File(stored),
            });
        }

        Some(IncomingItem {
            id: path.to_string_lossy().into_owned(),
            sender: metadata.from,
            subject: metadata.subject,
            attachments,
        })
    }
}

#[async_trait]
impl MailSource for DirectorySource {
    async fn poll(&mut self, processed: &HashSet<String>) -> Result<Vec<IncomingItem>, MailError> {
        let mut items = Vec::new();
        for path in self.metadata_files().await? {
            if processed.contains(path.to_string_lossy().as_ref()) {
                continue;
            }
            if let Some(item) = self.load_item(&path).await {
                items.push(item);
            }
        }
        debug!("{} new item(s) in {:?}", items.len(), self.dir);
        Ok(items)
    }

    fn describe(&self) -> String {
        format!("directory {}", self.dir.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_poll_reads_metadata_and_skips_missing_files() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("1700000000_report.xlsx"), b"sheet").unwrap();
        std::fs::write(
            temp.path().join("msg1_metadata.json"),
            r#"{
                "type": "report",
                "from": "bank@financepro.ru",
                "subject": "Daily",
                "company": "FinancePro",
                "attachments": [
                    { "filename": "report.xlsx", "saved_as": "1700000000_report.xlsx" },
                    { "filename": "gone.xls", "saved_as": "gone.xls" }
                ]
            }"#,
        )
        .unwrap();
        std::fs::write(temp.path().join("notes.json"), "{}").unwrap();

        let mut source = DirectorySource::new(temp.path());
        let items = source.poll(&HashSet::new()).await.unwrap();

        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.sender, "bank@financepro.ru");
        assert_eq!(item.subject, "Daily");
        assert_eq!(
            item.attachments,
            vec![Attachment {
                filename: "report.xlsx".into(),
                payload: AttachmentPayload::File(temp.path().join("1700000000_report.xlsx")),
            }]
        );

        let processed: HashSet<String> = [item.id.clone()].into_iter().collect();
        assert!(source.poll(&processed).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_metadata_is_skipped() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("bad_metadata.json"), "{ not json").unwrap();
        std::fs::write(temp.path().join("ok_metadata.json"), r#"{"subject": "s"}"#).unwrap();

        let items = DirectorySource::new(temp.path())
            .poll(&HashSet::new())
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].sender, "unknown");
        assert!(items[0].attachments.is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let temp = tempdir().unwrap();
        let mut source = DirectorySource::new(temp.path().join("absent"));
        assert!(source.poll(&HashSet::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_records_from_before_startup_are_skipped() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("old_metadata.json"), r#"{"subject": "old"}"#).unwrap();

        let started = SystemTime::now() + std::time::Duration::from_secs(1);
        let mut source = DirectorySource::new(temp.path()).skip_older_than(started);
        assert!(source.poll(&HashSet::new()).await.unwrap().is_empty());

        // Without the filter the old record is picked up
        let mut everything = DirectorySource::new(temp.path());
        assert_eq!(everything.poll(&HashSet::new()).await.unwrap().len(), 1);
    }
}

