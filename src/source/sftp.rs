//! Remote-directory source over SFTP
//!
//! Same `<name>_metadata.json` layout as [`super::DirectorySource`], read
//! from a directory on the mail host. The SSH connection is kept between
//! polls and rebuilt after an error.

use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::StatusCode;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

use super::metadata::{is_fresh, is_metadata_file, MessageMetadata};
use super::{Attachment, AttachmentPayload, IncomingItem, MailSource};
use crate::mail::MailError;
use crate::ssh::{spawn_handle_owner_task, ForwardError, HandleController, SshClient, SshConfig};

const ID_PREFIX: &str = "sftp:";

/// SSH failures as seen by the poller; a rejected login stays fatal
fn ssh_error(err: ForwardError) -> MailError {
    match err {
        ForwardError::Authentication(reason) | ForwardError::Key(reason) => {
            MailError::Authentication(reason)
        }
        other => MailError::Connect(other.to_string()),
    }
}

fn sftp_error(path: &str, err: SftpError) -> MailError {
    MailError::Command(format!("{}: {}", path, err))
}

fn is_not_found(err: &SftpError) -> bool {
    matches!(err, SftpError::Status(status) if matches!(status.status_code, StatusCode::NoSuchFile))
}

fn join_remote(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

struct RemoteSession {
    controller: HandleController,
    sftp: SftpSession,
}

pub struct SftpSource {
    ssh: SshConfig,
    dir: String,
    since: Option<SystemTime>,
    session: Option<RemoteSession>,
}

impl SftpSource {
    pub fn new(ssh: SshConfig, dir: impl Into<String>) -> Self {
        Self {
            ssh,
            dir: dir.into(),
            since: None,
            session: None,
        }
    }

    /// Ignore metadata files last modified before `since`
    pub fn skip_older_than(mut self, since: SystemTime) -> Self {
        self.since = Some(since);
        self
    }

    async fn session(&mut self) -> Result<&SftpSession, MailError> {
        if self.session.is_none() {
            info!(
                "Opening SFTP session {}@{}:{}",
                self.ssh.username, self.ssh.host, self.ssh.port
            );
            let handle = SshClient::new(self.ssh.clone())
                .connect()
                .await
                .map_err(ssh_error)?;
            let controller = spawn_handle_owner_task(handle, uuid::Uuid::new_v4().to_string());

            match open_sftp(&controller).await {
                Ok(sftp) => self.session = Some(RemoteSession { controller, sftp }),
                Err(e) => {
                    controller.disconnect().await;
                    return Err(e);
                }
            }
        }
        self.session
            .as_ref()
            .map(|session| &session.sftp)
            .ok_or_else(|| MailError::Connect("SFTP session unavailable".into()))
    }

    async fn list_new(&mut self, processed: &HashSet<String>) -> Result<Vec<IncomingItem>, MailError> {
        let dir = self.dir.clone();
        let since = self.since;
        let sftp = self.session().await?;

        let entries = match sftp.read_dir(dir.as_str()).await {
            Ok(entries) => entries,
            Err(e) if is_not_found(&e) => {
                warn!("Remote directory {} does not exist", dir);
                return Ok(Vec::new());
            }
            Err(e) => return Err(sftp_error(&dir, e)),
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| {
                let name = entry.file_name();
                if !is_metadata_file(&name) {
                    return None;
                }
                let modified = entry
                    .metadata()
                    .mtime
                    .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(u64::from(secs)));
                is_fresh(&name, modified, since).then_some(name)
            })
            .collect();
        names.sort();

        let mut items = Vec::new();
        for name in names {
            let path = join_remote(&dir, &name);
            let id = format!("{}{}", ID_PREFIX, path);
            if processed.contains(&id) {
                continue;
            }
            if let Some(item) = load_item(sftp, &dir, &path, id).await? {
                items.push(item);
            }
        }
        debug!("{} new item(s) in {}", items.len(), dir);
        Ok(items)
    }
}

async fn open_sftp(controller: &HandleController) -> Result<SftpSession, MailError> {
    let channel = controller.open_session_channel().await.map_err(ssh_error)?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| MailError::Protocol(format!("SFTP subsystem unavailable: {}", e)))?;
    SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| MailError::Protocol(format!("SFTP init failed: {}", e)))
}

/// `Ok(None)` when the server refuses the file (missing, no permission)
async fn read_remote(sftp: &SftpSession, path: &str) -> Result<Option<Vec<u8>>, MailError> {
    let mut file = match sftp.open(path).await {
        Ok(file) => file,
        Err(SftpError::Status(status)) => {
            debug!("Cannot open {}: {:?}", path, status.status_code);
            return Ok(None);
        }
        Err(e) => return Err(sftp_error(path, e)),
    };
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)
        .await
        .map_err(|e| MailError::Command(format!("{}: {}", path, e)))?;
    Ok(Some(contents))
}

/// `Ok(None)` for records that cannot be read or parsed; a lost connection is
/// an error
async fn load_item(
    sftp: &SftpSession,
    dir: &str,
    path: &str,
    id: String,
) -> Result<Option<IncomingItem>, MailError> {
    let Some(contents) = read_remote(sftp, path).await? else {
        error!("Failed to read {}", path);
        return Ok(None);
    };
    let metadata = match MessageMetadata::parse(&String::from_utf8_lossy(&contents)) {
        Ok(metadata) => metadata,
        Err(e) => {
            error!("Malformed metadata {}: {}", path, e);
            return Ok(None);
        }
    };
    metadata.log(path);

    let mut attachments = Vec::new();
    for attachment in metadata.attachments {
        let stored = join_remote(dir, &attachment.saved_as);
        match read_remote(sftp, &stored).await? {
            Some(data) => attachments.push(Attachment {
                filename: attachment.filename,
                payload: AttachmentPayload::Bytes(data),
            }),
            None => warn!("Attachment file {} is missing, skipping", stored),
        }
    }

    Ok(Some(IncomingItem {
        id,
        sender: metadata.from,
        subject: metadata.subject,
        attachments,
    }))
}

#[async_trait]
impl MailSource for SftpSource {
    async fn poll(&mut self, processed: &HashSet<String>) -> Result<Vec<IncomingItem>, MailError> {
        let result = self.list_new(processed).await;
        if let Err(e) = &result {
            warn!("SFTP poll failed, dropping session: {}", e);
            self.reset().await;
        }
        result
    }

    async fn reset(&mut self) {
        if let Some(session) = self.session.take() {
            drop(session.sftp);
            session.controller.disconnect().await;
        }
    }

    fn describe(&self) -> String {
        format!(
            "sftp://{}@{}:{}{}",
            self.ssh.username, self.ssh.host, self.ssh.port, self.dir
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::test_server::{spawn_sftp_server, RemoteFile, TEST_PASSWORD};

    const DIR: &str = "/home/iux/mail/sent_attachments";

    fn file(contents: &str, mtime: SystemTime) -> RemoteFile {
        RemoteFile {
            data: contents.as_bytes().to_vec(),
            mtime: mtime
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap()
                .as_secs() as u32,
        }
    }

    #[tokio::test]
    async fn test_poll_reads_remote_metadata() {
        let now = SystemTime::now();
        let server = spawn_sftp_server(vec![
            (
                format!("{}/msg1_metadata.json", DIR),
                file(
                    r#"{"type": "report", "from": "bank@financepro.ru", "subject": "Daily",
                        "attachments": [
                            {"filename": "report.xlsm", "saved_as": "1700000000_report.xlsm"},
                            {"filename": "gone.xls", "saved_as": "gone.xls"}
                        ]}"#,
                    now,
                ),
            ),
            (format!("{}/1700000000_report.xlsm", DIR), file("macro book", now)),
            (format!("{}/notes.txt", DIR), file("ignored", now)),
        ])
        .await;

        let mut source = SftpSource::new(server.client_config(TEST_PASSWORD), DIR);
        let items = source.poll(&HashSet::new()).await.unwrap();

        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.id, format!("sftp:{}/msg1_metadata.json", DIR));
        assert_eq!(item.sender, "bank@financepro.ru");
        assert_eq!(
            item.attachments,
            vec![Attachment {
                filename: "report.xlsm".into(),
                payload: AttachmentPayload::Bytes(b"macro book".to_vec()),
            }]
        );

        let processed: HashSet<String> = [item.id.clone()].into_iter().collect();
        assert!(source.poll(&processed).await.unwrap().is_empty());
        assert!(source.describe().ends_with(DIR));
        source.reset().await;
    }

    #[tokio::test]
    async fn test_records_from_before_startup_are_skipped() {
        let now = SystemTime::now();
        let server = spawn_sftp_server(vec![
            (
                format!("{}/old_metadata.json", DIR),
                file(r#"{"subject": "old"}"#, now - Duration::from_secs(3600)),
            ),
            (
                format!("{}/new_metadata.json", DIR),
                file(r#"{"subject": "new"}"#, now + Duration::from_secs(60)),
            ),
        ])
        .await;

        let mut source =
            SftpSource::new(server.client_config(TEST_PASSWORD), DIR).skip_older_than(now);
        let items = source.poll(&HashSet::new()).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].subject, "new");
    }

    #[tokio::test]
    async fn test_missing_remote_directory_is_empty() {
        let server = spawn_sftp_server(Vec::new()).await;
        let mut source = SftpSource::new(server.client_config(TEST_PASSWORD), "/nowhere");
        assert!(source.poll(&HashSet::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_password_is_fatal() {
        let server = spawn_sftp_server(Vec::new()).await;
        let mut source = SftpSource::new(server.client_config("wrong"), DIR);
        let err = source.poll(&HashSet::new()).await.unwrap_err();
        assert!(err.is_fatal(), "{err}");
    }
}
