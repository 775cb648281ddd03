//! IMAP mailbox source

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use super::{Attachment, AttachmentPayload, IncomingItem, MailSource};
use crate::mail::{parse_message, tls, ImapClient, MailError, MailStream, TlsOptions};

const ID_PREFIX: &str = "imap:";

#[derive(Debug, Clone)]
pub struct ImapSourceConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub mailbox: String,
    pub timeout: Duration,
    pub tls: Option<TlsOptions>,
}

/// Polls unseen messages of one mailbox, keeping the session between polls.
///
/// Messages are fetched without touching `\Seen`; the flag is set by
/// [`MailSource::acknowledge`] once the message was handled.
pub struct ImapSource {
    config: ImapSourceConfig,
    client: Option<ImapClient<MailStream>>,
    connector: Option<TlsConnector>,
}

fn item_id(uid: u32) -> String {
    format!("{}{}", ID_PREFIX, uid)
}

impl ImapSource {
    pub fn new(config: ImapSourceConfig) -> Self {
        Self {
            config,
            client: None,
            connector: None,
        }
    }

    fn tls_connector(&mut self) -> Result<Option<(TlsConnector, String)>, MailError> {
        let Some(options) = &self.config.tls else {
            return Ok(None);
        };
        let connector = match &self.connector {
            Some(connector) => connector.clone(),
            None => {
                let connector = tls::connector(options)?;
                self.connector = Some(connector.clone());
                connector
            }
        };
        Ok(Some((connector, options.server_name.clone())))
    }

    async fn session(&mut self) -> Result<&mut ImapClient<MailStream>, MailError> {
        if self.client.is_none() {
            let tls = self.tls_connector()?;
            let mut client = ImapClient::connect(
                &self.config.host,
                self.config.port,
                self.config.timeout,
                tls.as_ref().map(|(connector, name)| (connector, name.as_str())),
            )
            .await?;
            client
                .login(&self.config.username, &self.config.password)
                .await?;
            info!(
                "Logged in to {}:{} as {}",
                self.config.host, self.config.port, self.config.username
            );
            self.client = Some(client);
        }
        self.client
            .as_mut()
            .ok_or_else(|| MailError::Connect("IMAP session unavailable".into()))
    }

    async fn fetch_unseen(
        &mut self,
        processed: &HashSet<String>,
    ) -> Result<Vec<IncomingItem>, MailError> {
        let mailbox = self.config.mailbox.clone();
        let client = self.session().await?;
        client.select(&mailbox).await?;

        let unseen = client.search_unseen().await?;
        debug!("{} unseen messages in {}", unseen.len(), mailbox);

        let mut items = Vec::new();
        for uid in unseen {
            let id = item_id(uid);
            if processed.contains(&id) {
                continue;
            }

            let raw = client.fetch_message(uid).await?;
            let message = parse_message(&raw);
            debug!(
                "Message {} from {:?}: {:?}, {} attachment(s)",
                uid,
                message.from,
                message.subject,
                message.attachments.len()
            );

            items.push(IncomingItem {
                id,
                sender: message.from,
                subject: message.subject,
                attachments: message
                    .attachments
                    .into_iter()
                    .map(|a| Attachment {
                        filename: a.filename,
                        payload: AttachmentPayload::Bytes(a.data),
                    })
                    .collect(),
            });
        }
        Ok(items)
    }
}

#[async_trait]
impl MailSource for ImapSource {
    async fn poll(&mut self, processed: &HashSet<String>) -> Result<Vec<IncomingItem>, MailError> {
        let result = self.fetch_unseen(processed).await;
        if let Err(e) = &result {
            warn!("IMAP poll failed, dropping session: {}", e);
            self.client = None;
        }
        result
    }

    async fn acknowledge(&mut self, id: &str) -> Result<(), MailError> {
        let uid = id
            .strip_prefix(ID_PREFIX)
            .and_then(|uid| uid.parse().ok())
            .ok_or_else(|| MailError::Protocol(format!("Not an IMAP item id: {}", id)))?;

        let result = match self.session().await {
            Ok(client) => client.mark_seen(uid).await,
            Err(e) => Err(e),
        };
        match &result {
            Ok(()) => debug!("Marked message {} as seen", uid),
            Err(e) => {
                warn!("Failed to mark message {} as seen: {}", uid, e);
                self.client = None;
            }
        }
        result
    }

    async fn reset(&mut self) {
        if let Some(client) = self.client.take() {
            client.logout().await;
        }
    }

    fn describe(&self) -> String {
        format!(
            "imap{}://{}@{}:{}/{}",
            if self.config.tls.is_some() { "s" } else { "" },
            self.config.username,
            self.config.host,
            self.config.port,
            self.config.mailbox
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn message(name: &str) -> String {
        format!(
            "From: bank@financepro.ru\r\n\
Subject: daily\r\n\
Content-Type: multipart/mixed; boundary=x\r\n\
\r\n\
--x\r\n\
Content-Disposition: attachment; filename=\"{}\"\r\n\
\r\n\
cells\r\n\
--x--\r\n",
            name
        )
    }

    /// Server-side view of the mailbox: message per UID plus its \Seen flag
    #[derive(Default)]
    struct Mailbox {
        messages: BTreeMap<u32, (String, bool)>,
        /// UIDs whose next FETCH answers NO
        failing_fetches: HashSet<u32>,
        fetch_commands: Vec<String>,
    }

    /// IMAP server over `mailbox` accepting any number of sessions
    async fn spawn_mailbox(mailbox: Arc<Mutex<Mailbox>>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let mailbox = mailbox.clone();
                tokio::spawn(async move {
                    let mut socket = BufReader::new(socket);
                    socket.get_mut().write_all(b"* OK ready\r\n").await.unwrap();
                    loop {
                        let mut line = String::new();
                        if socket.read_line(&mut line).await.unwrap_or(0) == 0 {
                            return;
                        }
                        let (tag, command) = line.trim_end().split_once(' ').unwrap();
                        let reply = answer(&mut mailbox.lock(), tag, command);
                        if socket.get_mut().write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    fn answer(mailbox: &mut Mailbox, tag: &str, command: &str) -> String {
        let words: Vec<&str> = command.split_whitespace().collect();
        match words.as_slice() {
            ["SELECT", ..] => format!("* {} EXISTS\r\n{} OK\r\n", mailbox.messages.len(), tag),
            ["UID", "SEARCH", "UNSEEN"] => {
                let unseen: Vec<String> = mailbox
                    .messages
                    .iter()
                    .filter(|(_, (_, seen))| !seen)
                    .map(|(uid, _)| uid.to_string())
                    .collect();
                format!("* SEARCH {}\r\n{} OK\r\n", unseen.join(" "), tag)
            }
            ["UID", "FETCH", uid, item] => {
                mailbox.fetch_commands.push(command.to_string());
                let uid: u32 = uid.parse().unwrap();
                if mailbox.failing_fetches.remove(&uid) {
                    return format!("{} NO temporary failure\r\n", tag);
                }
                let (body, seen) = mailbox.messages.get_mut(&uid).unwrap();
                if !item.contains("PEEK") {
                    *seen = true;
                }
                format!(
                    "* {} FETCH (UID {} BODY[] {{{}}}\r\n{})\r\n{} OK\r\n",
                    uid,
                    uid,
                    body.len(),
                    body,
                    tag
                )
            }
            ["UID", "STORE", uid, "+FLAGS.SILENT", _] => {
                let uid: u32 = uid.parse().unwrap();
                if let Some((_, seen)) = mailbox.messages.get_mut(&uid) {
                    *seen = true;
                }
                format!("{} OK\r\n", tag)
            }
            _ => format!("{} OK\r\n", tag),
        }
    }

    fn source_for(addr: std::net::SocketAddr) -> ImapSource {
        ImapSource::new(ImapSourceConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            username: "operator1@financepro.ru".into(),
            password: "1q2w#E$R".into(),
            mailbox: "INBOX".into(),
            timeout: Duration::from_secs(5),
            tls: None,
        })
    }

    fn mailbox_with(uids: &[u32]) -> Arc<Mutex<Mailbox>> {
        let mut mailbox = Mailbox::default();
        for uid in uids {
            mailbox
                .messages
                .insert(*uid, (message(&format!("daily{}.xlsx", uid)), false));
        }
        Arc::new(Mutex::new(mailbox))
    }

    fn ids(items: &[IncomingItem]) -> Vec<&str> {
        items.iter().map(|item| item.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_poll_skips_processed_ids() {
        let mailbox = mailbox_with(&[1, 2]);
        let mut source = source_for(spawn_mailbox(mailbox).await);

        let processed: HashSet<String> = ["imap:1".to_string()].into_iter().collect();
        let items = source.poll(&processed).await.unwrap();

        assert_eq!(ids(&items), vec!["imap:2"]);
        assert_eq!(items[0].subject, "daily");
        assert_eq!(
            items[0].attachments,
            vec![Attachment {
                filename: "daily2.xlsx".into(),
                payload: AttachmentPayload::Bytes(b"cells".to_vec()),
            }]
        );
        assert!(source.describe().starts_with("imap://"));
        source.reset().await;
    }

    #[tokio::test]
    async fn test_failed_fetch_loses_no_message() {
        let mailbox = mailbox_with(&[1, 2]);
        mailbox.lock().failing_fetches.insert(2);
        let mut source = source_for(spawn_mailbox(mailbox.clone()).await);

        let err = source.poll(&HashSet::new()).await.unwrap_err();
        assert!(matches!(err, MailError::Command(_)), "{err}");

        // Message 1 was fetched before the failure and must come back
        let items = source.poll(&HashSet::new()).await.unwrap();
        assert_eq!(ids(&items), vec!["imap:1", "imap:2"]);
        assert!(mailbox
            .lock()
            .fetch_commands
            .iter()
            .all(|command| command.ends_with("BODY.PEEK[]")));

        for item in &items {
            source.acknowledge(&item.id).await.unwrap();
        }
        assert!(source.poll(&HashSet::new()).await.unwrap().is_empty());
        assert!(mailbox.lock().messages.values().all(|(_, seen)| *seen));
    }

    #[tokio::test]
    async fn test_unacknowledged_message_stays_unseen() {
        let mailbox = mailbox_with(&[5]);
        let mut source = source_for(spawn_mailbox(mailbox.clone()).await);

        assert_eq!(ids(&source.poll(&HashSet::new()).await.unwrap()), vec!["imap:5"]);
        source.reset().await;
        assert_eq!(ids(&source.poll(&HashSet::new()).await.unwrap()), vec!["imap:5"]);
        assert!(!mailbox.lock().messages[&5].1);
    }

    #[tokio::test]
    async fn test_acknowledge_rejects_foreign_ids() {
        let mut source = source_for(spawn_mailbox(mailbox_with(&[])).await);
        let err = source.acknowledge("/srv/mail/a_metadata.json").await.unwrap_err();
        assert!(matches!(err, MailError::Protocol(_)), "{err}");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connect_error() {
        let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = spare.local_addr().unwrap().port();
        drop(spare);

        let mut source = ImapSource::new(ImapSourceConfig {
            host: "127.0.0.1".into(),
            port,
            username: "u".into(),
            password: "p".into(),
            mailbox: "INBOX".into(),
            timeout: Duration::from_secs(2),
            tls: None,
        });
        let err = source.poll(&HashSet::new()).await.unwrap_err();
        assert!(matches!(err, MailError::Connect(_)), "{err}");
    }
}
