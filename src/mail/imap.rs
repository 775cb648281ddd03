//! Async IMAP client
//!
//! Just enough IMAP4rev1 to poll a mailbox: greeting, LOGIN, SELECT,
//! UID SEARCH UNSEEN, UID FETCH BODY.PEEK[], UID STORE and LOGOUT. Runs over
//! any byte stream, which is how the tunnel's local endpoint, a direct
//! connection and a TLS session look the same.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use super::tls::{handshake, MailStream};
use super::MailError;

/// Largest literal accepted from the server
pub const MAX_LITERAL_SIZE: usize = 64 * 1024 * 1024;

/// One logical server response: the line text (continuations after literals
/// appended) plus any `{n}` literals it carried.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub text: String,
    pub literals: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    No,
    Bad,
}

/// Status word of "A0001 OK ..." / "* OK ..." lines
fn parse_status(rest: &str) -> Option<Status> {
    let word = rest.split_whitespace().next()?;
    match word.to_ascii_uppercase().as_str() {
        "OK" => Some(Status::Ok),
        "NO" => Some(Status::No),
        "BAD" => Some(Status::Bad),
        _ => None,
    }
}

/// `{123}` at the end of a line announces a literal of 123 bytes
fn literal_size(line: &str) -> Option<usize> {
    let body = line.strip_suffix('}')?;
    let open = body.rfind('{')?;
    body[open + 1..].trim_end_matches('+').parse().ok()
}

/// Quote a string argument
fn quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

pub struct ImapClient<S> {
    stream: BufReader<S>,
    next_tag: u32,
}

impl ImapClient<MailStream> {
    /// Connect, optionally run the TLS handshake for `tls_name`, and read the
    /// greeting
    pub async fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        tls: Option<(&TlsConnector, &str)>,
    ) -> Result<Self, MailError> {
        let addr = format!("{}:{}", host, port);
        info!("Connecting to IMAP server at {}", addr);

        let tcp = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| MailError::Connect(format!("{} timed out", addr)))?
            .map_err(|e| MailError::Connect(format!("{}: {}", addr, e)))?;

        let stream = match tls {
            Some((connector, tls_name)) => {
                tokio::time::timeout(timeout, handshake(connector, tls_name, tcp))
                    .await
                    .map_err(|_| MailError::Tls(format!("Handshake with {} timed out", addr)))??
            }
            None => MailStream::Plain(tcp),
        };

        tokio::time::timeout(timeout, Self::from_stream(stream))
            .await
            .map_err(|_| MailError::Connect(format!("{} sent no greeting", addr)))?
    }
}

impl<S> ImapClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an established stream and consume the server greeting
    pub async fn from_stream(stream: S) -> Result<Self, MailError> {
        let mut client = Self {
            stream: BufReader::new(stream),
            next_tag: 1,
        };

        let greeting = client.read_response().await?;
        let rest = greeting.text.strip_prefix("* ").unwrap_or("");
        let upper = rest.to_ascii_uppercase();
        if upper.starts_with("OK") || upper.starts_with("PREAUTH") {
            debug!("IMAP greeting: {}", greeting.text);
            Ok(client)
        } else {
            Err(MailError::Protocol(format!(
                "Unexpected greeting: {}",
                greeting.text
            )))
        }
    }

    async fn read_response(&mut self) -> Result<Response, MailError> {
        let mut response = Response::default();
        loop {
            let mut raw = Vec::new();
            let n = self.stream.read_until(b'\n', &mut raw).await?;
            if n == 0 {
                return Err(MailError::Protocol("Connection closed by server".into()));
            }
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);
            response.text.push_str(line);

            match literal_size(line) {
                Some(size) if size > MAX_LITERAL_SIZE => {
                    return Err(MailError::Protocol(format!(
                        "Literal of {} bytes exceeds the {} byte limit",
                        size, MAX_LITERAL_SIZE
                    )));
                }
                Some(size) => {
                    let mut literal = vec![0u8; size];
                    self.stream.read_exact(&mut literal).await?;
                    response.literals.push(literal);
                }
                None => return Ok(response),
            }
        }
    }

    /// Send a tagged command, collect untagged responses until the tagged one
    async fn command(&mut self, command: &str) -> Result<Vec<Response>, MailError> {
        let tag = format!("A{:04}", self.next_tag);
        self.next_tag += 1;

        let line = format!("{} {}\r\n", tag, command);
        let stream = self.stream.get_mut();
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await?;

        let mut untagged = Vec::new();
        loop {
            let response = self.read_response().await?;
            let Some(rest) = response
                .text
                .strip_prefix(tag.as_str())
                .and_then(|r| r.strip_prefix(' '))
            else {
                untagged.push(response);
                continue;
            };

            return match parse_status(rest) {
                Some(Status::Ok) => Ok(untagged),
                Some(Status::No) | Some(Status::Bad) => Err(MailError::Command(rest.to_string())),
                None => Err(MailError::Protocol(response.text)),
            };
        }
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<(), MailError> {
        debug!("IMAP LOGIN {}", username);
        self.command(&format!("LOGIN {} {}", quote(username), quote(password)))
            .await
            .map(|_| ())
            .map_err(|e| match e {
                MailError::Command(reason) => MailError::Authentication(reason),
                other => other,
            })
    }

    /// Select a mailbox, returning its message count
    pub async fn select(&mut self, mailbox: &str) -> Result<u32, MailError> {
        let responses = self.command(&format!("SELECT {}", quote(mailbox))).await?;
        let exists = responses
            .iter()
            .filter_map(|r| {
                let mut words = r.text.split_whitespace();
                match (words.next(), words.next(), words.next()) {
                    (Some("*"), Some(n), Some(kw)) if kw.eq_ignore_ascii_case("EXISTS") => {
                        n.parse().ok()
                    }
                    _ => None,
                }
            })
            .last()
            .unwrap_or(0);
        debug!("Selected {} ({} messages)", mailbox, exists);
        Ok(exists)
    }

    /// UIDs of messages without the \Seen flag
    pub async fn search_unseen(&mut self) -> Result<Vec<u32>, MailError> {
        let responses = self.command("UID SEARCH UNSEEN").await?;
        Ok(responses
            .iter()
            .filter_map(|r| {
                let rest = r.text.strip_prefix("* ")?;
                let (keyword, ids) = rest.split_once(' ').unwrap_or((rest, ""));
                keyword.eq_ignore_ascii_case("SEARCH").then_some(ids)
            })
            .flat_map(|ids| ids.split_whitespace().filter_map(|id| id.parse().ok()))
            .collect())
    }

    /// Full message by UID. Leaves the \Seen flag untouched.
    pub async fn fetch_message(&mut self, uid: u32) -> Result<Vec<u8>, MailError> {
        let responses = self
            .command(&format!("UID FETCH {} BODY.PEEK[]", uid))
            .await?;
        responses
            .into_iter()
            .find(|r| r.text.to_ascii_uppercase().contains("FETCH") && !r.literals.is_empty())
            .and_then(|r| r.literals.into_iter().next())
            .ok_or_else(|| MailError::Protocol(format!("FETCH {} returned no message body", uid)))
    }

    pub async fn mark_seen(&mut self, uid: u32) -> Result<(), MailError> {
        self.command(&format!("UID STORE {} +FLAGS.SILENT (\\Seen)", uid))
            .await
            .map(|_| ())
    }

    /// Best effort; the connection is dropped afterwards either way
    pub async fn logout(mut self) {
        if let Err(e) = self.command("LOGOUT").await {
            debug!("LOGOUT failed: {}", e);
        }
    }
}
