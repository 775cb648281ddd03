//! Operator Automation
//!
//! Polls the configured source, saves attachments into the download
//! directory and opens spreadsheets. When the mailbox sits behind an SSH
//! tunnel the tunnel is health-checked before every cycle and rebuilt when
//! it went away.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{imap_port, AppConfig, ConfigError, SourceConfig};
use crate::forwarding::LocalPortForwarder;
use crate::launcher::{LaunchError, SpreadsheetLauncher};
use crate::mail::{MailError, TlsOptions};
use crate::materialize::{MaterializeError, Materializer};
use crate::source::{
    DirectorySource, ImapSource, ImapSourceConfig, IncomingItem, MailSource, SftpSource,
};
use crate::ssh::ForwardError;

const IMAP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum AutomationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Tunnel error: {0}")]
    Forward(#[from] ForwardError),

    #[error(transparent)]
    Mail(#[from] MailError),

    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

pub struct Automation {
    config: AppConfig,
    source: Box<dyn MailSource>,
    forwarder: Option<LocalPortForwarder>,
    materializer: Materializer,
    launcher: SpreadsheetLauncher,
    /// Ids of items with at least one saved attachment
    processed: HashSet<String>,
}

/// Outcome of handling one item
struct ItemOutcome {
    paths: Vec<PathBuf>,
    /// Every attachment was saved
    complete: bool,
}

impl Automation {
    pub fn new(config: AppConfig) -> Result<Self, AutomationError> {
        config.validate()?;

        let started = SystemTime::now();
        let (source, forwarder): (Box<dyn MailSource>, Option<LocalPortForwarder>) =
            match &config.source {
                SourceConfig::Imap {
                    host,
                    port,
                    username,
                    password,
                    mailbox,
                    tls,
                    tls_verify_cert,
                    tls_ca_file,
                    tunnel,
                } => {
                    // Through a tunnel the server is reached at the forward's local end
                    let (address, port) = match tunnel {
                        Some(tunnel) => ("127.0.0.1".to_string(), tunnel.local_port),
                        None => (host.clone(), imap_port(*port, *tls)),
                    };
                    let tls = tls.then(|| TlsOptions {
                        server_name: host.clone(),
                        verify_cert: *tls_verify_cert,
                        ca_file: tls_ca_file.clone(),
                    });
                    let source = ImapSource::new(ImapSourceConfig {
                        host: address,
                        port,
                        username: username.clone(),
                        password: password.clone(),
                        mailbox: mailbox.clone(),
                        timeout: IMAP_TIMEOUT,
                        tls,
                    });
                    let forwarder = tunnel
                        .as_ref()
                        .map(|tunnel| LocalPortForwarder::new(tunnel.to_session()));
                    (Box::new(source), forwarder)
                }
                SourceConfig::Directory {
                    path,
                    include_existing,
                } => {
                    let mut source = DirectorySource::new(path.clone());
                    if !include_existing {
                        source = source.skip_older_than(started);
                    }
                    (Box::new(source), None)
                }
                SourceConfig::Sftp(sftp) => {
                    let mut source = SftpSource::new(sftp.to_ssh()?, sftp.path.clone());
                    if !sftp.include_existing {
                        source = source.skip_older_than(started);
                    }
                    (Box::new(source), None)
                }
            };

        Ok(Self {
            materializer: Materializer::new(config.download_dir.clone()),
            launcher: SpreadsheetLauncher::new(
                config.spreadsheet_extensions.clone(),
                config.opener.clone(),
            ),
            config,
            source,
            forwarder,
            processed: HashSet::new(),
        })
    }

    /// Bring up the tunnel, if any. Every failure here is terminal.
    pub async fn start(&mut self) -> Result<(), AutomationError> {
        info!("Mail source: {}", self.source.describe());
        info!("Download directory: {:?}", self.materializer.download_dir());
        if let Some(forwarder) = &mut self.forwarder {
            forwarder.start().await?;
        }
        Ok(())
    }

    /// One poll: returns the paths of all files saved in this pass
    pub async fn run_once(&mut self) -> Result<Vec<PathBuf>, AutomationError> {
        if let Some(max_age) = self.config.cleanup_after() {
            let removed = self.materializer.cleanup_older_than(max_age).await;
            if removed > 0 {
                info!("Removed {} old download(s)", removed);
            }
        }

        let items = self.source.poll(&self.processed).await?;
        if items.is_empty() {
            debug!("No new messages");
            return Ok(Vec::new());
        }
        info!("{} new message(s)", items.len());

        let mut saved = Vec::new();
        for item in items {
            let outcome = self.process_item(&item).await;
            if outcome.complete {
                // A message left unacknowledged is offered again after a restart
                if let Err(e) = self.source.acknowledge(&item.id).await {
                    warn!("Could not mark {} as handled: {}", item.id, e);
                }
            }
            if outcome.paths.is_empty() {
                info!("No attachments saved for {}", item.id);
            } else {
                self.processed.insert(item.id);
                saved.extend(outcome.paths);
            }
        }
        Ok(saved)
    }

    async fn process_item(&self, item: &IncomingItem) -> ItemOutcome {
        info!(
            "Processing {} from {:?}: {:?} ({} attachment(s))",
            item.id,
            item.sender,
            item.subject,
            item.attachments.len()
        );

        let mut paths = Vec::new();
        let mut complete = true;
        for attachment in &item.attachments {
            let path = match self.materializer.materialize(&item.id, attachment).await {
                Ok(path) => path,
                Err(e) => {
                    error!("Failed to save {:?}: {}", attachment.filename, e);
                    complete = false;
                    continue;
                }
            };

            if self.config.auto_open && self.launcher.is_spreadsheet(&path) {
                if let Err(e) = self.launcher.open(&path).await {
                    error!("{}", e);
                }
            }
            paths.push(path);
        }
        ItemOutcome { paths, complete }
    }

    /// Verify the tunnel and rebuild it when the check fails.
    ///
    /// Returns false when the tunnel is still down after a retryable error;
    /// the caller should skip this cycle.
    pub async fn ensure_tunnel(&mut self) -> Result<bool, AutomationError> {
        let Some(forwarder) = &mut self.forwarder else {
            return Ok(true);
        };
        if forwarder.check().await {
            return Ok(true);
        }

        warn!("SSH tunnel is down, reconnecting");
        self.source.reset().await;
        forwarder.stop().await;

        match forwarder.start().await {
            Ok(addr) => {
                info!("SSH tunnel restored on {}", addr);
                Ok(true)
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!("SSH tunnel reconnect failed, retrying next cycle: {}", e);
                Ok(false)
            }
        }
    }

    async fn cycle(&mut self) -> Result<(), AutomationError> {
        if !self.ensure_tunnel().await? {
            return Ok(());
        }
        match self.run_once().await {
            Ok(saved) => {
                if !saved.is_empty() {
                    info!("Saved {} file(s)", saved.len());
                }
                Ok(())
            }
            Err(AutomationError::Mail(e)) if e.is_fatal() => Err(AutomationError::Mail(e)),
            Err(e) => {
                warn!("Poll failed, retrying next cycle: {}", e);
                Ok(())
            }
        }
    }

    /// Poll every `check_interval` until `shutdown` fires. The tunnel is
    /// stopped on the way out, also after a terminal error.
    pub async fn run_continuous(
        &mut self,
        shutdown: CancellationToken,
    ) -> Result<(), AutomationError> {
        info!(
            "Continuous mode, checking every {}s",
            self.config.check_interval_secs
        );
        let interval = self.config.check_interval();

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                result = self.cycle() => {
                    if let Err(e) = result {
                        break Err(e);
                    }
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }
        };

        self.shutdown().await;
        result
    }

    pub async fn shutdown(&mut self) {
        self.source.reset().await;
        if let Some(forwarder) = &mut self.forwarder {
            forwarder.stop().await;
        }
        info!("Automation stopped");
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }
}
