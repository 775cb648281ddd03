//! Attachment Materializer
//!
//! Turns attachments into files in the download directory. Names are reduced
//! to a safe character set and never overwrite an existing file. Cleanup only
//! ever removes files the materializer wrote itself.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::source::{Attachment, AttachmentPayload};

/// Upper bound on `name_N.ext` attempts
const MAX_NAME_ATTEMPTS: u32 = 10_000;

#[derive(Error, Debug)]
pub enum MaterializeError {
    #[error("Failed to prepare download directory {path:?}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("No free file name for {0:?}")]
    NoFreeName(PathBuf),

    #[error("Failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Attachment source {path:?} unreadable: {source}")]
    Source {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Keep alphanumerics and `.-_ `; an empty result becomes
/// `attachment_<item>_<unix time>`.
pub fn sanitize_filename(filename: &str, item_id: &str) -> String {
    let safe: String = filename
        .chars()
        .filter(|c| c.is_alphanumeric() || ".-_ ".contains(*c))
        .collect();
    let safe = safe.trim();

    // "." and ".." survive the filter but are not file names
    if safe.is_empty() || safe.chars().all(|c| c == '.') {
        let item: String = item_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        format!("attachment_{}_{}", item, chrono::Utc::now().timestamp())
    } else {
        safe.to_string()
    }
}

/// `report.xlsx` -> `report_3.xlsx`
fn numbered_name(name: &str, n: u32) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_{}{}", &name[..dot], n, &name[dot..]),
        _ => format!("{}_{}", name, n),
    }
}

pub struct Materializer {
    download_dir: PathBuf,
    /// Files written by `materialize` with their save time
    saved: Mutex<Vec<(PathBuf, SystemTime)>>,
}

impl Materializer {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            saved: Mutex::new(Vec::new()),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    async fn ensure_dir(&self) -> Result<(), MaterializeError> {
        fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|source| MaterializeError::Directory {
                path: self.download_dir.clone(),
                source,
            })
    }

    /// Create a new file for `name`, numbering it on collision
    async fn create_unique(&self, name: &str) -> Result<(File, PathBuf), MaterializeError> {
        for n in 0..MAX_NAME_ATTEMPTS {
            let candidate = if n == 0 {
                name.to_string()
            } else {
                numbered_name(name, n)
            };
            let path = self.download_dir.join(&candidate);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((file, path)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(MaterializeError::Write { path, source }),
            }
        }
        Err(MaterializeError::NoFreeName(self.download_dir.join(name)))
    }

    /// Write one attachment and return its final path
    pub async fn materialize(
        &self,
        item_id: &str,
        attachment: &Attachment,
    ) -> Result<PathBuf, MaterializeError> {
        self.ensure_dir().await?;

        let name = sanitize_filename(&attachment.filename, item_id);
        let (mut file, path) = self.create_unique(&name).await?;

        let written = match &attachment.payload {
            AttachmentPayload::Bytes(data) => file.write_all(data).await.map(|_| data.len() as u64),
            AttachmentPayload::File(source_path) => {
                let mut source = match File::open(source_path).await {
                    Ok(source) => source,
                    Err(source) => {
                        drop(file);
                        let _ = fs::remove_file(&path).await;
                        return Err(MaterializeError::Source {
                            path: source_path.clone(),
                            source,
                        });
                    }
                };
                tokio::io::copy(&mut source, &mut file).await
            }
        };

        let written = match written {
            Ok(n) => n,
            Err(source) => {
                drop(file);
                let _ = fs::remove_file(&path).await;
                return Err(MaterializeError::Write { path, source });
            }
        };
        file.flush()
            .await
            .map_err(|source| MaterializeError::Write {
                path: path.clone(),
                source,
            })?;

        info!("Saved attachment {:?} ({} bytes)", path, written);
        self.saved.lock().push((path.clone(), SystemTime::now()));
        Ok(path)
    }

    /// Remove files this materializer saved more than `max_age` ago; returns
    /// how many were removed. Other files in the directory are never touched.
    pub async fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let expired: Vec<PathBuf> = {
            let mut saved = self.saved.lock();
            let (expired, kept): (Vec<_>, Vec<_>) = saved
                .drain(..)
                .partition(|(_, saved_at)| *saved_at < cutoff);
            *saved = kept;
            expired.into_iter().map(|(path, _)| path).collect()
        };

        let mut removed = 0;
        for path in expired {
            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("Removed old file {:?}", path);
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("{:?} already gone", path);
                }
                Err(e) => {
                    warn!("Failed to remove {:?}: {}", path, e);
                    self.saved.lock().push((path, SystemTime::UNIX_EPOCH));
                }
            }
        }

        if removed > 0 {
            info!("Cleaned up {} old file(s) in {:?}", removed, self.download_dir);
        }
        removed
    }

    /// Files saved and not yet cleaned up
    pub fn tracked_count(&self) -> usize {
        self.saved.lock().len()
    }
}
