//! Spreadsheet Launcher
//!
//! Opens downloaded workbooks with the desktop's default application so their
//! macros run:
//! - **Windows**: `cmd /C start "" <path>`
//! - **macOS**: `open <path>`
//! - **Linux/other**: `xdg-open <path>`

use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tracing::{error, info};

pub const DEFAULT_SPREADSHEET_EXTENSIONS: &[&str] = &["xls", "xlsx", "xlsm"];

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("File not found: {0:?}")]
    NotFound(PathBuf),

    #[error("Failed to launch '{program}' for {path:?}: {source}")]
    Spawn {
        program: String,
        path: PathBuf,
        source: std::io::Error,
    },
}

pub struct SpreadsheetLauncher {
    extensions: Vec<String>,
    /// Replaces the platform opener when set
    opener: Option<String>,
}

impl Default for SpreadsheetLauncher {
    fn default() -> Self {
        Self::new(
            DEFAULT_SPREADSHEET_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            None,
        )
    }
}

impl SpreadsheetLauncher {
    pub fn new(extensions: Vec<String>, opener: Option<String>) -> Self {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            opener,
        }
    }

    /// Extension check, case-insensitive
    pub fn is_spreadsheet(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .is_some_and(|e| self.extensions.iter().any(|known| *known == e))
    }

    /// Program and arguments that open `path`
    pub fn opener_command(&self, path: &Path) -> (String, Vec<String>) {
        let target = path.to_string_lossy().into_owned();
        if let Some(opener) = &self.opener {
            return (opener.clone(), vec![target]);
        }

        #[cfg(target_os = "windows")]
        {
            (
                "cmd".to_string(),
                vec!["/C".into(), "start".into(), String::new(), target],
            )
        }
        #[cfg(target_os = "macos")]
        {
            ("open".to_string(), vec![target])
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            ("xdg-open".to_string(), vec![target])
        }
    }

    /// Hand the file to the opener without waiting for it
    pub async fn open(&self, path: &Path) -> Result<(), LaunchError> {
        if tokio::fs::metadata(path).await.is_err() {
            error!("Cannot open {:?}: file not found", path);
            return Err(LaunchError::NotFound(path.to_path_buf()));
        }

        let (program, args) = self.opener_command(path);
        info!("Opening {:?} with {}", path, program);

        let mut child = tokio::process::Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: program.clone(),
                path: path.to_path_buf(),
                source,
            })?;

        // Reap in the background
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_spreadsheet() {
        let launcher = SpreadsheetLauncher::default();
        assert!(launcher.is_spreadsheet(Path::new("report.xlsx")));
        assert!(launcher.is_spreadsheet(Path::new("/tmp/Macro.XLSM")));
        assert!(launcher.is_spreadsheet(Path::new("old.xls")));
        assert!(!launcher.is_spreadsheet(Path::new("data.csv")));
        assert!(!launcher.is_spreadsheet(Path::new("xlsx")));

        let custom = SpreadsheetLauncher::new(vec![".ODS".into()], None);
        assert!(custom.is_spreadsheet(Path::new("a.ods")));
        assert!(!custom.is_spreadsheet(Path::new("a.xlsx")));
    }

    #[test]
    fn test_opener_override() {
        let launcher = SpreadsheetLauncher::new(vec!["xls".into()], Some("libreoffice".into()));
        let (program, args) = launcher.opener_command(Path::new("/data/a.xls"));
        assert_eq!(program, "libreoffice");
        assert_eq!(args, vec!["/data/a.xls".to_string()]);
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let err = SpreadsheetLauncher::default()
            .open(Path::new("/nonexistent/report.xlsx"))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::NotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_open_spawns_opener() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("report.xlsx");
        std::fs::write(&file, b"x").unwrap();

        let launcher = SpreadsheetLauncher::new(vec!["xlsx".into()], Some("true".into()));
        launcher.open(&file).await.unwrap();

        let broken = SpreadsheetLauncher::new(vec![], Some("/nonexistent/opener".into()));
        assert!(matches!(
            broken.open(&file).await,
            Err(LaunchError::Spawn { .. })
        ));
    }
}
