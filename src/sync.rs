use crate::config::SyncConfig;
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0} has no file name")]
    NoFileName(String),
    #[error("failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },
    #[error("{binary} exited with {status}: {stderr}")]
    Failed {
        binary: String,
        status: String,
        stderr: String,
    },
}

/// Uploads a local file, overwriting the remote copy
#[async_trait]
pub trait CloudSync: Send + Sync {
    async fn sync(&self, path: &Path) -> Result<(), SyncError>;
}

/// `rclone copyto <file> <remote>/<file name>`
pub struct RcloneSync {
    binary: String,
    remote: String,
}

impl RcloneSync {
    pub fn new(binary: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            remote: remote.into(),
        }
    }

    /// `None` when no remote is configured
    pub fn from_config(config: &SyncConfig) -> Option<Self> {
        config
            .rclone_remote
            .as_ref()
            .map(|remote| Self::new(&config.rclone_binary, remote))
    }

    pub fn destination(&self, path: &Path) -> Result<String, SyncError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SyncError::NoFileName(path.display().to_string()))?;

        // `gdrive:` (remote root) takes no separator
        let remote = self.remote.trim_end_matches('/');
        Ok(if remote.ends_with(':') {
            format!("{remote}{name}")
        } else {
            format!("{remote}/{name}")
        })
    }
}

#[async_trait]
impl CloudSync for RcloneSync {
    async fn sync(&self, path: &Path) -> Result<(), SyncError> {
        let destination = self.destination(path)?;
        debug!("Running {} copyto {} {}", self.binary, path.display(), destination);

        let output = Command::new(&self.binary)
            .arg("copyto")
            .arg(path)
            .arg(&destination)
            .output()
            .await
            .map_err(|source| SyncError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(SyncError::Failed {
                binary: self.binary.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!("Synced {} to {}", path.display(), destination);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_joins_remote_and_file_name() {
        let path = Path::new("/home/pi/tracker/properties.csv");
        assert_eq!(
            RcloneSync::new("rclone", "gdrive:houses/").destination(path).unwrap(),
            "gdrive:houses/properties.csv"
        );
        assert_eq!(
            RcloneSync::new("rclone", "gdrive:").destination(path).unwrap(),
            "gdrive:properties.csv"
        );
        assert!(RcloneSync::new("rclone", "gdrive:").destination(Path::new("/")).is_err());
    }

    #[test]
    fn unset_remote_disables_sync() {
        let config = SyncConfig {
            rclone_binary: "rclone".to_string(),
            rclone_remote: None,
        };
        assert!(RcloneSync::from_config(&config).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reports_tool_failures() {
        let path = Path::new("properties.csv");
        assert!(RcloneSync::new("true", "remote:").sync(path).await.is_ok());
        assert!(matches!(
            RcloneSync::new("false", "remote:").sync(path).await,
            Err(SyncError::Failed { .. })
        ));
        assert!(matches!(
            RcloneSync::new("/nonexistent/rclone", "remote:").sync(path).await,
            Err(SyncError::Spawn { .. })
        ));
    }
}
