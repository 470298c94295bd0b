//! Credential persistence.
//!
//! Streams read credentials before logging in and write the refreshed
//! session token back right after a successful (re-)login. The concrete
//! implementation rewrites the YAML configuration file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::debug;

use super::{AccountCredentials, AppConfig};
use crate::error::{Error, Result};

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Current credentials of `account`, if it is configured.
    fn credentials(&self, account: &str) -> Option<AccountCredentials>;

    /// Replace the session token of `account` in memory.
    fn set_token(&self, account: &str, token: String) -> Result<()>;

    /// Flush pending changes to durable storage.
    async fn save(&self) -> Result<()>;
}

/// YAML configuration file acting as the credential store.
#[derive(Debug)]
pub struct ConfigFile {
    path: PathBuf,
    config: RwLock<AppConfig>,
    /// Serializes snapshot, write and rename so a newer document is never
    /// replaced by an older one.
    write_lock: Mutex<()>,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>, config: AppConfig) -> Self {
        Self {
            path: path.into(),
            config: RwLock::new(config),
            write_lock: Mutex::new(()),
        }
    }

    /// Read and validate the document at `path`.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = AppConfig::from_yaml(&source)?;
        Ok(Self::new(path, config))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current document.
    pub fn snapshot(&self) -> AppConfig {
        self.config.read().clone()
    }
}

#[async_trait]
impl CredentialStore for ConfigFile {
    fn credentials(&self, account: &str) -> Option<AccountCredentials> {
        self.config.read().accounts.get(account).cloned()
    }

    fn set_token(&self, account: &str, token: String) -> Result<()> {
        let mut config = self.config.write();
        let entry = config
            .accounts
            .get_mut(account)
            .ok_or_else(|| Error::StreamNotFound(account.to_string()))?;
        entry.token = Some(token);
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let yaml = {
            let config = self.config.read();
            serde_yaml::to_string(&*config)?
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write atomically using a temp file
        let temp_path = self.path.with_extension("yaml.tmp");
        tokio::fs::write(&temp_path, yaml).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        debug!(path = %self.path.display(), "Configuration saved");
        Ok(())
    }
}
