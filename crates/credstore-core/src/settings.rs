use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{IoContext, Result, StoreError};
use crate::paths::{DATABASES_DIR, SETTINGS_FILE};
use crate::token::TokenPolicy;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirySettings {
    /// Maximum token age in seconds; absent means tokens never expire.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub max_clock_skew_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Directory holding the database files. Defaults to `<data dir>/src`.
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
    #[serde(default)]
    pub expiry: ExpirySettings,
}

impl StoreSettings {
    /// Reads `settings.json` from `data_dir`, falling back to defaults when
    /// the file does not exist.
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(SETTINGS_FILE);
        if !path.exists() {
            debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(Self::default());
        }
        let bytes = fs::read(&path).io_context(|| format!("read {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Corrupted(format!("settings {}: {e}", path.display())))
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        fs::create_dir_all(data_dir).io_context(|| format!("create {}", data_dir.display()))?;
        let path = data_dir.join(SETTINGS_FILE);
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| StoreError::Internal(format!("encode settings: {e}")))?;
        fs::write(&path, data).io_context(|| format!("write {}", path.display()))
    }

    pub fn storage_dir_in(&self, data_dir: &Path) -> PathBuf {
        self.storage_dir
            .clone()
            .unwrap_or_else(|| data_dir.join(DATABASES_DIR))
    }

    pub fn token_policy(&self) -> TokenPolicy {
        TokenPolicy {
            ttl: self.expiry.ttl_secs.map(Duration::from_secs),
            max_clock_skew: self.expiry.max_clock_skew_secs.map(Duration::from_secs),
        }
    }
}
