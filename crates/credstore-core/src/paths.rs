use std::path::PathBuf;

use directories::ProjectDirs;

use crate::error::{Result, StoreError};

pub const APP_QUALIFIER: &str = "org";
pub const APP_ORG: &str = "credstore";
pub const APP_NAME: &str = "credstore";

pub const SETTINGS_FILE: &str = "settings.json";
/// Subdirectory of the data directory holding the `.db`/`.bin` pairs.
pub const DATABASES_DIR: &str = "src";

/// Per-user data directory, e.g. `~/.local/share/credstore` on Linux.
pub fn data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| StoreError::Internal("cannot determine data directory".into()))?;
    Ok(dirs.data_dir().to_path_buf())
}
