//! Persistent settings for the CLI host

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::auth::ConfigureRequest;

/// Client configuration saved between runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application (client) ID registered with the identity provider
    pub client_id: Option<String>,
    /// Authority URL, e.g. `https://login.microsoftonline.com/<tenant>`
    pub authority: Option<String>,
    pub redirect_uri: Option<String>,
    /// Scopes requested on login
    pub scopes: Vec<String>,
    pub known_authorities: Vec<String>,
    pub token_expiration_buffer_secs: Option<u64>,
    pub guard_for_rerenders: bool,
}

impl Settings {
    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "msal-bridge", "msal-bridge")
            .context("Could not determine config directory")
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Directory holding the encrypted token store
    pub fn data_dir() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.data_dir().to_path_buf())
    }

    /// Load settings from disk
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save settings to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.client_id.is_some() && self.authority.is_some()
    }

    pub fn to_request(&self) -> ConfigureRequest {
        ConfigureRequest {
            client_id: self.client_id.clone(),
            authority: self.authority.clone(),
            redirect_uri: self.redirect_uri.clone(),
            scopes: Some(self.scopes.clone()),
            known_authorities: self.known_authorities.clone(),
            token_expiration_buffer_secs: self.token_expiration_buffer_secs,
            guard_for_rerenders: self.guard_for_rerenders,
        }
    }
}
