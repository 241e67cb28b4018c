//! Persisted language server configuration
//!
//! Installed servers are recorded in a JSON manifest keyed by language.
//! Statically configured servers from the user config are layered on top.

use crate::config::{ServerOverride, UserConfig};
use crate::types::{LanguageServerBinary, LspError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Manifest tracking installed LSP servers
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct InstallManifest {
    pub servers: HashMap<String, InstalledServer>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InstalledServer {
    pub package: String,
    pub version: String,
    pub install_date: String,
    pub binary: LanguageServerBinary,
    pub install_method: String,
    pub enabled: bool,
}

/// Resolved launch configuration for one language.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub binary: LanguageServerBinary,
    pub enabled: bool,
    pub initialization_options: Option<serde_json::Value>,
    pub settings: Option<serde_json::Value>,
}

pub struct ServerConfigs {
    manifest_path: PathBuf,
    manifest: RwLock<InstallManifest>,
    overrides: HashMap<String, ServerOverride>,
}

impl ServerConfigs {
    /// Load the manifest at `manifest_path`, starting empty when it is missing
    /// or unreadable.
    pub fn load(manifest_path: impl Into<PathBuf>, user: &UserConfig) -> Result<Self, LspError> {
        let manifest_path = manifest_path.into();

        let manifest = if manifest_path.exists() {
            let content = std::fs::read_to_string(&manifest_path)?;
            match serde_json::from_str(&content) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!("Ignoring corrupt manifest {}: {}", manifest_path.display(), e);
                    InstallManifest::default()
                }
            }
        } else {
            InstallManifest::default()
        };
        info!(
            "Loaded {} installed server(s) from {}",
            manifest.servers.len(),
            manifest_path.display()
        );

        Ok(Self {
            manifest_path,
            manifest: RwLock::new(manifest),
            overrides: user.servers.clone(),
        })
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Launch configuration for a language, if any is known.
    pub async fn get(&self, language: &str) -> Option<ServerConfig> {
        let manifest = self.manifest.read().await;
        let installed = manifest.servers.get(language);
        let user = self.overrides.get(language);

        let mut binary = match (user.and_then(|o| o.command.as_ref()), installed) {
            (Some(command), _) => LanguageServerBinary::new(command),
            (None, Some(installed)) => installed.binary.clone(),
            (None, None) => return None,
        };

        if let Some(args) = user.and_then(|o| o.args.as_ref()) {
            binary.args = args.clone();
        }
        if let Some(user) = user {
            binary.env.extend(user.env.clone());
        }

        let enabled = user
            .and_then(|o| o.enabled)
            .unwrap_or_else(|| installed.map_or(true, |i| i.enabled));

        debug!("Resolved server config for {}: {:?}", language, binary.path);
        Some(ServerConfig {
            binary,
            enabled,
            initialization_options: user.and_then(|o| o.initialization_options.clone()),
            settings: user.and_then(|o| o.settings.clone()),
        })
    }

    /// Record a successful install and write the manifest back.
    pub async fn register(&self, language: &str, server: InstalledServer) -> Result<(), LspError> {
        self.register_all(vec![(language.to_string(), server)]).await
    }

    /// Record one install under several languages with a single manifest
    /// write. Nothing changes, on disk or in memory, when the write fails.
    pub async fn register_all(
        &self,
        entries: Vec<(String, InstalledServer)>,
    ) -> Result<(), LspError> {
        let mut manifest = self.manifest.write().await;
        let mut updated = InstallManifest {
            servers: manifest.servers.clone(),
        };
        updated.servers.extend(entries);
        Self::save(&self.manifest_path, &updated)?;
        *manifest = updated;
        Ok(())
    }

    /// Enable or disable an installed server. Returns false when nothing is
    /// installed for the language.
    pub async fn set_enabled(&self, language: &str, enabled: bool) -> Result<bool, LspError> {
        let mut manifest = self.manifest.write().await;
        let mut updated = InstallManifest {
            servers: manifest.servers.clone(),
        };
        let Some(server) = updated.servers.get_mut(language) else {
            return Ok(false);
        };
        server.enabled = enabled;
        Self::save(&self.manifest_path, &updated)?;
        *manifest = updated;
        Ok(true)
    }

    /// List all installed servers
    pub async fn list_installed(&self) -> Vec<(String, InstalledServer)> {
        let manifest = self.manifest.read().await;
        let mut servers: Vec<_> = manifest
            .servers
            .iter()
            .map(|(lang, server)| (lang.clone(), server.clone()))
            .collect();
        servers.sort_by(|a, b| a.0.cmp(&b.0));
        servers
    }

    fn save(path: &Path, manifest: &InstallManifest) -> Result<(), LspError> {
        let content = serde_json::to_string_pretty(manifest)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write to a sibling file first so a crash never leaves half a manifest
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;

        Ok(())
    }
}
