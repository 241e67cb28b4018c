//! Configuration loader with 3-tier precedence
//!
//! Priority order (highest to lowest):
//! 1. User config (~/.config/lspm/config.toml or .lspm.toml)
//! 2. Built-in defaults (hardcoded for TS/Python/Rust/Go)
//! 3. Package registry (embedded TOML files)

use crate::config::{get_default_configs, RegistryEntry, StartPolicy, UserConfig};
use crate::types::LspError;
use include_dir::{include_dir, Dir};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

// Embed the registry directory at compile time
static REGISTRY_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/registry");

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ConfigLoader {
    defaults: HashMap<String, RegistryEntry>,
    registry: HashMap<String, RegistryEntry>,
    user_config: UserConfig,
}

impl ConfigLoader {
    pub fn new() -> Result<Self, LspError> {
        let user_config = Self::load_user_config()?;
        Self::with_user_config(user_config)
    }

    /// Build a loader around an already parsed user configuration.
    pub fn with_user_config(user_config: UserConfig) -> Result<Self, LspError> {
        let defaults = get_default_configs();
        info!("Loaded {} default LSP configurations", defaults.len());

        let registry = Self::load_registry()?;
        info!("Loaded {} LSP configurations from registry", registry.len());

        Ok(Self {
            defaults,
            registry,
            user_config,
        })
    }

    fn load_registry() -> Result<HashMap<String, RegistryEntry>, LspError> {
        let mut registry = HashMap::new();

        for file in REGISTRY_DIR.files() {
            let file_name = file.path().to_string_lossy();
            if !file_name.ends_with(".toml") {
                continue;
            }

            let content = file.contents_utf8().ok_or_else(|| {
                LspError::ConfigError(format!("Invalid UTF-8 in {}", file_name))
            })?;

            match toml::from_str::<RegistryEntry>(content) {
                Ok(entry) => {
                    debug!(
                        "Loaded registry entry: {} for languages: {:?}",
                        entry.name, entry.languages
                    );
                    if entry.languages.is_empty() {
                        registry.insert(entry.name.clone(), entry);
                    } else {
                        for lang in &entry.languages {
                            registry.insert(lang.clone(), entry.clone());
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to parse registry file {}: {}", file_name, e);
                }
            }
        }

        Ok(registry)
    }

    fn load_user_config() -> Result<UserConfig, LspError> {
        // Try multiple locations in priority order:
        // 1. ./.lspm.toml (project-specific)
        // 2. $LSPM_CONFIG (environment variable)
        // 3. ~/.config/lspm/config.toml (user-global)

        let mut candidates = Vec::new();

        if let Ok(cwd) = std::env::current_dir() {
            candidates.push(cwd.join(".lspm.toml"));
        }

        if let Ok(config_path) = std::env::var("LSPM_CONFIG") {
            candidates.push(PathBuf::from(config_path));
        }

        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("lspm").join("config.toml"));
        }

        for path in &candidates {
            if path.exists() {
                debug!("Loading user config from: {}", path.display());
                let content = std::fs::read_to_string(path)
                    .map_err(|e| LspError::ConfigError(format!("Failed to read config: {}", e)))?;

                let config: UserConfig = toml::from_str(&content)
                    .map_err(|e| LspError::ConfigError(format!("Failed to parse config: {}", e)))?;

                info!("Loaded user configuration from {}", path.display());
                return Ok(config);
            }
        }

        debug!("No user config file found");
        Ok(UserConfig::default())
    }

    pub fn user_config(&self) -> &UserConfig {
        &self.user_config
    }

    /// Directory holding installed servers and the install manifest.
    pub fn data_dir(&self) -> Result<PathBuf, LspError> {
        if let Some(dir) = &self.user_config.settings.data_dir {
            return Ok(dir.clone());
        }
        dirs::data_dir()
            .map(|dir| dir.join("lspm"))
            .ok_or_else(|| {
                LspError::ConfigError("Cannot determine data directory".to_string())
            })
    }

    pub fn request_timeout(&self) -> Duration {
        self.user_config
            .settings
            .request_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn start_policy(&self) -> StartPolicy {
        self.user_config.settings.start_policy.unwrap_or_default()
    }

    /// Get the registry entry for a file based on its extension
    pub fn get_lsp_for_file(&self, file: &Path) -> Result<RegistryEntry, LspError> {
        let ext = file
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| LspError::InvalidPath(file.to_path_buf()))?;

        self.get_lsp_for_extension(ext)
    }

    /// Get the registry entry for a specific file extension
    pub fn get_lsp_for_extension(&self, ext: &str) -> Result<RegistryEntry, LspError> {
        debug!("Looking up LSP for extension: .{}", ext);

        for (source_name, source) in [("defaults", &self.defaults), ("registry", &self.registry)] {
            if let Some(pkg) = source
                .values()
                .find(|pkg| pkg.file_extensions.iter().any(|e| e == ext))
            {
                debug!("Found LSP '{}' for .{} in {}", pkg.name, ext, source_name);
                return Ok(pkg.clone());
            }
        }

        Err(LspError::UnsupportedLanguage(format!(
            "No LSP found for file extension '.{}'",
            ext
        )))
    }

    /// Get the registry entry for a language
    pub fn get_lsp_for_language(&self, language: &str) -> Result<RegistryEntry, LspError> {
        debug!("Looking up LSP for language: {}", language);

        if let Some(override_lsp) = self.user_config.language_overrides.get(language) {
            debug!("User override: {} -> {}", language, override_lsp);
            return self.get_lsp_by_name(override_lsp);
        }

        // Defaults win for the languages they cover
        if let Some(pkg) = self.defaults.get(language) {
            debug!("Found LSP for {} in defaults", language);
            return Ok(pkg.clone());
        }

        if let Some(pkg) = self.registry.get(language) {
            debug!("Found LSP for {} in registry", language);
            return Ok(pkg.clone());
        }

        Err(LspError::UnsupportedLanguage(format!(
            "No LSP found for language '{}'",
            language
        )))
    }

    /// Get a registry entry by exact package name
    pub fn get_lsp_by_name(&self, name: &str) -> Result<RegistryEntry, LspError> {
        [&self.defaults, &self.registry]
            .into_iter()
            .flat_map(|source| source.values())
            .find(|pkg| pkg.name == name)
            .cloned()
            .ok_or_else(|| LspError::ConfigError(format!("LSP '{}' not found", name)))
    }

    /// List all available registry entries, sorted by name
    pub fn list_available_lsps(&self) -> Vec<&RegistryEntry> {
        let mut lsps: Vec<&RegistryEntry> = Vec::new();
        let mut seen = HashSet::new();

        for pkg in self.defaults.values().chain(self.registry.values()) {
            if seen.insert(&pkg.name) {
                lsps.push(pkg);
            }
        }

        lsps.sort_by(|a, b| a.name.cmp(&b.name));
        lsps
    }
}
