//! Configuration system for LSPM
//!
//! Provides a 3-tier registry lookup:
//! 1. User config (highest priority)
//! 2. Built-in defaults
//! 3. Embedded package registry
//!
//! plus the persisted per-language server configuration.

mod defaults;
mod loader;
mod registry;
mod servers;
mod user_config;

pub use defaults::get_default_configs;
pub use loader::{ConfigLoader, DEFAULT_REQUEST_TIMEOUT};
pub use registry::{AssetTemplate, BinaryConfig, BuildCommand, RegistryEntry, RegistrySource};
pub use servers::{InstallManifest, InstalledServer, ServerConfig, ServerConfigs};
pub use user_config::{ServerOverride, Settings, StartPolicy, UserConfig};
