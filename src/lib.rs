//! LSPM - Language Server Package Manager
//!
//! Resolves registry identifiers to install strategies, installs language
//! servers through the host's package managers or GitHub releases, and runs
//! the installed servers over the Language Server Protocol.

pub mod config;
pub mod installer;
pub mod lsp;
pub mod package;
pub mod types;

pub use config::{ConfigLoader, ServerConfigs, StartPolicy};
pub use installer::{InstallOperation, InstallPhase, ServerInstaller};
pub use lsp::{LanguageEvent, LspClient, LspManager, ResponseCache};
pub use package::{parse_package_id, InstallationMethod, PackageSource};
pub use types::{LanguageServerBinary, LspError};
