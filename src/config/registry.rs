//! Registry entry types

use crate::package::{resolve_method, InstallationMethod, Platform};
use serde::{Deserialize, Serialize};

/// One installable language server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub description: String,
    pub homepage: Option<String>,
    #[serde(default)]
    pub licenses: Vec<String>,
    pub languages: Vec<String>,
    #[serde(default)]
    pub file_extensions: Vec<String>,
    pub source: RegistrySource,
    pub bin: BinaryConfig,
    pub initialization_options: Option<serde_json::Value>,
}

impl RegistryEntry {
    pub fn installation_method(&self, platform: &Platform) -> InstallationMethod {
        resolve_method(&self.source, platform)
    }

    /// Language key the entry is indexed under.
    pub fn primary_language(&self) -> &str {
        self.languages.first().map(String::as_str).unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySource {
    /// `pkg:<scheme>/<name>@<version>` identifier
    pub id: String,
    pub asset: Option<AssetTemplate>,
    pub build: Option<BuildCommand>,
}

/// Platform templated release asset filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetTemplate {
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildCommand {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryConfig {
    pub primary: String,
    #[serde(default)]
    pub additional: Vec<String>,
    #[serde(default)]
    pub lsp_args: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_from_toml() {
        let entry: RegistryEntry = toml::from_str(
            r#"
            name = "marksman"
            description = "Markdown language server"
            languages = ["markdown"]
            file_extensions = ["md"]

            [source]
            id = "pkg:github/artempyanykh/marksman@2023-12-09"

            [source.asset]
            file = "marksman-{os}"

            [bin]
            primary = "marksman-{os}"
            lsp_args = ["server"]
            "#,
        )
        .unwrap();

        assert_eq!(entry.primary_language(), "markdown");
        assert!(entry.source.build.is_none());
        assert!(entry.bin.additional.is_empty());

        let platform = Platform {
            os: "linux",
            arch: "x86_64",
        };
        assert!(matches!(
            entry.installation_method(&platform),
            InstallationMethod::BinaryDownload { .. }
        ));
    }
}
