//! npm backend
//!
//! Every server gets its own `package.json` project so dependencies never
//! leak between servers.

use super::backend::{ensure_tool, detect_tool, remove_path, standard_source, PackageManager};
use super::command::{CommandRunner, CommandSpec};
use crate::package::{InstallationMethod, PackageSource};
use crate::types::LspError;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct NpmBackend {
    dir: PathBuf,
    runner: CommandRunner,
}

impl NpmBackend {
    pub fn new(dir: PathBuf, runner: CommandRunner) -> Self {
        Self { dir, runner }
    }

    fn install_spec(source: &PackageSource) -> String {
        match (&source.repository_url, &source.git_reference) {
            (Some(url), Some(reference)) => format!("git+{}#{}", url, reference.value()),
            (Some(url), None) => format!("git+{}", url),
            _ if source.is_latest() => source.name.clone(),
            _ => format!("{}@{}", source.name, source.version),
        }
    }

    async fn verify(&self, source: &PackageSource) -> Result<(), LspError> {
        let manifest = read_json(&self.dir.join("package.json")).await?;
        let declared = manifest
            .get("dependencies")
            .and_then(|deps| deps.get(&source.name))
            .is_some();
        if !declared {
            return Err(LspError::install_failed(
                &source.name,
                "package is missing from package.json dependencies",
            ));
        }

        // Git installs resolve to whatever the ref points at
        if source.is_latest() || source.repository_url.is_some() {
            return Ok(());
        }

        let installed = read_json(&self.dir.join("node_modules").join(&source.name).join("package.json"))
            .await
            .map_err(|_| LspError::install_failed(&source.name, "package is missing from node_modules"))?;
        match installed.get("version").and_then(Value::as_str) {
            Some(version) if version == source.version => Ok(()),
            other => Err(LspError::install_failed(
                &source.name,
                format!(
                    "expected version {}, found {}",
                    source.version,
                    other.unwrap_or("none")
                ),
            )),
        }
    }
}

async fn read_json(path: &Path) -> Result<Value, LspError> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

#[async_trait]
impl PackageManager for NpmBackend {
    fn tool(&self) -> &'static str {
        "npm"
    }

    async fn is_installed(&self) -> bool {
        detect_tool("npm", &["--version"], r"^\d+\.\d+\.\d+").await
    }

    async fn initialize(&self) -> Result<(), LspError> {
        ensure_tool(self).await?;
        tokio::fs::create_dir_all(&self.dir).await?;

        if !self.dir.join("package.json").exists() {
            self.runner
                .run(&CommandSpec::new("npm").args(["init", "--yes"]).current_dir(&self.dir))
                .await?;
        }
        // Keep transitive dependencies inside the package's own node_modules
        tokio::fs::write(self.dir.join(".npmrc"), "install-strategy=shallow\n").await?;
        Ok(())
    }

    async fn install(&self, method: &InstallationMethod) -> Result<(), LspError> {
        let source = standard_source(method)?;
        let mut packages = vec![Self::install_spec(source)];
        packages.extend(source.option_list("extra_packages"));
        info!("Installing {} via npm", packages.join(" "));

        self.runner
            .run(
                &CommandSpec::new("npm")
                    .arg("install")
                    .args(&packages)
                    .current_dir(&self.dir),
            )
            .await?;

        self.verify(source).await
    }

    fn binary_path(&self, name: &str) -> PathBuf {
        let bin = self.dir.join("node_modules").join(".bin");
        if cfg!(windows) {
            bin.join(format!("{}.cmd", name))
        } else {
            bin.join(name)
        }
    }

    async fn cleanup(&self) -> Result<(), LspError> {
        debug!("Removing npm artifacts in {}", self.dir.display());
        remove_path(&self.dir.join("package-lock.json")).await?;
        remove_path(&self.dir.join("node_modules")).await
    }
}
