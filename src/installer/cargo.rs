//! cargo backend, installing into a private `--root`

use super::backend::{ensure_tool, exe_name, detect_tool, standard_source, PackageManager};
use super::command::{CommandRunner, CommandSpec};
use crate::package::{GitReference, InstallationMethod, PackageSource};
use crate::types::LspError;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

pub struct CargoBackend {
    dir: PathBuf,
    runner: CommandRunner,
}

impl CargoBackend {
    pub fn new(dir: PathBuf, runner: CommandRunner) -> Self {
        Self { dir, runner }
    }

    fn install_command(&self, source: &PackageSource) -> CommandSpec {
        let mut cmd = CommandSpec::new("cargo")
            .arg("install")
            .arg("--root")
            .arg(&self.dir);

        match (&source.repository_url, &source.git_reference) {
            (Some(url), reference) => {
                cmd = cmd.arg("--git").arg(url);
                cmd = match reference {
                    Some(GitReference::Tag(tag)) if tag != crate::package::LATEST => {
                        cmd.arg("--tag").arg(tag)
                    }
                    Some(GitReference::Revision(rev)) => cmd.arg("--rev").arg(rev),
                    _ => cmd,
                };
            }
            (None, _) if !source.is_latest() => {
                cmd = cmd.arg("--version").arg(&source.version);
            }
            (None, _) => {}
        }

        let features = source.option_list("features");
        if !features.is_empty() {
            cmd = cmd.arg("--features").arg(features.join(","));
        }
        if source.option("locked") == Some("true") {
            cmd = cmd.arg("--locked");
        }

        cmd.arg(&source.name)
    }

    /// Confirm the crate appears in cargo's install ledger.
    async fn verify(&self, source: &PackageSource) -> Result<(), LspError> {
        let ledger = self.dir.join(".crates.toml");
        let content = tokio::fs::read_to_string(&ledger)
            .await
            .map_err(|_| LspError::install_failed(&source.name, "cargo left no .crates.toml"))?;
        let ledger: toml::Table = toml::from_str(&content)?;

        let installed = ledger
            .get("v1")
            .and_then(toml::Value::as_table)
            .into_iter()
            .flat_map(|table| table.keys())
            .filter_map(|key| {
                // "<name> <version> (<source>)"
                let mut parts = key.split_whitespace();
                Some((parts.next()?, parts.next()?))
            })
            .find(|(name, _)| *name == source.name);

        match installed {
            None => Err(LspError::install_failed(
                &source.name,
                "crate is missing from .crates.toml",
            )),
            Some((_, version))
                if source.is_latest()
                    || source.repository_url.is_some()
                    || version == source.version =>
            {
                debug!("Verified {} {}", source.name, version);
                Ok(())
            }
            Some((_, version)) => Err(LspError::install_failed(
                &source.name,
                format!("expected version {}, found {}", source.version, version),
            )),
        }
    }
}

#[async_trait]
impl PackageManager for CargoBackend {
    fn tool(&self) -> &'static str {
        "cargo"
    }

    async fn is_installed(&self) -> bool {
        detect_tool("cargo", &["--version"], r"^cargo \d+\.\d+").await
    }

    async fn initialize(&self) -> Result<(), LspError> {
        ensure_tool(self).await?;
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn install(&self, method: &InstallationMethod) -> Result<(), LspError> {
        let source = standard_source(method)?;
        info!("Installing {} via cargo", source);
        self.runner.run(&self.install_command(source)).await?;
        self.verify(source).await
    }

    fn binary_path(&self, name: &str) -> PathBuf {
        self.dir.join("bin").join(exe_name(name))
    }

    async fn cleanup(&self) -> Result<(), LspError> {
        // cargo install builds in a temporary target dir and only writes
        // into --root on success
        debug!("Nothing to clean for cargo in {}", self.dir.display());
        Ok(())
    }
}
