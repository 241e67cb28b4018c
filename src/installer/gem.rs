//! RubyGems backend

use super::backend::{
    ensure_tool, exe_name, detect_tool, remove_path, standard_source, PackageManager,
};
use super::command::{CommandRunner, CommandSpec};
use crate::package::{InstallationMethod, PackageSource};
use crate::types::LspError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

pub struct GemBackend {
    dir: PathBuf,
    runner: CommandRunner,
}

impl GemBackend {
    pub fn new(dir: PathBuf, runner: CommandRunner) -> Self {
        Self { dir, runner }
    }

    fn install_command(&self, source: &PackageSource) -> Result<CommandSpec, LspError> {
        if source.repository_url.is_some() {
            return Err(LspError::UnsupportedSource(format!(
                "{}: gem cannot install from a git repository",
                source.source_id
            )));
        }

        let mut cmd = CommandSpec::new("gem")
            .args(["install", "--no-document", "--install-dir"])
            .arg(&self.dir)
            .arg("--bindir")
            .arg(self.dir.join("bin"))
            .arg(&source.name);
        if !source.is_latest() {
            cmd = cmd.arg("-v").arg(&source.version);
        }
        Ok(cmd.env("GEM_HOME", self.dir.to_string_lossy()))
    }

    async fn verify(&self, source: &PackageSource) -> Result<(), LspError> {
        let specs = self.dir.join("specifications");
        if !source.is_latest() {
            let gemspec = specs.join(format!("{}-{}.gemspec", source.name, source.version));
            return if gemspec.exists() {
                Ok(())
            } else {
                Err(LspError::install_failed(
                    &source.name,
                    format!("{} is missing", gemspec.display()),
                ))
            };
        }

        let prefix = format!("{}-", source.name);
        let mut entries = tokio::fs::read_dir(&specs)
            .await
            .map_err(|_| LspError::install_failed(&source.name, "no gem specifications found"))?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with(&prefix) && file_name.ends_with(".gemspec") {
                return Ok(());
            }
        }
        Err(LspError::install_failed(&source.name, "gem specification is missing"))
    }
}

#[async_trait]
impl PackageManager for GemBackend {
    fn tool(&self) -> &'static str {
        "gem"
    }

    async fn is_installed(&self) -> bool {
        detect_tool("gem", &["--version"], r"^\d+\.\d+").await
    }

    async fn initialize(&self) -> Result<(), LspError> {
        ensure_tool(self).await?;
        tokio::fs::create_dir_all(self.dir.join("bin")).await?;
        Ok(())
    }

    async fn install(&self, method: &InstallationMethod) -> Result<(), LspError> {
        let source = standard_source(method)?;
        info!("Installing {} via gem", source);
        self.runner.run(&self.install_command(source)?).await?;
        self.verify(source).await
    }

    fn binary_path(&self, name: &str) -> PathBuf {
        self.dir.join("bin").join(exe_name(name))
    }

    fn binary_env(&self) -> HashMap<String, String> {
        let home = self.dir.to_string_lossy().into_owned();
        HashMap::from([
            ("GEM_HOME".to_string(), home.clone()),
            ("GEM_PATH".to_string(), home),
        ])
    }

    async fn cleanup(&self) -> Result<(), LspError> {
        remove_path(&self.dir.join("cache")).await
    }
}
