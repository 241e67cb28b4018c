//! Go modules backend
//!
//! A throwaway module pins the requested version in go.mod; `go install`
//! then drops the binary into `<dir>/bin`.

use super::backend::{
    ensure_tool, exe_name, detect_tool, remove_path, standard_source, PackageManager,
};
use super::command::{CommandRunner, CommandSpec};
use crate::package::{InstallationMethod, PackageSource};
use crate::types::LspError;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

const MODULE_NAME: &str = "lspm-install";

pub struct GoBackend {
    dir: PathBuf,
    runner: CommandRunner,
}

impl GoBackend {
    pub fn new(dir: PathBuf, runner: CommandRunner) -> Self {
        Self { dir, runner }
    }

    fn go(&self) -> CommandSpec {
        CommandSpec::new("go")
            .current_dir(&self.dir)
            .env("GOBIN", self.dir.join("bin").to_string_lossy())
            .env("GOFLAGS", "-modcacherw")
    }

    fn package_path(source: &PackageSource) -> String {
        match source.option("subpath") {
            Some(subpath) => format!("{}/{}", source.name, subpath.trim_matches('/')),
            None => source.name.clone(),
        }
    }

    fn module_version(source: &PackageSource) -> String {
        source
            .git_reference
            .as_ref()
            .map(|r| r.value().to_string())
            .unwrap_or_else(|| source.version.clone())
    }

    async fn verify(&self, source: &PackageSource) -> Result<(), LspError> {
        let go_mod = tokio::fs::read_to_string(self.dir.join("go.mod"))
            .await
            .map_err(|_| LspError::install_failed(&source.name, "go.mod is missing"))?;

        // `require <module> <version>`, either inline or inside a block
        let required = go_mod
            .lines()
            .map(|line| line.trim().trim_start_matches("require").trim())
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                Some((parts.next()?, parts.next()?))
            })
            .find(|(module, _)| *module == source.name);

        match required {
            Some((_, version)) if source.is_latest() || version == Self::module_version(source) => {
                Ok(())
            }
            Some((_, version)) => Err(LspError::install_failed(
                &source.name,
                format!("go.mod requires {}, wanted {}", version, source.version),
            )),
            None => Err(LspError::install_failed(
                &source.name,
                "module is missing from go.mod",
            )),
        }
    }
}

#[async_trait]
impl PackageManager for GoBackend {
    fn tool(&self) -> &'static str {
        "go"
    }

    async fn is_installed(&self) -> bool {
        detect_tool("go", &["version"], r"^go version go\d").await
    }

    async fn initialize(&self) -> Result<(), LspError> {
        ensure_tool(self).await?;
        tokio::fs::create_dir_all(&self.dir).await?;
        if !self.dir.join("go.mod").exists() {
            self.runner
                .run(&self.go().args(["mod", "init", MODULE_NAME]))
                .await?;
        }
        Ok(())
    }

    async fn install(&self, method: &InstallationMethod) -> Result<(), LspError> {
        let source = standard_source(method)?;
        info!("Installing {} via go", source);

        let module = format!("{}@{}", source.name, Self::module_version(source));
        self.runner.run(&self.go().args(["get", module.as_str()])).await?;
        self.runner
            .run(&self.go().arg("install").arg(Self::package_path(source)))
            .await?;

        self.verify(source).await
    }

    fn binary_path(&self, name: &str) -> PathBuf {
        self.dir.join("bin").join(exe_name(name))
    }

    async fn cleanup(&self) -> Result<(), LspError> {
        remove_path(&self.dir.join("go.sum")).await?;
        remove_path(&self.dir.join("go.mod")).await
    }
}
