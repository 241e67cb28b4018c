//! pip backend, one virtual environment per server

use super::backend::{ensure_tool, exe_name, detect_tool, standard_source, PackageManager};
use super::command::{CommandRunner, CommandSpec};
use crate::package::{InstallationMethod, PackageSource};
use crate::types::LspError;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

const REQUIREMENTS: &str = "requirements.txt";

fn system_python() -> &'static str {
    if cfg!(windows) {
        "python"
    } else {
        "python3"
    }
}

pub struct PipBackend {
    dir: PathBuf,
    runner: CommandRunner,
}

impl PipBackend {
    pub fn new(dir: PathBuf, runner: CommandRunner) -> Self {
        Self { dir, runner }
    }

    fn venv_bin(&self) -> PathBuf {
        let venv = self.dir.join("venv");
        if cfg!(windows) {
            venv.join("Scripts")
        } else {
            venv.join("bin")
        }
    }

    fn venv_python(&self) -> PathBuf {
        self.venv_bin().join(exe_name("python"))
    }

    fn requirement(source: &PackageSource) -> String {
        let name = match source.option("extra") {
            Some(extra) => format!("{}[{}]", source.name, extra),
            None => source.name.clone(),
        };
        match (&source.repository_url, &source.git_reference) {
            (Some(url), Some(reference)) => format!("{} @ git+{}@{}", name, url, reference.value()),
            (Some(url), None) => format!("{} @ git+{}", name, url),
            _ if source.is_latest() => name,
            _ => format!("{}=={}", name, source.version),
        }
    }

    async fn verify(&self, source: &PackageSource) -> Result<(), LspError> {
        let output = CommandRunner::new(self.runner.cancel_token().clone())
            .capture(
                &CommandSpec::new(self.venv_python())
                    .args(["-m", "pip", "show"])
                    .arg(&source.name),
            )
            .await
            .map_err(|_| LspError::install_failed(&source.name, "pip does not know the package"))?;

        let version = output
            .lines()
            .find_map(|line| line.strip_prefix("Version:"))
            .map(str::trim);
        check_version(source, version)
    }
}

fn check_version(source: &PackageSource, found: Option<&str>) -> Result<(), LspError> {
    match found {
        Some(_) if source.is_latest() || source.repository_url.is_some() => Ok(()),
        Some(version) if version == source.version => Ok(()),
        Some(version) => Err(LspError::install_failed(
            &source.name,
            format!("expected version {}, found {}", source.version, version),
        )),
        None => Err(LspError::install_failed(&source.name, "pip show reported no version")),
    }
}

#[async_trait]
impl PackageManager for PipBackend {
    fn tool(&self) -> &'static str {
        system_python()
    }

    async fn is_installed(&self) -> bool {
        detect_tool(system_python(), &["--version"], r"^Python 3\.").await
    }

    async fn initialize(&self) -> Result<(), LspError> {
        ensure_tool(self).await?;
        tokio::fs::create_dir_all(&self.dir).await?;

        if !self.venv_python().exists() {
            self.runner
                .run(
                    &CommandSpec::new(system_python())
                        .args(["-m", "venv", "venv"])
                        .current_dir(&self.dir),
                )
                .await?;
        }
        tokio::fs::write(self.dir.join(REQUIREMENTS), "").await?;
        Ok(())
    }

    async fn install(&self, method: &InstallationMethod) -> Result<(), LspError> {
        let source = standard_source(method)?;
        let requirement = Self::requirement(source);
        info!("Installing {} via pip", requirement);

        tokio::fs::write(self.dir.join(REQUIREMENTS), format!("{}\n", requirement)).await?;
        self.runner
            .run(
                &CommandSpec::new(self.venv_python())
                    .args(["-m", "pip", "install", "--disable-pip-version-check", "-r", REQUIREMENTS])
                    .current_dir(&self.dir),
            )
            .await?;

        self.verify(source).await
    }

    fn binary_path(&self, name: &str) -> PathBuf {
        self.venv_bin().join(exe_name(name))
    }

    async fn cleanup(&self) -> Result<(), LspError> {
        debug!("Resetting {} in {}", REQUIREMENTS, self.dir.display());
        if self.dir.exists() {
            tokio::fs::write(self.dir.join(REQUIREMENTS), "").await?;
        }
        Ok(())
    }
}
