//! Package manager backend contract

use super::cargo::CargoBackend;
use super::command::{CommandRunner, CommandSpec};
use super::gem::GemBackend;
use super::github::{GitSourceBackend, GithubReleaseBackend};
use super::golang::GoBackend;
use super::npm::NpmBackend;
use super::pip::PipBackend;
use crate::package::{Ecosystem, InstallationMethod, PackageSource};
use crate::types::LspError;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One package ecosystem, bound to a single install directory.
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Backing tool, used in errors and logs.
    fn tool(&self) -> &'static str;

    /// Whether the backing tool is usable on this host. Never fails.
    async fn is_installed(&self) -> bool;

    /// Check the tool, create the directory and its scaffolding.
    async fn initialize(&self) -> Result<(), LspError>;

    /// Install, then confirm the package really landed.
    async fn install(&self, method: &InstallationMethod) -> Result<(), LspError>;

    fn binary_path(&self, name: &str) -> PathBuf;

    /// Environment the installed binary needs at launch.
    fn binary_env(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Remove partial artifacts left by a failed or cancelled install.
    async fn cleanup(&self) -> Result<(), LspError>;
}

/// Chooses the backend for an install method.
pub trait BackendProvider: Send + Sync {
    fn backend(
        &self,
        method: &InstallationMethod,
        dir: &Path,
        runner: CommandRunner,
    ) -> Result<Box<dyn PackageManager>, LspError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackends;

impl BackendProvider for DefaultBackends {
    fn backend(
        &self,
        method: &InstallationMethod,
        dir: &Path,
        runner: CommandRunner,
    ) -> Result<Box<dyn PackageManager>, LspError> {
        let dir = dir.to_path_buf();
        let backend: Box<dyn PackageManager> = match method {
            InstallationMethod::StandardPackage(source) => match source.ecosystem {
                Ecosystem::Npm => Box::new(NpmBackend::new(dir, runner)),
                Ecosystem::Cargo => Box::new(CargoBackend::new(dir, runner)),
                Ecosystem::Pypi => Box::new(PipBackend::new(dir, runner)),
                Ecosystem::Gem => Box::new(GemBackend::new(dir, runner)),
                Ecosystem::Golang => Box::new(GoBackend::new(dir, runner)),
                Ecosystem::Github => {
                    return Err(LspError::UnsupportedSource(source.source_id.clone()))
                }
            },
            InstallationMethod::BinaryDownload { .. } => {
                Box::new(GithubReleaseBackend::new(dir, runner))
            }
            InstallationMethod::SourceBuild { .. } => Box::new(GitSourceBackend::new(dir, runner)),
            InstallationMethod::Unknown => {
                return Err(LspError::UnsupportedSource("unrecognized package".to_string()))
            }
        };
        Ok(backend)
    }
}

/// Run `<program> <args>` and match its output. False on any failure.
pub(crate) async fn detect_tool(program: &str, args: &[&str], pattern: &str) -> bool {
    let path = match which::which(program) {
        Ok(path) => path,
        Err(_) => {
            debug!("{} not found on PATH", program);
            return false;
        }
    };
    let Ok(re) = Regex::new(pattern) else {
        return false;
    };

    match CommandRunner::default()
        .capture(&CommandSpec::new(path).args(args))
        .await
    {
        Ok(output) => re.is_match(output.trim()),
        Err(e) => {
            debug!("{} version check failed: {}", program, e);
            false
        }
    }
}

pub(crate) async fn ensure_tool<B>(backend: &B) -> Result<(), LspError>
where
    B: PackageManager + ?Sized,
{
    if backend.is_installed().await {
        Ok(())
    } else {
        Err(LspError::tool_missing(backend.tool()))
    }
}

pub(crate) fn standard_source(method: &InstallationMethod) -> Result<&PackageSource, LspError> {
    match method {
        InstallationMethod::StandardPackage(source) => Ok(source),
        other => Err(LspError::UnsupportedSource(format!(
            "{} install is not handled by this backend",
            other.label()
        ))),
    }
}

/// Remove a file or directory, ignoring ones that do not exist.
pub(crate) async fn remove_path(path: &Path) -> Result<(), LspError> {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Platform executable file name.
pub(crate) fn exe_name(name: &str) -> String {
    if cfg!(windows) && Path::new(name).extension().is_none() {
        format!("{}.exe", name)
    } else {
        name.to_string()
    }
}
