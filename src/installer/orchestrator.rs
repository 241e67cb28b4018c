//! Installation orchestrator
//!
//! Owns the single in-flight install. Progress is published as snapshots on
//! a watch channel; the task running the install is the only writer.

use super::backend::{remove_path, BackendProvider, DefaultBackends, PackageManager};
use super::command::CommandRunner;
use crate::config::{InstalledServer, RegistryEntry, ServerConfigs};
use crate::package::{InstallationMethod, Platform};
use crate::types::{LanguageServerBinary, LspError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Bound on buffered output lines between a command and the orchestrator.
const OUTPUT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallPhase {
    Resolving,
    Initializing,
    Installing,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl InstallPhase {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Snapshot of an install, kept after it finishes for display.
#[derive(Debug, Clone, Serialize)]
pub struct InstallOperation {
    pub package: String,
    pub phase: InstallPhase,
    /// Fraction in `0.0..=1.0`
    pub progress: f32,
    pub output: Vec<String>,
    pub error: Option<String>,
}

impl InstallOperation {
    fn new(package: &str) -> Self {
        Self {
            package: package.to_string(),
            phase: InstallPhase::Resolving,
            progress: 0.0,
            output: Vec::new(),
            error: None,
        }
    }
}

/// Clears the install slot when the running install ends, however it ends.
struct SlotGuard<'a> {
    slot: &'a Mutex<Option<CancellationToken>>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }
}

/// LSP server installer
pub struct ServerInstaller {
    /// Parent of every per-server install directory
    servers_dir: PathBuf,
    configs: Arc<ServerConfigs>,
    backends: Arc<dyn BackendProvider>,
    platform: Platform,
    active: Mutex<Option<CancellationToken>>,
    state: watch::Sender<Option<InstallOperation>>,
}

impl ServerInstaller {
    pub fn new(servers_dir: impl Into<PathBuf>, configs: Arc<ServerConfigs>) -> Self {
        Self::with_backends(servers_dir, configs, Arc::new(DefaultBackends))
    }

    pub fn with_backends(
        servers_dir: impl Into<PathBuf>,
        configs: Arc<ServerConfigs>,
        backends: Arc<dyn BackendProvider>,
    ) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            servers_dir: servers_dir.into(),
            configs,
            backends,
            platform: Platform::current(),
            active: Mutex::new(None),
            state,
        }
    }

    pub fn servers_dir(&self) -> &Path {
        &self.servers_dir
    }

    /// Observe the current (or last) install operation.
    pub fn subscribe(&self) -> watch::Receiver<Option<InstallOperation>> {
        self.state.subscribe()
    }

    pub fn current(&self) -> Option<InstallOperation> {
        self.state.borrow().clone()
    }

    pub fn is_installing(&self) -> bool {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Cancel the running install. Returns false when nothing is running.
    pub fn cancel_installation(&self) -> bool {
        let slot = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some(token) => {
                info!("Cancelling installation");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Install a registry entry and register the resulting binary for each
    /// of its languages.
    pub async fn start_installation(
        &self,
        entry: &RegistryEntry,
    ) -> Result<LanguageServerBinary, LspError> {
        let cancel = {
            let mut slot = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                let running = self
                    .current()
                    .map(|op| op.package)
                    .unwrap_or_else(|| entry.name.clone());
                return Err(LspError::InstallInProgress(running));
            }
            let token = CancellationToken::new();
            *slot = Some(token.clone());
            token
        };
        let _guard = SlotGuard { slot: &self.active };

        info!(package = %entry.name, "Starting installation");
        self.state.send_replace(Some(InstallOperation::new(&entry.name)));

        let result = self.run(entry, cancel).await;

        self.update(|op| match &result {
            Ok(_) => {
                op.phase = InstallPhase::Completed;
                op.progress = 1.0;
            }
            Err(LspError::Cancelled) => op.phase = InstallPhase::Cancelled,
            Err(e) => {
                op.phase = InstallPhase::Failed;
                op.error = Some(e.to_string());
            }
        });
        match &result {
            Ok(binary) => info!(package = %entry.name, "Installed {}", binary.path.display()),
            Err(e) => error!(package = %entry.name, "Installation failed: {}", e),
        }
        result
    }

    async fn run(
        &self,
        entry: &RegistryEntry,
        cancel: CancellationToken,
    ) -> Result<LanguageServerBinary, LspError> {
        let method = entry.installation_method(&self.platform);
        let source = method
            .source()
            .ok_or_else(|| LspError::UnsupportedSource(entry.source.id.clone()))?
            .clone();

        let dir = self.servers_dir.join(&entry.name);
        let backup = self.servers_dir.join(format!(".{}.previous", entry.name));

        let (tx, mut rx) = mpsc::channel(OUTPUT_BUFFER);
        let runner = CommandRunner::new(cancel.clone()).with_output(tx);
        let backend = self.backends.backend(&method, &dir, runner)?;
        let previous = set_aside(&dir, &backup).await?.then_some(backup.as_path());

        let work = self.install_with(backend.as_ref(), entry, &method, &source.version);
        tokio::pin!(work);

        // Output lines are folded into the snapshot from this task only
        let result = loop {
            tokio::select! {
                Some(line) = rx.recv() => self.push_output(line),
                result = &mut work => break result,
            }
        };
        while let Ok(line) = rx.try_recv() {
            self.push_output(line);
        }

        let result = match result {
            Ok(_) if cancel.is_cancelled() => Err(LspError::Cancelled),
            Ok(binary) => self
                .register(entry, &method, &source.version, &binary)
                .await
                .map(|()| binary),
            Err(e) => Err(e),
        };
        match result {
            Ok(binary) => {
                if let Some(previous) = previous {
                    if let Err(e) = remove_path(previous).await {
                        warn!("Could not remove previous install {}: {}", previous.display(), e);
                    }
                }
                Ok(binary)
            }
            Err(e) => {
                self.rollback(backend.as_ref(), &dir, previous).await;
                Err(e)
            }
        }
    }

    /// Record the install under every language of the entry in one write.
    async fn register(
        &self,
        entry: &RegistryEntry,
        method: &InstallationMethod,
        version: &str,
        binary: &LanguageServerBinary,
    ) -> Result<(), LspError> {
        let install_date = chrono::Utc::now().to_rfc3339();
        let languages = if entry.languages.is_empty() {
            vec![entry.name.clone()]
        } else {
            entry.languages.clone()
        };
        let installed = InstalledServer {
            package: entry.name.clone(),
            version: version.to_string(),
            install_date,
            binary: binary.clone(),
            install_method: method.label().to_string(),
            enabled: true,
        };
        self.configs
            .register_all(
                languages
                    .into_iter()
                    .map(|language| (language, installed.clone()))
                    .collect(),
            )
            .await
    }

    async fn install_with(
        &self,
        backend: &dyn PackageManager,
        entry: &RegistryEntry,
        method: &InstallationMethod,
        version: &str,
    ) -> Result<LanguageServerBinary, LspError> {
        self.set_phase(InstallPhase::Initializing, 0.1);
        backend.initialize().await?;

        self.set_phase(InstallPhase::Installing, 0.3);
        backend.install(method).await?;

        self.set_phase(InstallPhase::Verifying, 0.95);
        let primary = self
            .platform
            .expand(&entry.bin.primary, version)
            .map_err(|e| LspError::install_failed(&entry.name, e.to_string()))?;
        let path = backend.binary_path(&primary);
        if !path.exists() {
            return Err(LspError::install_failed(
                &entry.name,
                format!("binary {} was not produced", path.display()),
            ));
        }

        Ok(LanguageServerBinary::new(path)
            .with_args(entry.bin.lsp_args.iter().cloned())
            .with_env(backend.binary_env()))
    }

    /// Drop what the failed attempt produced and bring back the previous
    /// install, if there was one.
    async fn rollback(&self, backend: &dyn PackageManager, dir: &Path, previous: Option<&Path>) {
        if let Err(e) = backend.cleanup().await {
            warn!("Cleanup of {} failed: {}", dir.display(), e);
        }
        if let Err(e) = remove_path(dir).await {
            warn!("Could not remove {}: {}", dir.display(), e);
            return;
        }
        if let Some(previous) = previous {
            info!("Restoring previous install of {}", dir.display());
            if let Err(e) = tokio::fs::rename(previous, dir).await {
                error!("Could not restore {}: {}", dir.display(), e);
            }
        }
    }

    fn set_phase(&self, phase: InstallPhase, progress: f32) {
        self.update(|op| {
            op.phase = phase;
            op.progress = op.progress.max(progress);
        });
    }

    fn push_output(&self, line: String) {
        self.update(|op| {
            op.output.push(line);
            if op.phase == InstallPhase::Installing {
                op.progress = (op.progress + 0.01).min(0.9);
            }
        });
    }

    fn update(&self, f: impl FnOnce(&mut InstallOperation)) {
        self.state.send_modify(|state| {
            if let Some(op) = state.as_mut() {
                f(op);
            }
        });
    }
}

/// Move an existing install directory to `backup`. Returns whether there was
/// one. A backup left behind by an interrupted attempt is restored first.
async fn set_aside(dir: &Path, backup: &Path) -> Result<bool, LspError> {
    if backup.exists() {
        if dir.exists() {
            remove_path(backup).await?;
        } else {
            warn!("Recovering interrupted install from {}", backup.display());
            tokio::fs::rename(backup, dir).await?;
        }
    }
    if !dir.exists() {
        return Ok(false);
    }
    tokio::fs::rename(dir, backup).await?;
    Ok(true)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{BinaryConfig, RegistrySource, UserConfig};
    use crate::installer::command::CommandSpec;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Backend whose install is a shell script run in the install dir.
    struct ScriptBackend {
        dir: PathBuf,
        runner: CommandRunner,
        script: &'static str,
    }

    #[async_trait]
    impl PackageManager for ScriptBackend {
        fn tool(&self) -> &'static str {
            "sh"
        }

        async fn is_installed(&self) -> bool {
            true
        }

        async fn initialize(&self) -> Result<(), LspError> {
            tokio::fs::create_dir_all(&self.dir).await?;
            Ok(())
        }

        async fn install(&self, _method: &InstallationMethod) -> Result<(), LspError> {
            self.runner
                .run(&CommandSpec::shell(self.script).current_dir(&self.dir))
                .await
        }

        fn binary_path(&self, name: &str) -> PathBuf {
            self.dir.join("bin").join(name)
        }

        async fn cleanup(&self) -> Result<(), LspError> {
            remove_path(&self.dir.join("package-lock.json")).await
        }
    }

    struct ScriptProvider(&'static str);

    impl BackendProvider for ScriptProvider {
        fn backend(
            &self,
            _method: &InstallationMethod,
            dir: &Path,
            runner: CommandRunner,
        ) -> Result<Box<dyn PackageManager>, LspError> {
            Ok(Box::new(ScriptBackend {
                dir: dir.to_path_buf(),
                runner,
                script: self.0,
            }))
        }
    }

    fn entry() -> RegistryEntry {
        RegistryEntry {
            name: "fake-ls".to_string(),
            description: "Fake language server".to_string(),
            homepage: None,
            licenses: Vec::new(),
            languages: vec!["fake".to_string(), "fakescript".to_string()],
            file_extensions: vec!["fk".to_string()],
            source: RegistrySource {
                id: "pkg:npm/fake-ls@1.0.0".to_string(),
                asset: None,
                build: None,
            },
            bin: BinaryConfig {
                primary: "fake-ls".to_string(),
                additional: Vec::new(),
                lsp_args: vec!["--stdio".to_string()],
            },
            initialization_options: None,
        }
    }

    fn installer(root: &Path, script: &'static str) -> Arc<ServerInstaller> {
        let configs =
            ServerConfigs::load(root.join("manifest.json"), &UserConfig::default()).unwrap();
        Arc::new(ServerInstaller::with_backends(
            root.join("servers"),
            Arc::new(configs),
            Arc::new(ScriptProvider(script)),
        ))
    }

    #[tokio::test]
    async fn test_successful_install_registers_every_language() {
        let root = tempfile::tempdir().unwrap();
        let installer = installer(
            root.path(),
            "echo fetching; mkdir -p bin && touch bin/fake-ls && echo done",
        );

        let binary = installer.start_installation(&entry()).await.unwrap();
        assert_eq!(binary.args, vec!["--stdio".to_string()]);
        assert!(binary.path.ends_with("servers/fake-ls/bin/fake-ls"));

        let op = installer.current().unwrap();
        assert_eq!(op.phase, InstallPhase::Completed);
        assert_eq!(op.progress, 1.0);
        assert_eq!(op.output, vec!["fetching".to_string(), "done".to_string()]);
        assert!(!installer.is_installing());

        for language in ["fake", "fakescript"] {
            let config = installer.configs.get(language).await.unwrap();
            assert!(config.enabled);
            assert_eq!(config.binary, binary);
        }
    }

    #[tokio::test]
    async fn test_missing_binary_fails_without_registration() {
        let root = tempfile::tempdir().unwrap();
        let installer = installer(root.path(), "echo nothing built");

        let err = installer.start_installation(&entry()).await.unwrap_err();
        assert!(matches!(err, LspError::InstallationFailed { .. }), "{:?}", err);

        let op = installer.current().unwrap();
        assert_eq!(op.phase, InstallPhase::Failed);
        assert!(op.error.is_some());
        assert_eq!(op.output, vec!["nothing built".to_string()]);
        assert!(installer.configs.get("fake").await.is_none());
        assert!(!root.path().join("servers/fake-ls").exists());
    }

    #[tokio::test]
    async fn test_cancel_leaves_no_install_dir() {
        let root = tempfile::tempdir().unwrap();
        let installer = installer(
            root.path(),
            "touch package-lock.json; echo started; sleep 30",
        );
        let mut states = installer.subscribe();

        let task = {
            let installer = installer.clone();
            tokio::spawn(async move { installer.start_installation(&entry()).await })
        };

        states
            .wait_for(|op| op.as_ref().is_some_and(|op| !op.output.is_empty()))
            .await
            .unwrap();

        // A second install is rejected while the first is running
        let err = installer.start_installation(&entry()).await.unwrap_err();
        assert!(matches!(err, LspError::InstallInProgress(_)));

        assert!(installer.cancel_installation());
        let result = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(LspError::Cancelled)));

        assert_eq!(installer.current().unwrap().phase, InstallPhase::Cancelled);
        assert!(!root.path().join("servers/fake-ls").exists());
        assert!(installer.configs.get("fake").await.is_none());
        assert!(!installer.cancel_installation());
    }

    #[tokio::test]
    async fn test_cancel_restores_existing_dir() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("servers/fake-ls");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("package.json"), "{}").unwrap();

        let installer = installer(
            root.path(),
            "touch package-lock.json; echo started; sleep 30",
        );
        let mut states = installer.subscribe();
        let task = {
            let installer = installer.clone();
            tokio::spawn(async move { installer.start_installation(&entry()).await })
        };
        states
            .wait_for(|op| op.as_ref().is_some_and(|op| !op.output.is_empty()))
            .await
            .unwrap();
        installer.cancel_installation();
        assert!(task.await.unwrap().is_err());

        let mut names: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["package.json".to_string()]);
    }

    fn list(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    const WORKING_INSTALL: &str =
        "mkdir -p bin && echo v1 > bin/fake-ls && echo lock > package-lock.json && echo {} > package.json";

    #[tokio::test]
    async fn test_failed_reinstall_keeps_working_install() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("servers/fake-ls");
        installer(root.path(), WORKING_INSTALL)
            .start_installation(&entry())
            .await
            .unwrap();

        let installer = installer(root.path(), "rm -rf bin package-lock.json; exit 3");
        assert!(installer.start_installation(&entry()).await.is_err());

        assert_eq!(std::fs::read_to_string(dir.join("bin/fake-ls")).unwrap(), "v1\n");
        assert_eq!(
            list(&dir),
            vec!["bin".to_string(), "package-lock.json".to_string(), "package.json".to_string()]
        );
        assert_eq!(list(&root.path().join("servers")), vec!["fake-ls".to_string()]);

        let config = installer.configs.get("fake").await.unwrap();
        assert!(config.enabled);
        assert!(config.binary.path.exists());
    }

    #[tokio::test]
    async fn test_cancelled_reinstall_keeps_working_install() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("servers/fake-ls");
        installer(root.path(), WORKING_INSTALL)
            .start_installation(&entry())
            .await
            .unwrap();

        let installer = installer(root.path(), "mkdir -p bin; echo started; sleep 30");
        let mut states = installer.subscribe();
        let task = {
            let installer = installer.clone();
            tokio::spawn(async move { installer.start_installation(&entry()).await })
        };
        states
            .wait_for(|op| op.as_ref().is_some_and(|op| !op.output.is_empty()))
            .await
            .unwrap();
        assert!(installer.cancel_installation());
        assert!(matches!(task.await.unwrap(), Err(LspError::Cancelled)));

        assert_eq!(std::fs::read_to_string(dir.join("bin/fake-ls")).unwrap(), "v1\n");
        assert!(dir.join("package-lock.json").exists());
        assert_eq!(list(&root.path().join("servers")), vec!["fake-ls".to_string()]);
    }

    #[tokio::test]
    async fn test_reinstall_replaces_previous_install() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("servers/fake-ls");
        installer(root.path(), WORKING_INSTALL)
            .start_installation(&entry())
            .await
            .unwrap();

        let installer = installer(root.path(), "mkdir -p bin && echo v2 > bin/fake-ls");
        installer.start_installation(&entry()).await.unwrap();

        assert_eq!(std::fs::read_to_string(dir.join("bin/fake-ls")).unwrap(), "v2\n");
        assert_eq!(list(&dir), vec!["bin".to_string()]);
        assert_eq!(list(&root.path().join("servers")), vec!["fake-ls".to_string()]);
    }

    #[tokio::test]
    async fn test_interrupted_install_is_recovered() {
        let root = tempfile::tempdir().unwrap();
        let backup = root.path().join("servers/.fake-ls.previous");
        std::fs::create_dir_all(backup.join("bin")).unwrap();
        std::fs::write(backup.join("bin/fake-ls"), "v1\n").unwrap();

        let installer = installer(root.path(), "exit 1");
        assert!(installer.start_installation(&entry()).await.is_err());

        let dir = root.path().join("servers/fake-ls");
        assert_eq!(std::fs::read_to_string(dir.join("bin/fake-ls")).unwrap(), "v1\n");
        assert!(!backup.exists());
    }

    #[tokio::test]
    async fn test_manifest_failure_registers_nothing() {
        let root = tempfile::tempdir().unwrap();
        let installer = installer(root.path(), "mkdir -p bin && touch bin/fake-ls");

        // The manifest can no longer be replaced
        let manifest = root.path().join("manifest.json");
        std::fs::create_dir_all(manifest.join("locked")).unwrap();

        assert!(installer.start_installation(&entry()).await.is_err());
        assert_eq!(installer.current().unwrap().phase, InstallPhase::Failed);
        for language in ["fake", "fakescript"] {
            assert!(installer.configs.get(language).await.is_none());
        }
        assert!(!root.path().join("servers/fake-ls").exists());
    }
}
