//! LSP manager for lifecycle management
//!
//! Owns the registry of running servers, at most one per language, together
//! with the event listener attached to each.

use super::client::{ClientConfig, DocumentChange, LspClient};
use super::listener::{EventListener, LanguageEvent, ListenerHandle};
use crate::config::{ServerConfig, ServerConfigs, StartPolicy};
use crate::types::{LanguageServerBinary, LspError, ShutdownErrors};
use async_trait::async_trait;
use lsp_types::{TextDocumentItem, Url};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Produces a connected, not yet initialized client for a language.
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(
        &self,
        language: &str,
        binary: &LanguageServerBinary,
        config: ClientConfig,
    ) -> Result<LspClient, LspError>;
}

/// Spawns the configured executable as a child process.
pub struct ProcessLauncher;

#[async_trait]
impl ServerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        language: &str,
        binary: &LanguageServerBinary,
        config: ClientConfig,
    ) -> Result<LspClient, LspError> {
        if binary.path.is_absolute() {
            if !binary.path.exists() {
                return Err(LspError::ConfigError(format!(
                    "{} server not found at {}",
                    language,
                    binary.path.display()
                )));
            }
        } else if which::which(&binary.path).is_err() {
            return Err(LspError::ConfigError(format!(
                "{} server {} is not on PATH",
                language,
                binary.path.display()
            )));
        }
        LspClient::spawn(language, binary, config)
    }
}

struct ActiveServer {
    client: Arc<LspClient>,
    listener: ListenerHandle,
}

impl ActiveServer {
    /// Listener first, so nothing is dispatched against a closing transport.
    async fn stop(mut self) -> Result<(), LspError> {
        self.listener.stop().await;
        self.client.shutdown().await
    }
}

/// One language's entry in the registry.
#[derive(Default)]
struct ServerSlot {
    /// Held across launch, handshake and shutdown of this language only
    lifecycle: Mutex<Option<ActiveServer>>,
    /// Set once a start succeeds, cleared before a stop begins
    running: std::sync::Mutex<Option<(Arc<LspClient>, ServerConfig)>>,
}

impl ServerSlot {
    fn running(&self) -> Option<(Arc<LspClient>, ServerConfig)> {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn publish(&self, running: Option<(Arc<LspClient>, ServerConfig)>) {
        *self.running.lock().unwrap_or_else(|e| e.into_inner()) = running;
    }
}

/// LSP Manager handles lifecycle of all LSP clients
pub struct LspManager {
    configs: Arc<ServerConfigs>,
    /// Per-language slots; the map lock only covers lookup and insert
    servers: Mutex<HashMap<String, Arc<ServerSlot>>>,
    events: broadcast::Sender<LanguageEvent>,
    request_timeout: Duration,
    launcher: Arc<dyn ServerLauncher>,
}

impl LspManager {
    pub fn new(configs: Arc<ServerConfigs>, request_timeout: Duration) -> Self {
        Self::with_launcher(configs, request_timeout, Arc::new(ProcessLauncher))
    }

    pub fn with_launcher(
        configs: Arc<ServerConfigs>,
        request_timeout: Duration,
        launcher: Arc<dyn ServerLauncher>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            configs,
            servers: Mutex::new(HashMap::new()),
            events,
            request_timeout,
            launcher,
        }
    }

    /// Events from every running server.
    pub fn subscribe(&self) -> broadcast::Receiver<LanguageEvent> {
        self.events.subscribe()
    }

    async fn slot(&self, language: &str) -> Arc<ServerSlot> {
        let mut servers = self.servers.lock().await;
        Arc::clone(servers.entry(language.to_string()).or_default())
    }

    async fn existing_slot(&self, language: &str) -> Option<Arc<ServerSlot>> {
        self.servers.lock().await.get(language).cloned()
    }

    /// Start and initialize the server for `language`.
    ///
    /// The language's slot stays locked until the new server is registered,
    /// so two processes for one language never run side by side. Other
    /// languages are not held up.
    pub async fn start_server(
        &self,
        language: &str,
        root: impl Into<PathBuf>,
        workspace_folders: Vec<PathBuf>,
        policy: StartPolicy,
    ) -> Result<Arc<LspClient>, LspError> {
        let slot = self.slot(language).await;
        let mut active = slot.lifecycle.lock().await;

        if active.is_some() {
            match policy {
                StartPolicy::Reject => {
                    return Err(LspError::ServerAlreadyRunning(language.to_string()))
                }
                StartPolicy::Replace => {
                    info!(language = %language, "Replacing running language server");
                    slot.publish(None);
                    if let Some(previous) = active.take() {
                        if let Err(e) = previous.stop().await {
                            warn!(language = %language, "Previous server did not stop cleanly: {}", e);
                        }
                    }
                }
            }
        }

        let config = self.configs.get(language).await.ok_or_else(|| {
            LspError::ConfigError(format!("No language server configured for {}", language))
        })?;
        if !config.enabled {
            return Err(LspError::ConfigError(format!(
                "Language server for {} is disabled",
                language
            )));
        }

        let mut client_config = ClientConfig::new(root);
        client_config.workspace_folders = workspace_folders;
        client_config.initialization_options = config.initialization_options.clone();
        client_config.request_timeout = self.request_timeout;

        let client = self
            .launcher
            .launch(language, &config.binary, client_config)
            .await?;
        if let Err(e) = client.initialize().await {
            error!(language = %language, "Language server failed to initialize: {}", e);
            client.terminate().await;
            return Err(e);
        }

        let client = Arc::new(client);
        let Some(events) = client.take_events() else {
            client.terminate().await;
            return Err(LspError::ProtocolError(
                "Server events were already taken".to_string(),
            ));
        };
        let listener = EventListener::new(
            Arc::clone(&client),
            events,
            self.events.clone(),
            config.settings.clone(),
        )
        .spawn();

        info!(language = %language, "Language server started: {}", config.binary.path.display());
        slot.publish(Some((Arc::clone(&client), config)));
        *active = Some(ActiveServer {
            client: Arc::clone(&client),
            listener,
        });
        Ok(client)
    }

    /// Stop one server. The entry is removed even when shutdown fails.
    pub async fn stop_server(&self, language: &str) -> Result<(), LspError> {
        let slot = self
            .existing_slot(language)
            .await
            .ok_or_else(|| LspError::ServerNotRunning(language.to_string()))?;
        let mut active = slot.lifecycle.lock().await;
        let server = active
            .take()
            .ok_or_else(|| LspError::ServerNotRunning(language.to_string()))?;
        slot.publish(None);
        info!(language = %language, "Stopping language server");
        server.stop().await
    }

    /// Stop every server, attempting all of them regardless of failures.
    pub async fn stop_all_servers(&self) -> Result<(), ShutdownErrors> {
        let slots: Vec<(String, Arc<ServerSlot>)> = {
            let servers = self.servers.lock().await;
            servers
                .iter()
                .map(|(language, slot)| (language.clone(), Arc::clone(slot)))
                .collect()
        };
        let mut failures = Vec::new();

        for (language, slot) in slots {
            let mut active = slot.lifecycle.lock().await;
            let Some(server) = active.take() else {
                continue;
            };
            slot.publish(None);
            if let Err(e) = server.stop().await {
                warn!(language = %language, "Failed to stop language server: {}", e);
                failures.push((language, e));
            }
        }

        if failures.is_empty() {
            info!("All language servers stopped");
            Ok(())
        } else {
            failures.sort_by(|a, b| a.0.cmp(&b.0));
            Err(ShutdownErrors { failures })
        }
    }

    pub async fn document_was_opened(
        &self,
        language: &str,
        document: TextDocumentItem,
    ) -> Result<DocumentChange, LspError> {
        let client = self.running(language).await?;
        client.did_open(document).await
    }

    pub async fn document_was_closed(
        &self,
        language: &str,
        uri: &Url,
    ) -> Result<DocumentChange, LspError> {
        let client = self.running(language).await?;
        client.did_close(uri).await
    }

    /// The running client for a language, if any.
    pub async fn client(&self, language: &str) -> Option<Arc<LspClient>> {
        let slot = self.existing_slot(language).await?;
        slot.running().map(|(client, _)| client)
    }

    /// Resolved configuration of a running server.
    pub async fn server_config(&self, language: &str) -> Option<ServerConfig> {
        let slot = self.existing_slot(language).await?;
        slot.running().map(|(_, config)| config)
    }

    pub async fn active_languages(&self) -> Vec<String> {
        let servers = self.servers.lock().await;
        let mut languages: Vec<String> = servers
            .iter()
            .filter(|(_, slot)| slot.running().is_some())
            .map(|(language, _)| language.clone())
            .collect();
        languages.sort();
        languages
    }

    async fn running(&self, language: &str) -> Result<Arc<LspClient>, LspError> {
        self.client(language)
            .await
            .ok_or_else(|| LspError::ServerNotRunning(language.to_string()))
    }
}

impl Drop for LspManager {
    fn drop(&mut self) {
        // Can't await here; dropped clients cancel their transports and
        // kill their processes
        debug!("LspManager dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerOverride, UserConfig};
    use crate::lsp::listener::LanguageEventKind;
    use crate::lsp::testing::{FakeServer, InitReply};
    use serde_json::json;

    /// Connects each language to its own fake, or to the default one.
    #[derive(Default)]
    struct FakeLauncher {
        default: FakeServer,
        by_language: HashMap<String, FakeServer>,
    }

    impl FakeLauncher {
        fn with(mut self, language: &str, server: &FakeServer) -> Self {
            self.by_language.insert(language.to_string(), server.clone());
            self
        }
    }

    #[async_trait]
    impl ServerLauncher for FakeLauncher {
        async fn launch(
            &self,
            language: &str,
            _binary: &LanguageServerBinary,
            config: ClientConfig,
        ) -> Result<LspClient, LspError> {
            let server = self.by_language.get(language).unwrap_or(&self.default);
            let (reader, writer) = server.connect();
            Ok(LspClient::from_transport(language, reader, writer, None, config))
        }
    }

    async fn wait_until_gone(server: &FakeServer) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.live() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    fn user_config(languages: &[&str]) -> UserConfig {
        let mut user = UserConfig::default();
        for language in languages {
            user.servers.insert(
                language.to_string(),
                ServerOverride {
                    command: Some(PathBuf::from("/bin/fake")),
                    settings: Some(json!({"python": {"analysis": {"typeCheckingMode": "strict"}}})),
                    ..Default::default()
                },
            );
        }
        user
    }

    fn manager(dir: &tempfile::TempDir, server: &FakeServer, languages: &[&str]) -> LspManager {
        let launcher = FakeLauncher {
            default: server.clone(),
            ..Default::default()
        };
        manager_with(dir, launcher, languages, Duration::from_millis(300))
    }

    fn manager_with(
        dir: &tempfile::TempDir,
        launcher: FakeLauncher,
        languages: &[&str],
        request_timeout: Duration,
    ) -> LspManager {
        let configs =
            ServerConfigs::load(dir.path().join("manifest.json"), &user_config(languages)).unwrap();
        LspManager::with_launcher(Arc::new(configs), request_timeout, Arc::new(launcher))
    }

    fn document(uri: &str) -> TextDocumentItem {
        TextDocumentItem {
            uri: Url::parse(uri).unwrap(),
            language_id: "python".to_string(),
            version: 1,
            text: "print()".to_string(),
        }
    }

    #[tokio::test]
    async fn test_start_requires_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeServer::default();
        let manager = manager(&dir, &server, &[]);

        let err = manager
            .start_server("python", "/tmp/project", vec![], StartPolicy::Reject)
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::ConfigError(_)));
        assert_eq!(server.live(), 0);

        let err = manager.stop_server("python").await.unwrap_err();
        assert!(matches!(err, LspError::ServerNotRunning(_)));
    }

    #[tokio::test]
    async fn test_duplicate_start_never_runs_two_servers() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeServer::default();
        let manager = manager(&dir, &server, &["python"]);

        manager
            .start_server("python", "/tmp/project", vec![], StartPolicy::Reject)
            .await
            .unwrap();
        assert_eq!(server.live(), 1);

        let err = manager
            .start_server("python", "/tmp/project", vec![], StartPolicy::Reject)
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::ServerAlreadyRunning(_)));
        assert_eq!(server.live(), 1);

        manager
            .start_server("python", "/tmp/project", vec![], StartPolicy::Replace)
            .await
            .unwrap();
        assert_eq!(server.live(), 1);
        assert_eq!(server.count("initialize"), 2);
        assert_eq!(server.count("shutdown"), 1);
        assert_eq!(manager.active_languages().await, vec!["python".to_string()]);

        manager.stop_server("python").await.unwrap();
        assert_eq!(server.live(), 0);
        assert!(manager.client("python").await.is_none());
    }

    #[tokio::test]
    async fn test_documents_route_by_language() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeServer::default();
        let manager = manager(&dir, &server, &["python"]);
        manager
            .start_server("python", "/tmp/project", vec![], StartPolicy::Reject)
            .await
            .unwrap();

        let document = document("file:///tmp/project/app.py");
        assert_eq!(
            manager.document_was_opened("python", document.clone()).await.unwrap(),
            DocumentChange::Opened
        );
        assert_eq!(
            manager.document_was_closed("python", &document.uri).await.unwrap(),
            DocumentChange::Closed
        );
        let err = manager
            .document_was_opened("rust", document)
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::ServerNotRunning(_)));

        manager.stop_all_servers().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_all_attempts_every_server() {
        let dir = tempfile::tempdir().unwrap();
        let stubborn = FakeServer::default().ignoring_shutdown();
        let manager = manager(&dir, &stubborn, &["python", "rust", "go"]);
        for language in ["python", "rust", "go"] {
            manager
                .start_server(language, "/tmp/project", vec![], StartPolicy::Reject)
                .await
                .unwrap();
        }
        assert_eq!(stubborn.live(), 3);

        let errors = manager.stop_all_servers().await.unwrap_err();
        assert_eq!(errors.failures.len(), 3);
        assert!(errors
            .failures
            .iter()
            .all(|(_, e)| matches!(e, LspError::Timeout(_))));
        assert_eq!(stubborn.count("shutdown"), 3);
        assert!(manager.active_languages().await.is_empty());
        assert_eq!(stubborn.live(), 0);
    }

    #[tokio::test]
    async fn test_listener_serves_user_settings() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, mut answers) = tokio::sync::mpsc::unbounded_channel();
        let server = FakeServer::default().with_settings_sink(sink);
        let manager = manager(&dir, &server, &["python"]);
        let mut events = manager.subscribe();

        manager
            .start_server("python", "/tmp/project", vec![], StartPolicy::Reject)
            .await
            .unwrap();

        let answer = tokio::time::timeout(Duration::from_secs(5), answers.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer, json!([{"typeCheckingMode": "strict"}, null]));

        manager.stop_server("python").await.unwrap();
        // A requested stop is not reported as an exit
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event.kind, LanguageEventKind::Exited));
        }
    }

    #[tokio::test]
    async fn test_failed_initialize_leaves_nothing_running() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeServer::default().with_init_reply(InitReply::Error);
        let manager = manager(&dir, &server, &["python"]);

        let err = manager
            .start_server("python", "/tmp/project", vec![], StartPolicy::Reject)
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::ProtocolError(_)), "{:?}", err);
        assert_eq!(server.count("initialize"), 1);
        assert!(manager.active_languages().await.is_empty());
        assert!(manager.client("python").await.is_none());
        assert!(manager.server_config("python").await.is_none());
        wait_until_gone(&server).await;

        let err = manager.stop_server("python").await.unwrap_err();
        assert!(matches!(err, LspError::ServerNotRunning(_)));
    }

    #[tokio::test]
    async fn test_slow_handshake_does_not_block_other_languages() {
        let dir = tempfile::tempdir().unwrap();
        let python = FakeServer::default();
        let slow = FakeServer::default().with_init_reply(InitReply::Silent);
        let launcher = FakeLauncher::default()
            .with("python", &python)
            .with("slow", &slow);
        let manager = Arc::new(manager_with(
            &dir,
            launcher,
            &["python", "slow"],
            Duration::from_secs(3),
        ));
        manager
            .start_server("python", "/tmp/project", vec![], StartPolicy::Reject)
            .await
            .unwrap();

        let starting = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move {
                manager
                    .start_server("slow", "/tmp/project", vec![], StartPolicy::Reject)
                    .await
            }
        });
        tokio::time::timeout(Duration::from_secs(1), async {
            while slow.count("initialize") == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let routed = tokio::time::timeout(
            Duration::from_secs(1),
            manager.document_was_opened("python", document("file:///tmp/project/app.py")),
        )
        .await
        .expect("python routing waited on the slow handshake");
        assert_eq!(routed.unwrap(), DocumentChange::Opened);
        assert_eq!(manager.active_languages().await, vec!["python".to_string()]);

        let err = starting.await.unwrap().unwrap_err();
        assert!(matches!(err, LspError::Timeout(_)), "{:?}", err);
        wait_until_gone(&slow).await;
        assert_eq!(manager.active_languages().await, vec!["python".to_string()]);

        manager.stop_all_servers().await.unwrap();
        assert_eq!(python.live(), 0);
    }
}
