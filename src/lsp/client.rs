//! LSP client implementation
//!
//! Handles communication with a single LSP server via JSON-RPC over
//! stdin/stdout. A writer task owns the server's input, a reader task routes
//! responses to waiting requests and forwards everything the server initiates
//! to the event listener.

use super::cache::{CacheKey, RequestKind, ResponseCache};
use super::codec::LspCodec;
use crate::types::{LanguageServerBinary, LspError};
use futures::{SinkExt, StreamExt};
use lsp_server::{Message, Notification, Request, RequestId, Response};
use lsp_types::notification::{self, Notification as LspNotification};
use lsp_types::request::{self, Request as LspRequest};
use lsp_types::*;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// How long a server gets to exit once its input is closed.
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Response>>>>;

enum Outbound {
    Message(Message),
    /// Flush and close the server's input, then acknowledge
    Close(oneshot::Sender<()>),
}

/// Outcome of a document open/close, so no-ops are visible to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentChange {
    Opened,
    AlreadyOpen,
    Closed,
    NotOpen,
}

/// Session parameters for one server.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub root: PathBuf,
    pub workspace_folders: Vec<PathBuf>,
    pub initialization_options: Option<Value>,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            workspace_folders: Vec::new(),
            initialization_options: None,
            request_timeout: crate::config::DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

fn file_url(path: &Path) -> Result<Url, LspError> {
    Url::from_file_path(path).map_err(|_| LspError::InvalidPath(path.to_path_buf()))
}

fn folder(path: &Path) -> Result<WorkspaceFolder, LspError> {
    Ok(WorkspaceFolder {
        uri: file_url(path)?,
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string()),
    })
}

/// LSP client for a single language server
pub struct LspClient {
    /// Language ID (e.g., "rust", "typescript")
    language: String,
    config: ClientConfig,
    next_id: AtomicI32,
    pending: PendingMap,
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Server-initiated traffic, handed to the event listener once
    events: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    transport: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
    process: Mutex<Option<Child>>,
    initialized: OnceCell<InitializeResult>,
    documents: Mutex<HashSet<Url>>,
    diagnostics: Mutex<HashMap<Url, Vec<Diagnostic>>>,
    registrations: Mutex<HashMap<String, Registration>>,
    cache: ResponseCache,
}

impl std::fmt::Debug for LspClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspClient")
            .field("language", &self.language)
            .field("root", &self.config.root)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl LspClient {
    /// Spawn a language server process and connect to its stdio.
    pub fn spawn(
        language: &str,
        binary: &LanguageServerBinary,
        config: ClientConfig,
    ) -> Result<Self, LspError> {
        info!(language = %language, "Spawning {}", binary.path.display());

        let mut command = Command::new(&binary.path);
        command
            .args(&binary.args)
            .envs(&binary.env)
            .current_dir(&config.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Terminal signals go to the host, not straight to the server
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            LspError::ConfigError(format!(
                "Failed to spawn {}: {}",
                binary.path.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LspError::ProtocolError("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LspError::ProtocolError("Failed to get stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let language = language.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(language = %language, "stderr: {}", line);
                }
            });
        }

        Ok(Self::from_transport(language, stdout, stdin, Some(child), config))
    }

    /// Connect over an arbitrary byte stream pair.
    pub fn from_transport<R, W>(
        language: &str,
        reader: R,
        writer: W,
        process: Option<Child>,
        config: ClientConfig,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let transport = CancellationToken::new();

        tokio::spawn(write_loop(
            language.to_string(),
            FramedWrite::new(writer, LspCodec::new()),
            outbound_rx,
            transport.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            language.to_string(),
            FramedRead::new(reader, LspCodec::new()),
            Arc::clone(&pending),
            events_tx,
            transport.clone(),
        ));

        Self {
            language: language.to_string(),
            config,
            next_id: AtomicI32::new(1),
            pending,
            outbound,
            events: std::sync::Mutex::new(Some(events_rx)),
            transport,
            reader: Mutex::new(Some(reader)),
            process: Mutex::new(process),
            initialized: OnceCell::new(),
            documents: Mutex::new(HashSet::new()),
            diagnostics: Mutex::new(HashMap::new()),
            registrations: Mutex::new(HashMap::new()),
            cache: ResponseCache::default(),
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Take the stream of server-initiated messages. Only the first call
    /// gets it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Whether the transport is gone, either closed or crashed.
    pub fn is_closed(&self) -> bool {
        self.transport.is_cancelled()
    }

    /// Send a request and wait for its response.
    pub async fn request<R>(&self, params: R::Params) -> Result<R::Result, LspError>
    where
        R: LspRequest,
    {
        if self.is_closed() {
            return Err(LspError::ServerCrashed(self.language.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request_id = RequestId::from(id);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        debug!(language = %self.language, "Sending request {}: {}", id, R::METHOD);
        let request = Request::new(request_id.clone(), R::METHOD.to_string(), params);
        if self.outbound.send(Outbound::Message(request.into())).is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(LspError::ServerCrashed(self.language.clone()));
        }

        let response = match timeout(self.config.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(LspError::ServerCrashed(self.language.clone())),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                let _ = self.notify::<notification::Cancel>(CancelParams {
                    id: NumberOrString::Number(id),
                });
                return Err(LspError::Timeout(self.config.request_timeout.as_secs()));
            }
        };

        if let Some(error) = response.error {
            return Err(LspError::ProtocolError(format!(
                "{} failed: {} (code {})",
                R::METHOD,
                error.message,
                error.code
            )));
        }
        // A null result arrives as no result at all
        serde_json::from_value(response.result.unwrap_or(Value::Null)).map_err(|e| {
            LspError::ProtocolError(format!("Failed to parse {} response: {}", R::METHOD, e))
        })
    }

    /// Send a notification (no response expected)
    pub fn notify<N>(&self, params: N::Params) -> Result<(), LspError>
    where
        N: LspNotification,
    {
        trace!(language = %self.language, "Sending notification: {}", N::METHOD);
        let notification = Notification::new(N::METHOD.to_string(), params);
        self.outbound
            .send(Outbound::Message(notification.into()))
            .map_err(|_| LspError::ServerCrashed(self.language.clone()))
    }

    /// Reply to a server-initiated request.
    pub fn respond(&self, response: Response) -> Result<(), LspError> {
        self.outbound
            .send(Outbound::Message(response.into()))
            .map_err(|_| LspError::ServerCrashed(self.language.clone()))
    }

    /// Perform the initialize handshake. Later calls return the first result
    /// without talking to the server again.
    pub async fn initialize(&self) -> Result<InitializeResult, LspError> {
        self.initialized
            .get_or_try_init(|| self.handshake())
            .await
            .cloned()
    }

    async fn handshake(&self) -> Result<InitializeResult, LspError> {
        let root_uri = file_url(&self.config.root)?;
        let mut folders = vec![folder(&self.config.root)?];
        for path in &self.config.workspace_folders {
            if path != &self.config.root {
                folders.push(folder(path)?);
            }
        }

        #[allow(deprecated)]
        let params = InitializeParams {
            process_id: Some(std::process::id()),
            root_uri: Some(root_uri),
            initialization_options: self.config.initialization_options.clone(),
            capabilities: client_capabilities(),
            workspace_folders: Some(folders),
            client_info: Some(ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            ..Default::default()
        };

        let result = self.request::<request::Initialize>(params).await?;
        self.notify::<notification::Initialized>(InitializedParams {})?;

        info!(
            language = %self.language,
            "Initialized {}",
            result
                .server_info
                .as_ref()
                .map(|s| s.name.as_str())
                .unwrap_or("language server")
        );
        Ok(result)
    }

    /// Capabilities negotiated during the handshake.
    pub fn capabilities(&self) -> Option<&ServerCapabilities> {
        self.initialized.get().map(|r| &r.capabilities)
    }

    pub async fn did_open(&self, document: TextDocumentItem) -> Result<DocumentChange, LspError> {
        let mut documents = self.documents.lock().await;
        if documents.contains(&document.uri) {
            debug!("{} is already open", document.uri);
            return Ok(DocumentChange::AlreadyOpen);
        }

        let uri = document.uri.clone();
        self.notify::<notification::DidOpenTextDocument>(DidOpenTextDocumentParams {
            text_document: document,
        })?;
        self.cache.invalidate_document(&uri);
        documents.insert(uri);
        Ok(DocumentChange::Opened)
    }

    /// Open a file from disk under this client's language id.
    pub async fn open_path(&self, path: &Path) -> Result<Url, LspError> {
        let uri = file_url(path)?;
        let text = tokio::fs::read_to_string(path).await?;
        self.did_open(TextDocumentItem {
            uri: uri.clone(),
            language_id: self.language.clone(),
            version: 1,
            text,
        })
        .await?;
        Ok(uri)
    }

    pub async fn did_close(&self, uri: &Url) -> Result<DocumentChange, LspError> {
        let mut documents = self.documents.lock().await;
        if !documents.contains(uri) {
            return Ok(DocumentChange::NotOpen);
        }

        self.notify::<notification::DidCloseTextDocument>(DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
        })?;
        documents.remove(uri);
        self.cache.invalidate_document(uri);
        self.diagnostics.lock().await.remove(uri);
        Ok(DocumentChange::Closed)
    }

    pub async fn is_open(&self, uri: &Url) -> bool {
        self.documents.lock().await.contains(uri)
    }

    async fn cached_request<R>(&self, key: CacheKey, params: R::Params) -> Result<R::Result, LspError>
    where
        R: LspRequest,
    {
        if let Some(hit) = self.cache.get::<R::Result>(&key) {
            trace!("Cache hit for {} on {}", R::METHOD, key.document_uri);
            return Ok(hit);
        }
        let result = self.request::<R>(params).await?;
        self.cache.set(key, &result);
        Ok(result)
    }

    pub async fn completion(
        &self,
        params: CompletionParams,
    ) -> Result<Option<CompletionResponse>, LspError> {
        self.request::<request::Completion>(params).await
    }

    /// Document symbols
    pub async fn document_symbols(
        &self,
        uri: &Url,
    ) -> Result<Option<DocumentSymbolResponse>, LspError> {
        let params = DocumentSymbolParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        self.cached_request::<request::DocumentSymbolRequest>(
            CacheKey::new(uri.clone(), RequestKind::DocumentSymbols),
            params,
        )
        .await
    }

    pub async fn formatting(
        &self,
        params: DocumentFormattingParams,
    ) -> Result<Option<Vec<TextEdit>>, LspError> {
        self.request::<request::Formatting>(params).await
    }

    pub async fn range_formatting(
        &self,
        params: DocumentRangeFormattingParams,
    ) -> Result<Option<Vec<TextEdit>>, LspError> {
        self.request::<request::RangeFormatting>(params).await
    }

    pub async fn on_type_formatting(
        &self,
        params: DocumentOnTypeFormattingParams,
    ) -> Result<Option<Vec<TextEdit>>, LspError> {
        self.request::<request::OnTypeFormatting>(params).await
    }

    pub async fn declaration(
        &self,
        params: request::GotoDeclarationParams,
    ) -> Result<Option<request::GotoDeclarationResponse>, LspError> {
        self.request::<request::GotoDeclaration>(params).await
    }

    pub async fn document_color(&self, uri: &Url) -> Result<Vec<ColorInformation>, LspError> {
        let params = DocumentColorParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        self.cached_request::<request::DocumentColor>(
            CacheKey::new(uri.clone(), RequestKind::DocumentColor),
            params,
        )
        .await
    }

    pub async fn document_links(&self, uri: &Url) -> Result<Option<Vec<DocumentLink>>, LspError> {
        let params = DocumentLinkParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        self.cached_request::<request::DocumentLinkRequest>(
            CacheKey::new(uri.clone(), RequestKind::DocumentLinks),
            params,
        )
        .await
    }

    pub async fn resolve_document_link(&self, link: DocumentLink) -> Result<DocumentLink, LspError> {
        self.request::<request::DocumentLinkResolve>(link).await
    }

    pub async fn inlay_hints(
        &self,
        uri: &Url,
        range: Range,
    ) -> Result<Option<Vec<InlayHint>>, LspError> {
        let params = InlayHintParams {
            work_done_progress_params: WorkDoneProgressParams::default(),
            text_document: TextDocumentIdentifier { uri: uri.clone() },
            range,
        };
        let key = CacheKey::new(uri.clone(), RequestKind::InlayHints).with_discriminator(format!(
            "{}:{}-{}:{}",
            range.start.line, range.start.character, range.end.line, range.end.character
        ));
        self.cached_request::<request::InlayHintRequest>(key, params)
            .await
    }

    pub async fn resolve_inlay_hint(&self, hint: InlayHint) -> Result<InlayHint, LspError> {
        self.request::<request::InlayHintResolveRequest>(hint).await
    }

    pub async fn prepare_call_hierarchy(
        &self,
        params: CallHierarchyPrepareParams,
    ) -> Result<Option<Vec<CallHierarchyItem>>, LspError> {
        self.request::<request::CallHierarchyPrepare>(params).await
    }

    pub async fn incoming_calls(
        &self,
        item: CallHierarchyItem,
    ) -> Result<Option<Vec<CallHierarchyIncomingCall>>, LspError> {
        self.request::<request::CallHierarchyIncomingCalls>(CallHierarchyIncomingCallsParams {
            item,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        })
        .await
    }

    pub async fn outgoing_calls(
        &self,
        item: CallHierarchyItem,
    ) -> Result<Option<Vec<CallHierarchyOutgoingCall>>, LspError> {
        self.request::<request::CallHierarchyOutgoingCalls>(CallHierarchyOutgoingCallsParams {
            item,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        })
        .await
    }

    /// Latest diagnostics published for a document.
    pub async fn diagnostics(&self, uri: &Url) -> Vec<Diagnostic> {
        self.diagnostics
            .lock()
            .await
            .get(uri)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) async fn record_diagnostics(&self, params: PublishDiagnosticsParams) {
        let mut diagnostics = self.diagnostics.lock().await;
        if params.diagnostics.is_empty() {
            diagnostics.remove(&params.uri);
        } else {
            diagnostics.insert(params.uri, params.diagnostics);
        }
    }

    pub(crate) async fn register_capabilities(&self, registrations: Vec<Registration>) {
        let mut current = self.registrations.lock().await;
        for registration in registrations {
            debug!(language = %self.language, "Server registered {}", registration.method);
            current.insert(registration.id.clone(), registration);
        }
    }

    pub(crate) async fn unregister_capabilities(&self, unregistrations: Vec<Unregistration>) {
        let mut current = self.registrations.lock().await;
        for unregistration in unregistrations {
            if current.remove(&unregistration.id).is_none() {
                debug!("Unknown registration {}", unregistration.id);
            }
        }
    }

    /// Capabilities the server registered dynamically.
    pub async fn registrations(&self) -> Vec<Registration> {
        let mut registrations: Vec<_> = self.registrations.lock().await.values().cloned().collect();
        registrations.sort_by(|a, b| a.id.cmp(&b.id));
        registrations
    }

    pub fn workspace_folders(&self) -> Vec<WorkspaceFolder> {
        std::iter::once(&self.config.root)
            .chain(self.config.workspace_folders.iter().filter(|p| **p != self.config.root))
            .filter_map(|path| folder(path).ok())
            .collect()
    }

    /// Shut the server down: `shutdown`, then `exit`, then close the
    /// transport and reap the process.
    pub async fn shutdown(&self) -> Result<(), LspError> {
        info!(language = %self.language, "Shutting down language server");

        let result = self.request::<request::Shutdown>(()).await;
        match &result {
            Ok(()) => {
                // exit is only valid once shutdown was acknowledged
                let _ = self.notify::<notification::Exit>(());
            }
            Err(e) => warn!(language = %self.language, "Shutdown request failed: {}", e),
        }

        self.close_transport().await;
        result
    }

    /// Tear down without the protocol handshake.
    pub async fn terminate(&self) {
        warn!(language = %self.language, "Terminating language server");
        self.transport.cancel();
        if let Some(mut child) = self.process.lock().await.take() {
            let _ = child.kill().await;
        }
    }

    async fn close_transport(&self) {
        let (ack, acked) = oneshot::channel();
        if self.outbound.send(Outbound::Close(ack)).is_ok() {
            let _ = timeout(EXIT_TIMEOUT, acked).await;
        }

        // The server closes its output when it exits
        if let Some(reader) = self.reader.lock().await.take() {
            if timeout(EXIT_TIMEOUT, reader).await.is_err() {
                debug!(language = %self.language, "Server kept its output open");
            }
        }
        self.transport.cancel();

        if let Some(mut child) = self.process.lock().await.take() {
            match timeout(EXIT_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => debug!(language = %self.language, "Server exited with {}", status),
                _ => {
                    warn!(language = %self.language, "Server did not exit, killing it");
                    let _ = child.kill().await;
                }
            }
        }
    }
}

impl Drop for LspClient {
    fn drop(&mut self) {
        // Stops the transport tasks; the process is killed on drop
        self.transport.cancel();
    }
}

fn client_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        workspace: Some(WorkspaceClientCapabilities {
            configuration: Some(true),
            workspace_folders: Some(true),
            apply_edit: Some(true),
            ..Default::default()
        }),
        window: Some(WindowClientCapabilities {
            work_done_progress: Some(true),
            show_document: Some(ShowDocumentClientCapabilities { support: true }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn write_loop<W>(
    language: String,
    mut sink: FramedWrite<W, LspCodec>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    transport: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let next = tokio::select! {
            _ = transport.cancelled() => None,
            next = outbound.recv() => next,
        };
        match next {
            Some(Outbound::Message(message)) => {
                if let Err(e) = sink.send(message).await {
                    error!(language = %language, "Failed to write message: {}", e);
                    break;
                }
            }
            Some(Outbound::Close(ack)) => {
                if let Err(e) = sink.close().await {
                    debug!(language = %language, "Closing server input: {}", e);
                }
                drop(sink);
                let _ = ack.send(());
                return;
            }
            None => break,
        }
    }
}

async fn read_loop<R>(
    language: String,
    mut frames: FramedRead<R, LspCodec>,
    pending: PendingMap,
    events: mpsc::UnboundedSender<Message>,
    transport: CancellationToken,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = transport.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(Message::Response(response))) => {
                let waiter = pending.lock().await.remove(&response.id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => warn!(language = %language, "Response for unknown request {}", response.id),
                }
            }
            Some(Ok(message)) => {
                if events.send(message).is_err() {
                    trace!(language = %language, "No listener for server message");
                }
            }
            Some(Err(e)) => {
                error!(language = %language, "Failed to read from server: {}", e);
                break;
            }
            None => {
                info!(language = %language, "Language server closed its output");
                break;
            }
        }
    }

    // Outstanding requests fail instead of waiting for their timeout
    pending.lock().await.clear();
    transport.cancel();
}
