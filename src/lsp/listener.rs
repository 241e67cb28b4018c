//! Per-server event loop
//!
//! Drains everything a server initiates, answers its requests and republishes
//! what presentation layers care about as [`LanguageEvent`]s.

use super::client::LspClient;
use super::protocol::{ServerNotification, ServerRequest};
use crate::types::LspError;
use lsp_server::{ErrorCode, Message, Notification, Request, Response};
use lsp_types::{
    ApplyWorkspaceEditResponse, ConfigurationItem, Diagnostic, MessageType, ProgressParams,
    ShowDocumentParams, ShowDocumentResult, Url, WorkspaceEdit,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Something a language server reported that the host may want to show.
#[derive(Debug, Clone)]
pub struct LanguageEvent {
    pub language: String,
    pub kind: LanguageEventKind,
}

#[derive(Debug, Clone)]
pub enum LanguageEventKind {
    Diagnostics {
        uri: Url,
        diagnostics: Vec<Diagnostic>,
    },
    Message {
        typ: MessageType,
        message: String,
    },
    /// The server asked for an edit; it was answered as not applied
    ApplyEditRequested(WorkspaceEdit),
    ShowDocumentRequested(ShowDocumentParams),
    Progress(ProgressParams),
    RefreshRequested(&'static str),
    /// The server closed its output without being stopped
    Exited,
}

pub struct EventListener {
    language: String,
    client: Arc<LspClient>,
    events: mpsc::UnboundedReceiver<Message>,
    publisher: broadcast::Sender<LanguageEvent>,
    /// User settings served to `workspace/configuration`
    settings: Option<Value>,
}

impl EventListener {
    pub fn new(
        client: Arc<LspClient>,
        events: mpsc::UnboundedReceiver<Message>,
        publisher: broadcast::Sender<LanguageEvent>,
        settings: Option<Value>,
    ) -> Self {
        Self {
            language: client.language().to_string(),
            client,
            events,
            publisher,
            settings,
        }
    }

    pub fn spawn(self) -> ListenerHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(cancel.clone()));
        ListenerHandle {
            cancel,
            task: Some(task),
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        debug!(language = %self.language, "Event listener started");
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = self.events.recv() => message,
            };
            let Some(message) = message else {
                warn!(language = %self.language, "Language server exited");
                self.publish(LanguageEventKind::Exited);
                break;
            };
            self.dispatch(message).await;
        }
        debug!(language = %self.language, "Event listener stopped");
    }

    async fn dispatch(&self, message: Message) {
        match message {
            Message::Request(request) => self.handle_request(request).await,
            Message::Notification(notification) => self.handle_notification(notification).await,
            Message::Response(response) => {
                trace!(language = %self.language, "Stray response {}", response.id)
            }
        }
    }

    async fn handle_request(&self, request: Request) {
        let Request { id, method, params } = request;
        let response = match ServerRequest::parse(&method, params) {
            Ok(Some(request)) => match self.answer(request).await {
                Ok(result) => Response::new_ok(id, result),
                Err(e) => Response::new_err(id, ErrorCode::InternalError as i32, e.to_string()),
            },
            Ok(None) => {
                debug!(language = %self.language, "Unsupported server request {}", method);
                Response::new_err(
                    id,
                    ErrorCode::MethodNotFound as i32,
                    format!("{} is not supported", method),
                )
            }
            Err(e) => Response::new_err(id, ErrorCode::InvalidParams as i32, e.to_string()),
        };

        if let Err(e) = self.client.respond(response) {
            debug!(language = %self.language, "Cannot answer {}: {}", method, e);
        }
    }

    async fn answer(&self, request: ServerRequest) -> Result<Value, LspError> {
        let method = request.method();
        trace!(language = %self.language, "Server request {}", method);
        let result = match request {
            ServerRequest::WorkspaceConfiguration(params) => {
                let values: Vec<Value> = params
                    .items
                    .iter()
                    .map(|item| self.configuration(item))
                    .collect();
                serde_json::to_value(values)?
            }
            ServerRequest::WorkspaceFolders => serde_json::to_value(self.client.workspace_folders())?,
            ServerRequest::ApplyEdit(params) => {
                self.publish(LanguageEventKind::ApplyEditRequested(params.edit));
                serde_json::to_value(ApplyWorkspaceEditResponse {
                    applied: false,
                    failure_reason: Some("edits are applied by the editor".to_string()),
                    failed_change: None,
                })?
            }
            ServerRequest::RegisterCapability(params) => {
                self.client.register_capabilities(params.registrations).await;
                Value::Null
            }
            ServerRequest::UnregisterCapability(params) => {
                self.client
                    .unregister_capabilities(params.unregisterations)
                    .await;
                Value::Null
            }
            ServerRequest::CodeLensRefresh | ServerRequest::SemanticTokensRefresh => {
                self.publish(LanguageEventKind::RefreshRequested(method));
                Value::Null
            }
            ServerRequest::ShowMessageRequest(params) => {
                self.publish(LanguageEventKind::Message {
                    typ: params.typ,
                    message: params.message,
                });
                // No action chosen
                Value::Null
            }
            ServerRequest::ShowDocument(params) => {
                self.publish(LanguageEventKind::ShowDocumentRequested(params));
                serde_json::to_value(ShowDocumentResult { success: false })?
            }
            ServerRequest::WorkDoneProgressCreate(_) => Value::Null,
        };
        Ok(result)
    }

    /// Settings section for one configuration item, `null` when absent.
    fn configuration(&self, item: &ConfigurationItem) -> Value {
        let Some(settings) = &self.settings else {
            return Value::Null;
        };
        match item.section.as_deref() {
            None | Some("") => settings.clone(),
            Some(section) => section
                .split('.')
                .try_fold(settings, |value, key| value.get(key))
                .cloned()
                .unwrap_or(Value::Null),
        }
    }

    async fn handle_notification(&self, notification: Notification) {
        let Notification { method, params } = notification;
        let notification = match ServerNotification::parse(&method, params) {
            Ok(Some(notification)) => notification,
            Ok(None) => {
                trace!(language = %self.language, "Ignoring notification {}", method);
                return;
            }
            Err(e) => {
                warn!(language = %self.language, "Malformed {} notification: {}", method, e);
                return;
            }
        };

        match notification {
            ServerNotification::LogMessage(params) => {
                let language = &self.language;
                match params.typ {
                    MessageType::ERROR => error!(language = %language, "{}", params.message),
                    MessageType::WARNING => warn!(language = %language, "{}", params.message),
                    MessageType::INFO => info!(language = %language, "{}", params.message),
                    _ => debug!(language = %language, "{}", params.message),
                }
            }
            ServerNotification::ShowMessage(params) => {
                self.publish(LanguageEventKind::Message {
                    typ: params.typ,
                    message: params.message,
                });
            }
            ServerNotification::PublishDiagnostics(params) => {
                let event = LanguageEventKind::Diagnostics {
                    uri: params.uri.clone(),
                    diagnostics: params.diagnostics.clone(),
                };
                self.client.record_diagnostics(params).await;
                self.publish(event);
            }
            ServerNotification::Telemetry(payload) => {
                trace!(language = %self.language, "Telemetry: {}", payload)
            }
            ServerNotification::Cancel(params) => {
                // Server requests are answered synchronously, nothing to abort
                trace!(language = %self.language, "Server cancelled {:?}", params.id)
            }
            ServerNotification::Progress(params) => self.publish(LanguageEventKind::Progress(params)),
            ServerNotification::LogTrace(params) => {
                trace!(language = %self.language, "{}", params.message)
            }
        }
    }

    fn publish(&self, kind: LanguageEventKind) {
        // No subscribers is fine
        let _ = self.publisher.send(LanguageEvent {
            language: self.language.clone(),
            kind,
        });
    }
}

/// Owner's handle on a running listener.
pub struct ListenerHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Ask the loop to stop. Safe to call any number of times.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel and wait until the loop has returned.
    pub async fn stop(&mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Event listener ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsp::client::ClientConfig;
    use crate::lsp::testing::FakeServer;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_configuration_lookup() {
        let server = FakeServer::default();
        let (reader, writer) = server.connect();
        let client = Arc::new(LspClient::from_transport(
            "python",
            reader,
            writer,
            None,
            ClientConfig::new("/tmp/project"),
        ));
        let (publisher, _) = broadcast::channel(8);
        let (_tx, events) = mpsc::unbounded_channel();
        let listener = EventListener::new(
            client,
            events,
            publisher,
            Some(json!({"python": {"analysis": {"typeCheckingMode": "strict"}}})),
        );

        let item = |section: Option<&str>| ConfigurationItem {
            scope_uri: None,
            section: section.map(String::from),
        };
        assert_eq!(
            listener.configuration(&item(Some("python.analysis"))),
            json!({"typeCheckingMode": "strict"})
        );
        assert_eq!(listener.configuration(&item(Some("python.missing"))), Value::Null);
        assert_eq!(
            listener.configuration(&item(None)),
            json!({"python": {"analysis": {"typeCheckingMode": "strict"}}})
        );
    }

    #[tokio::test]
    async fn test_listener_answers_and_publishes() {
        let (sink, mut answers) = mpsc::unbounded_channel();
        let server = FakeServer::default().with_settings_sink(sink);
        let (reader, writer) = server.connect();
        let client = Arc::new(LspClient::from_transport(
            "python",
            reader,
            writer,
            None,
            ClientConfig::new("/tmp/project"),
        ));
        client.initialize().await.unwrap();

        let (publisher, mut subscriber) = broadcast::channel(8);
        let events = client.take_events().unwrap();
        assert!(client.take_events().is_none());
        let mut handle = EventListener::new(
            client.clone(),
            events,
            publisher,
            Some(json!({"python": {"analysis": {"autoImportCompletions": true}}})),
        )
        .spawn();

        let answer = tokio::time::timeout(Duration::from_secs(5), answers.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer, json!([{"autoImportCompletions": true}, null]));

        handle.cancel();
        handle.cancel();
        handle.stop().await;
        assert!(handle.is_cancelled());

        client.shutdown().await.unwrap();
        // The listener was already gone, so the exit is not reported
        assert!(subscriber.try_recv().is_err());
    }
}
