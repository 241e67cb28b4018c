//! In-process fake language server for tests

use super::codec::LspCodec;
use futures::{SinkExt, StreamExt};
use lsp_server::{ErrorCode, Message, Request, RequestId, Response};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Counts a server as live until its task finishes.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(live)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// How the fake answers `initialize`.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum InitReply {
    #[default]
    Capabilities,
    Error,
    Silent,
}

#[derive(Clone, Default)]
pub(crate) struct FakeServer {
    live: Arc<AtomicUsize>,
    methods: Arc<Mutex<HashMap<String, usize>>>,
    init: InitReply,
    /// Never answer `shutdown`
    ignore_shutdown: bool,
    /// Ask for `python.analysis` settings after `initialized` and forward
    /// the answer here
    settings_sink: Option<mpsc::UnboundedSender<Value>>,
}

impl FakeServer {
    pub fn ignoring_shutdown(mut self) -> Self {
        self.ignore_shutdown = true;
        self
    }

    pub fn with_init_reply(mut self, init: InitReply) -> Self {
        self.init = init;
        self
    }

    pub fn with_settings_sink(mut self, sink: mpsc::UnboundedSender<Value>) -> Self {
        self.settings_sink = Some(sink);
        self
    }

    /// Servers currently running, across every connection made.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// How often a method was received, across every connection made.
    pub fn count(&self, method: &str) -> usize {
        self.methods
            .lock()
            .unwrap()
            .get(method)
            .copied()
            .unwrap_or_default()
    }

    /// Start a server task and return the client's ends of the pipe.
    pub fn connect(&self) -> (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = self.clone();
        tokio::spawn(async move {
            let (reader, writer) = tokio::io::split(server_io);
            let mut frames = FramedRead::new(reader, LspCodec::new());
            let mut sink = FramedWrite::new(writer, LspCodec::new());
            let live = LiveGuard::new(server.live.clone());
            server.serve(&mut frames, &mut sink).await;
            // Released before the pipe closes, so a client that saw EOF
            // also sees the server gone
            drop(live);
        });
        tokio::io::split(client_io)
    }

    fn record(&self, method: &str) {
        *self
            .methods
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default() += 1;
    }

    async fn serve(
        &self,
        frames: &mut FramedRead<ReadHalf<DuplexStream>, LspCodec>,
        sink: &mut FramedWrite<WriteHalf<DuplexStream>, LspCodec>,
    ) {
        while let Some(Ok(message)) = frames.next().await {
            let reply = match message {
                Message::Request(request) => {
                    self.record(&request.method);
                    self.answer(request)
                }
                Message::Notification(notification) => {
                    self.record(&notification.method);
                    match notification.method.as_str() {
                        "exit" => return,
                        "initialized" if self.settings_sink.is_some() => {
                            Some(Message::Request(Request::new(
                                RequestId::from("settings".to_string()),
                                "workspace/configuration".to_string(),
                                json!({"items": [{"section": "python.analysis"}, {"section": "missing"}]}),
                            )))
                        }
                        _ => None,
                    }
                }
                Message::Response(response) => {
                    if let Some(sink) = &self.settings_sink {
                        let _ = sink.send(response.result.unwrap_or(Value::Null));
                    }
                    None
                }
            };
            if let Some(reply) = reply {
                if sink.send(reply).await.is_err() {
                    return;
                }
            }
        }
    }

    fn answer(&self, request: Request) -> Option<Message> {
        let response = match request.method.as_str() {
            "initialize" if self.init == InitReply::Silent => return None,
            "initialize" if self.init == InitReply::Error => Response::new_err(
                request.id,
                ErrorCode::InternalError as i32,
                "initialization refused".to_string(),
            ),
            "initialize" => Response::new_ok(
                request.id,
                json!({
                    "capabilities": {"documentSymbolProvider": true},
                    "serverInfo": {"name": "fake-ls", "version": "0.0.1"}
                }),
            ),
            "shutdown" if self.ignore_shutdown => return None,
            "shutdown" => Response::new_ok(request.id, Value::Null),
            "textDocument/documentSymbol" => Response::new_ok(
                request.id,
                json!([{
                    "name": "main",
                    "kind": 12,
                    "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 12}},
                    "selectionRange": {"start": {"line": 0, "character": 3}, "end": {"line": 0, "character": 7}}
                }]),
            ),
            method => Response::new_err(
                request.id,
                ErrorCode::MethodNotFound as i32,
                format!("{} is not supported", method),
            ),
        };
        Some(Message::Response(response))
    }
}
