//! LSP protocol runtime: per-server clients, their event listeners and the
//! manager that owns them

pub mod cache;
pub mod client;
pub mod codec;
pub mod listener;
pub mod manager;
pub mod protocol;

#[cfg(test)]
mod testing;

pub use cache::{CacheKey, RequestKind, ResponseCache, DEFAULT_CACHE_CAPACITY};
pub use client::{ClientConfig, DocumentChange, LspClient};
pub use codec::LspCodec;
pub use listener::{EventListener, LanguageEvent, LanguageEventKind, ListenerHandle};
pub use manager::{LspManager, ProcessLauncher, ServerLauncher};
pub use protocol::{ServerNotification, ServerRequest};
