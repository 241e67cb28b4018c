//! Per-document memo of read-only server responses
//!
//! Values are stored as JSON next to the `TypeId` they were written with,
//! so a read with any other type misses instead of failing.

use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::TypeId;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::{trace, warn};
use url::Url;

pub const DEFAULT_CACHE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    DocumentSymbols,
    DocumentColor,
    DocumentLinks,
    InlayHints,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub document_uri: Url,
    pub kind: RequestKind,
    /// Distinguishes requests of one kind, e.g. an inlay hint range
    pub discriminator: Option<String>,
}

impl CacheKey {
    pub fn new(document_uri: Url, kind: RequestKind) -> Self {
        Self {
            document_uri,
            kind,
            discriminator: None,
        }
    }

    pub fn with_discriminator(mut self, discriminator: impl Into<String>) -> Self {
        self.discriminator = Some(discriminator.into());
        self
    }
}

struct Slot {
    type_id: TypeId,
    type_name: &'static str,
    value: Value,
}

pub struct ResponseCache {
    entries: Mutex<LruCache<CacheKey, Slot>>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, LruCache<CacheKey, Slot>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set<T: Serialize + 'static>(&self, key: CacheKey, value: &T) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                warn!("Not caching {}: {}", std::any::type_name::<T>(), e);
                return;
            }
        };
        self.entries().put(
            key,
            Slot {
                type_id: TypeId::of::<T>(),
                type_name: std::any::type_name::<T>(),
                value,
            },
        );
    }

    /// The cached value, if one was stored under `key` as a `T`.
    pub fn get<T: DeserializeOwned + 'static>(&self, key: &CacheKey) -> Option<T> {
        let mut entries = self.entries();
        let slot = entries.get(key)?;
        if slot.type_id != TypeId::of::<T>() {
            trace!(
                "Cache entry holds {}, not {}",
                slot.type_name,
                std::any::type_name::<T>()
            );
            return None;
        }
        serde_json::from_value(slot.value.clone()).ok()
    }

    /// Remove one entry. Returns whether it was present.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries().pop(key).is_some()
    }

    /// Drop every entry for a document.
    pub fn invalidate_document(&self, uri: &Url) -> usize {
        let mut entries = self.entries();
        let stale: Vec<CacheKey> = entries
            .iter()
            .filter(|(key, _)| &key.document_uri == uri)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
