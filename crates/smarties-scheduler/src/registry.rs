use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Callback invoked with a job's deserialized payload.
pub type Callback = Arc<dyn Fn(serde_json::Value) -> anyhow::Result<()> + Send + Sync>;

/// Identifier persisted with a job: lower-case hex SHA-256 of the caller's key.
pub fn identifier_for(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// In-memory map from job identifier to callback.
///
/// Nothing here is persisted: job rows only reference the identifier, and
/// callers re-register their callbacks on every process start.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: DashMap<String, Callback>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `callback` under `key`. The last registration for a key wins.
    pub fn register<F>(&self, key: &str, callback: F)
    where
        F: Fn(serde_json::Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let identifier = identifier_for(key);
        debug!(%key, %identifier, "callback registered");
        self.callbacks.insert(identifier, Arc::new(callback));
    }

    /// Remove the callback for `key`. Returns whether one was registered.
    pub fn unregister(&self, key: &str) -> bool {
        self.callbacks.remove(&identifier_for(key)).is_some()
    }

    /// Callback for a persisted identifier. The map guard is released
    /// before returning, so the callback may itself register or schedule.
    pub fn lookup(&self, identifier: &str) -> Option<Callback> {
        self.callbacks.get(identifier).map(|entry| Arc::clone(entry.value()))
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.callbacks.contains_key(&identifier_for(key))
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Drop every callback (teardown).
    pub fn clear(&self) {
        self.callbacks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn identifier_is_hex_sha256() {
        assert_eq!(
            identifier_for("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn last_registration_wins() {
        let registry = CallbackRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        registry.register("x", |_| Ok(()));
        let h = Arc::clone(&hits);
        registry.register("x", move |_| {
            h.fetch_add(10, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(registry.len(), 1);

        let cb = registry.lookup(&identifier_for("x")).unwrap();
        cb(serde_json::json!({})).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn unregister_removes() {
        let registry = CallbackRegistry::new();
        registry.register("x", |_| Ok(()));
        assert!(registry.is_registered("x"));
        assert!(registry.unregister("x"));
        assert!(!registry.unregister("x"));
        assert!(registry.lookup(&identifier_for("x")).is_none());
        assert!(registry.is_empty());
    }
}
