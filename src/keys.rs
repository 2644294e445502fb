use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Key-generation policy, consulted only when a document is stored without an
/// identity.
pub trait KeyGenerator: Send + Sync {
    fn next_key(&self, collection: &str) -> String;
}

/// Sequential keys in walkthrough shape: `products/1`, `products/2`, ...
///
/// Counters are per-collection and process-local; use [`UuidKeys`] when more
/// than one writer assigns keys.
#[derive(Debug, Default)]
pub struct SequentialKeys {
    counters: Mutex<HashMap<String, u64>>,
}

impl SequentialKeys {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyGenerator for SequentialKeys {
    fn next_key(&self, collection: &str) -> String {
        let mut counters = self.counters.lock().expect("key counters poisoned");
        let next = counters.entry(collection.to_string()).or_insert(0);
        *next += 1;
        format!("{collection}/{next}")
    }
}

/// Collision-free keys for concurrent writers: `products/<uuid>`.
#[derive(Clone, Copy, Debug, Default)]
pub struct UuidKeys;

impl KeyGenerator for UuidKeys {
    fn next_key(&self, collection: &str) -> String {
        format!("{collection}/{}", Uuid::new_v4())
    }
}
