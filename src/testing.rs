use crate::{
    Error, Result,
    include::{self, IncludePath},
    metrics,
    query::{IndexDef, Predicate},
    transport::{Document, DocumentMetadata, FetchResponse, QueryResponse, Transport, WriteOp},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Clone, Debug)]
struct StoredDoc {
    collection: String,
    body: Value,
    version: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// In-process transport with call accounting.
///
/// Backs the deterministic test suite: every session-level round-trip
/// contract ("exactly one fetch", "one batched write") is assertable through
/// the counters. Batches apply atomically — every expectation is validated
/// before any state changes.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<HashMap<String, StoredDoc>>,
    fetch_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    query_calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a document out-of-band, bypassing any session. Bumps the
    /// version when the key exists, which doubles as a way to provoke
    /// version conflicts in tests.
    pub fn seed(&self, key: &str, collection: &str, body: Value) -> i32 {
        let mut state = self.state.lock().expect("memory state poisoned");
        let now = Utc::now();
        match state.get_mut(key) {
            Some(stored) => {
                stored.body = body;
                stored.version += 1;
                stored.updated_at = now;
                stored.version
            }
            None => {
                state.insert(
                    key.to_string(),
                    StoredDoc {
                        collection: collection.to_string(),
                        body,
                        version: 1,
                        created_at: now,
                        updated_at: now,
                    },
                );
                1
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state
            .lock()
            .expect("memory state poisoned")
            .contains_key(key)
    }

    pub fn version_of(&self, key: &str) -> Option<i32> {
        self.state
            .lock()
            .expect("memory state poisoned")
            .get(key)
            .map(|stored| stored.version)
    }

    /// Number of `fetch_one`/`fetch_many` round trips served.
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::Relaxed)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::Relaxed)
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::Relaxed)
    }

    /// Operation counts of every applied or rejected batch, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes
            .lock()
            .expect("batch size log poisoned")
            .clone()
    }

    fn document(key: &str, stored: &StoredDoc) -> Document {
        Document {
            key: key.to_string(),
            collection: stored.collection.clone(),
            body: stored.body.clone(),
            version: stored.version,
        }
    }

    fn related(
        state: &HashMap<String, StoredDoc>,
        roots: &[&Value],
        includes: &[IncludePath],
        exclude: &HashSet<&str>,
    ) -> Vec<Document> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for body in roots {
            for key in include::related_keys(body, includes) {
                if exclude.contains(key.as_str()) || !seen.insert(key.clone()) {
                    continue;
                }
                if let Some(stored) = state.get(&key) {
                    out.push(Self::document(&key, stored));
                }
            }
        }
        out
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn fetch_one(&self, key: &str, includes: &[IncludePath]) -> Result<FetchResponse> {
        self.fetch_many(&[key.to_string()], includes).await
    }

    async fn fetch_many(
        &self,
        keys: &[String],
        includes: &[IncludePath],
    ) -> Result<FetchResponse> {
        self.fetch_calls.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock().expect("memory state poisoned");

        let mut documents: HashMap<String, Option<Document>> = HashMap::new();
        for key in keys {
            documents.insert(
                key.clone(),
                state.get(key).map(|stored| Self::document(key, stored)),
            );
        }

        let exclude: HashSet<&str> = documents.keys().map(String::as_str).collect();
        let roots: Vec<&Value> = documents
            .values()
            .flatten()
            .map(|doc| &doc.body)
            .collect();
        let included = Self::related(&state, &roots, includes, &exclude);

        Ok(FetchResponse {
            documents,
            included,
        })
    }

    async fn fetch_metadata(&self, key: &str) -> Result<Option<DocumentMetadata>> {
        let state = self.state.lock().expect("memory state poisoned");
        Ok(state.get(key).map(|stored| DocumentMetadata {
            version: stored.version,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
        }))
    }

    async fn apply_batch(&self, ops: &[WriteOp]) -> Result<Vec<(String, i32)>> {
        self.batch_calls.fetch_add(1, Ordering::Relaxed);
        self.batch_sizes
            .lock()
            .expect("batch size log poisoned")
            .push(ops.len());

        let mut state = self.state.lock().expect("memory state poisoned");

        // Validate every expectation before touching state: all-or-nothing.
        for op in ops {
            let (key, expected) = match op {
                WriteOp::Put { key, expected, .. } => (key, expected),
                WriteOp::Delete { key, expected } => (key, expected),
            };
            if let Some(expected) = expected {
                if state.get(key).map(|stored| stored.version) != Some(*expected) {
                    metrics::record_doc_conflicts(1);
                    return Err(Error::VersionConflict(key.clone()));
                }
            }
        }

        let now = Utc::now();
        let mut versions = Vec::new();
        for op in ops {
            match op {
                WriteOp::Put {
                    key,
                    collection,
                    body,
                    ..
                } => {
                    let version = match state.get_mut(key) {
                        Some(stored) => {
                            stored.body = body.clone();
                            stored.collection = collection.clone();
                            stored.version += 1;
                            stored.updated_at = now;
                            stored.version
                        }
                        None => {
                            state.insert(
                                key.clone(),
                                StoredDoc {
                                    collection: collection.clone(),
                                    body: body.clone(),
                                    version: 1,
                                    created_at: now,
                                    updated_at: now,
                                },
                            );
                            1
                        }
                    };
                    versions.push((key.clone(), version));
                }
                WriteOp::Delete { key, .. } => {
                    state.remove(key);
                }
            }
        }

        Ok(versions)
    }

    async fn query(
        &self,
        index: &IndexDef,
        predicate: &Predicate,
        includes: &[IncludePath],
    ) -> Result<QueryResponse> {
        self.query_calls.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock().expect("memory state poisoned");

        let mut documents: Vec<Document> = state
            .iter()
            .filter(|(_, stored)| {
                index
                    .collections()
                    .iter()
                    .any(|collection| collection == &stored.collection)
                    && predicate.matches(&stored.body)
            })
            .map(|(key, stored)| Self::document(key, stored))
            .collect();
        documents.sort_by(|a, b| a.key.cmp(&b.key));

        let exclude: HashSet<&str> = documents.iter().map(|doc| doc.key.as_str()).collect();
        let roots: Vec<&Value> = documents.iter().map(|doc| &doc.body).collect();
        let included = Self::related(&state, &roots, includes, &exclude);

        Ok(QueryResponse {
            documents,
            included,
        })
    }
}
