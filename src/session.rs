use crate::{
    Error, Result,
    entity::Entity,
    include::IncludePath,
    keys::KeyGenerator,
    metrics,
    query::{IndexDef, Predicate},
    transport::{Document, DocumentMetadata, FetchResponse, Transport, WriteOp},
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Clone, Debug)]
struct IdentityEntry {
    body: Option<Arc<Value>>,
    collection: Option<String>,
    version: Option<i32>,
    dirty: bool,
}

impl IdentityEntry {
    fn new() -> Self {
        Self {
            body: None,
            collection: None,
            version: None,
            dirty: false,
        }
    }
}

#[derive(Clone, Debug)]
struct StagedOperation {
    key: String,
    action: SessionAction,
}

#[derive(Clone, Debug)]
enum SessionAction {
    Put {
        collection: String,
        body: Arc<Value>,
        expected: Option<i32>,
    },
    Delete {
        expected: Option<i32>,
    },
}

/// State-tracking unit of work over one transport.
///
/// A session is single-threaded by design: it holds an identity map (one
/// cached instance per key — repeated loads never refetch) and a buffer of
/// staged writes that ship as one atomic batch on [`commit`](Session::commit).
/// Sessions never share cached state with each other; mint one per unit of
/// work via [`Store::session`](crate::Store::session) and let it drop when
/// done.
pub struct Session {
    transport: Arc<dyn Transport>,
    keys: Arc<dyn KeyGenerator>,
    indexes: Arc<HashMap<String, IndexDef>>,
    identity: HashMap<String, IdentityEntry>,
    staged: Vec<StagedOperation>,
}

impl Session {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        keys: Arc<dyn KeyGenerator>,
        indexes: Arc<HashMap<String, IndexDef>>,
    ) -> Self {
        Self {
            transport,
            keys,
            indexes,
            identity: HashMap::new(),
            staged: Vec::new(),
        }
    }

    fn remove_staged(&mut self, key: &str) {
        self.staged.retain(|op| op.key != key);
    }

    fn current_expected(&self, key: &str) -> Option<i32> {
        self.identity.get(key).and_then(|entry| entry.version)
    }

    fn absorb(&mut self, doc: Document) {
        let Document {
            key,
            collection,
            body,
            version,
        } = doc;
        let entry = self.identity.entry(key).or_insert_with(IdentityEntry::new);
        if entry.dirty {
            // In-session mutations win until commit or clear.
            return;
        }
        entry.body = Some(Arc::new(body));
        entry.collection = Some(collection);
        entry.version = Some(version);
        entry.dirty = false;
    }

    // A fresh entry is already the tombstone shape (no body, clean), so a
    // remembered miss never clobbers an existing entry.
    fn absorb_miss(&mut self, key: &str) {
        self.identity
            .entry(key.to_string())
            .or_insert_with(IdentityEntry::new);
    }

    fn merge_fetch(&mut self, response: FetchResponse) {
        metrics::record_included_docs(response.included.len() as u64);
        for doc in response.included {
            self.absorb(doc);
        }
        for (key, doc) in response.documents {
            match doc {
                Some(doc) => self.absorb(doc),
                None => self.absorb_miss(&key),
            }
        }
    }

    fn cached_typed<T: Entity>(&self, key: &str) -> Result<Option<T>> {
        match self.identity.get(key).and_then(|entry| entry.body.clone()) {
            Some(body) => Ok(Some(serde_json::from_value((*body).clone())?)),
            None => Ok(None),
        }
    }

    /// Load one document by key, deserialized into its entity type.
    ///
    /// Hits the identity map first; a session issues at most one fetch per
    /// key, and remote misses are remembered so absent keys cost one fetch
    /// too. Returns `Ok(None)` for a missing (or in-session deleted)
    /// document — absence is a value here, not an error.
    pub async fn load<T: Entity>(&mut self, key: &str) -> Result<Option<T>> {
        self.load_with(key, &[]).await
    }

    /// [`load`](Session::load) plus relation prefetch: the primary fetch and
    /// every declared include resolve in a single transport round trip, and
    /// the related documents land in the identity map so later explicit
    /// loads are cache hits.
    pub async fn load_with<T: Entity>(
        &mut self,
        key: &str,
        includes: &[IncludePath],
    ) -> Result<Option<T>> {
        self.load_raw_with(key, includes).await?;
        self.cached_typed(key)
    }

    /// Load the raw cached instance for a key.
    ///
    /// The returned handle is shared, not copied: two raw loads of the same
    /// key inside one session yield `Arc::ptr_eq` handles to the single
    /// cached instance.
    pub async fn load_raw(&mut self, key: &str) -> Result<Option<Arc<Value>>> {
        self.load_raw_with(key, &[]).await
    }

    pub async fn load_raw_with(
        &mut self,
        key: &str,
        includes: &[IncludePath],
    ) -> Result<Option<Arc<Value>>> {
        if let Some(entry) = self.identity.get(key) {
            metrics::record_cache_hits(1);
            tracing::debug!(key, "identity map hit");
            return Ok(entry.body.clone());
        }

        tracing::debug!(key, "identity map miss");
        let response = self.transport.fetch_one(key, includes).await?;
        metrics::record_doc_reads(1);
        self.merge_fetch(response);
        self.absorb_miss(key);
        Ok(self.identity.get(key).and_then(|entry| entry.body.clone()))
    }

    /// Load a batch of keys in one transport call.
    ///
    /// Already-cached keys (including staged and tombstoned ones) are served
    /// from the identity map; the rest are fetched with a single
    /// `fetch_many`, never one call per key. The result maps every requested
    /// key to its document or `None`.
    pub async fn load_many<T: Entity>(&mut self, keys: &[&str]) -> Result<HashMap<String, Option<T>>> {
        self.load_many_with(keys, &[]).await
    }

    pub async fn load_many_with<T: Entity>(
        &mut self,
        keys: &[&str],
        includes: &[IncludePath],
    ) -> Result<HashMap<String, Option<T>>> {
        let mut seen = HashSet::new();
        let mut need: Vec<String> = Vec::new();
        for key in keys {
            if !self.identity.contains_key(*key) && seen.insert(*key) {
                need.push((*key).to_string());
            }
        }
        metrics::record_cache_hits((keys.len() - need.len()) as u64);

        if !need.is_empty() {
            let response = self.transport.fetch_many(&need, includes).await?;
            metrics::record_doc_reads(need.len() as u64);
            self.merge_fetch(response);
            for key in &need {
                self.absorb_miss(key);
            }
        }

        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            out.insert((*key).to_string(), self.cached_typed(*key)?);
        }
        Ok(out)
    }

    /// Run a predicate against a named, pre-registered index.
    ///
    /// The index name and predicate fields are validated against the store's
    /// registry before any transport call. Results and includes are tracked
    /// in the identity map like any other load.
    pub async fn query<T: Entity>(
        &mut self,
        index: &str,
        predicate: Predicate,
        includes: &[IncludePath],
    ) -> Result<Vec<T>> {
        let def = self
            .indexes
            .get(index)
            .cloned()
            .ok_or_else(|| Error::UnknownIndex(index.to_string()))?;
        for field in predicate.fields() {
            if !def.covers(field) {
                return Err(Error::FieldNotIndexed {
                    index: index.to_string(),
                    field: field.to_string(),
                });
            }
        }

        let response = self.transport.query(&def, &predicate, includes).await?;
        metrics::record_doc_reads(response.documents.len() as u64);
        metrics::record_included_docs(response.included.len() as u64);
        for doc in response.included {
            self.absorb(doc);
        }

        let mut out = Vec::with_capacity(response.documents.len());
        for doc in response.documents {
            out.push(serde_json::from_value(doc.body.clone())?);
            self.absorb(doc);
        }
        Ok(out)
    }

    /// Stage a document for insertion or update. Contacts nothing: the write
    /// ships with the next [`commit`](Session::commit).
    ///
    /// An entity without a key gets one from the store's key policy, written
    /// back onto the entity. Restaging a key replaces its earlier staged op —
    /// last write wins within a session.
    pub fn store<T: Entity>(&mut self, doc: &mut T) -> Result<String> {
        let key = match doc.key() {
            Some(key) => key.to_string(),
            None => {
                let key = self.keys.next_key(T::COLLECTION);
                doc.assign_key(key.clone());
                key
            }
        };

        let body = Arc::new(serde_json::to_value(&*doc)?);
        let expected = self.current_expected(&key);
        self.remove_staged(&key);
        self.staged.push(StagedOperation {
            key: key.clone(),
            action: SessionAction::Put {
                collection: T::COLLECTION.to_string(),
                body: Arc::clone(&body),
                expected,
            },
        });

        let entry = self
            .identity
            .entry(key.clone())
            .or_insert_with(IdentityEntry::new);
        entry.body = Some(body);
        entry.collection = Some(T::COLLECTION.to_string());
        entry.version = expected;
        entry.dirty = true;
        tracing::debug!(key = %key, "staged put");
        Ok(key)
    }

    /// Stage a delete and tombstone the cached instance. Last-write-wins
    /// applies here too: a delete staged after a put replaces it.
    pub fn delete(&mut self, key: &str) {
        let expected = self.current_expected(key);
        self.remove_staged(key);
        self.staged.push(StagedOperation {
            key: key.to_string(),
            action: SessionAction::Delete { expected },
        });

        let entry = self
            .identity
            .entry(key.to_string())
            .or_insert_with(IdentityEntry::new);
        entry.body = None;
        entry.version = expected;
        entry.dirty = true;
        tracing::debug!(key, "staged delete");
    }

    /// Ship the whole staged buffer as one atomic batch.
    ///
    /// On success the buffer is cleared, put entries turn clean with their
    /// server-assigned versions, and deleted entries are evicted. On any
    /// failure — version conflict included — the buffer and every dirty flag
    /// are left exactly as they were, so the caller can inspect or retry.
    pub async fn commit(&mut self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }

        let ops: Vec<WriteOp> = self
            .staged
            .iter()
            .map(|op| match &op.action {
                SessionAction::Put {
                    collection,
                    body,
                    expected,
                } => WriteOp::Put {
                    key: op.key.clone(),
                    collection: collection.clone(),
                    body: (**body).clone(),
                    expected: *expected,
                },
                SessionAction::Delete { expected } => WriteOp::Delete {
                    key: op.key.clone(),
                    expected: *expected,
                },
            })
            .collect();

        let versions = self.transport.apply_batch(&ops).await?;
        let committed: HashMap<String, i32> = versions.into_iter().collect();

        let mut puts = 0u64;
        for op in std::mem::take(&mut self.staged) {
            match op.action {
                SessionAction::Put {
                    collection, body, ..
                } => {
                    let entry = self
                        .identity
                        .entry(op.key.clone())
                        .or_insert_with(IdentityEntry::new);
                    entry.body = Some(body);
                    entry.collection = Some(collection);
                    entry.version = committed.get(&op.key).copied();
                    entry.dirty = false;
                    puts += 1;
                }
                SessionAction::Delete { .. } => {
                    self.identity.remove(&op.key);
                }
            }
        }

        metrics::record_doc_writes(puts);
        tracing::debug!(ops = committed.len(), "committed staged batch");
        Ok(())
    }

    /// Fetch version and timestamps for a key. Metadata is read through, not
    /// cached.
    pub async fn metadata_for(&self, key: &str) -> Result<Option<DocumentMetadata>> {
        self.transport.fetch_metadata(key).await
    }

    /// Number of staged, uncommitted write operations.
    pub fn pending_writes(&self) -> usize {
        self.staged.len()
    }

    /// Whether a key has in-session changes not yet committed.
    pub fn is_dirty(&self, key: &str) -> bool {
        self.identity
            .get(key)
            .map(|entry| entry.dirty)
            .unwrap_or(false)
    }

    /// Drop cached identity entries and staged operations without touching
    /// the store.
    pub fn clear(&mut self) {
        self.identity.clear();
        self.staged.clear();
    }

    /// End the unit of work. Uncommitted staged writes are discarded (with a
    /// warning); nothing is flushed implicitly.
    pub fn close(self) {}
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.staged.is_empty() {
            tracing::warn!(
                pending = self.staged.len(),
                "session dropped with unflushed staged writes"
            );
        }
    }
}
