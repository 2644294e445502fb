use crate::{
    Result,
    include::IncludePath,
    query::{IndexDef, Predicate},
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Raw key-identified record exchanged with the backing store. The body is
/// opaque to the session layer except for the relation fields an
/// [`IncludePath`] names.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Document {
    pub key: String,
    pub collection: String,
    pub body: Value,
    pub version: i32,
}

#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct DocumentMetadata {
    pub version: i32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// One staged write shipped at commit time. `expected` carries the session's
/// last-seen version; `None` means upsert semantics.
#[derive(Clone, Debug)]
pub enum WriteOp {
    Put {
        key: String,
        collection: String,
        body: Value,
        expected: Option<i32>,
    },
    Delete {
        key: String,
        expected: Option<i32>,
    },
}

impl WriteOp {
    pub fn key(&self) -> &str {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key, .. } => key,
        }
    }
}

/// Result of a fetch: every requested key mapped to its document or absence,
/// plus any documents prefetched through include paths.
#[derive(Clone, Debug, Default)]
pub struct FetchResponse {
    pub documents: HashMap<String, Option<Document>>,
    pub included: Vec<Document>,
}

#[derive(Clone, Debug, Default)]
pub struct QueryResponse {
    pub documents: Vec<Document>,
    pub included: Vec<Document>,
}

/// Network boundary between sessions and the backing document store.
///
/// Contract points the session relies on:
/// - `fetch_one`/`fetch_many` resolve `includes` against the fetched bodies
///   in the same round trip and return the related documents alongside.
/// - `apply_batch` is all-or-nothing: either every op lands or none do, and
///   a rejected batch surfaces as a single error.
/// - `query` evaluates the predicate against a pre-registered index and
///   returns matches in a stable order.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch_one(&self, key: &str, includes: &[IncludePath]) -> Result<FetchResponse>;

    async fn fetch_many(&self, keys: &[String], includes: &[IncludePath])
    -> Result<FetchResponse>;

    async fn fetch_metadata(&self, key: &str) -> Result<Option<DocumentMetadata>>;

    /// Returns `(key, new_version)` for every applied Put.
    async fn apply_batch(&self, ops: &[WriteOp]) -> Result<Vec<(String, i32)>>;

    async fn query(
        &self,
        index: &IndexDef,
        predicate: &Predicate,
        includes: &[IncludePath],
    ) -> Result<QueryResponse>;

    /// Materialize registered index definitions. Called once at store
    /// connect time; backends without server-side indexes may no-op.
    async fn ensure_indexes(&self, _indexes: &[IndexDef]) -> Result<()> {
        Ok(())
    }
}
