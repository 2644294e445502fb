use crate::{
    Error, Result,
    include::{self, IncludePath},
    metrics,
    query::{IndexDef, Predicate},
    transport::{Document, DocumentMetadata, FetchResponse, QueryResponse, Transport, WriteOp},
};
use async_trait::async_trait;
use indoc::indoc;
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder, postgres::PgPoolOptions};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

type DocRow = (String, String, Value, i32);

/// Reference transport: one `docs` table keyed by text document key, with a
/// collection tag, a jsonb body, and an integer version for optimistic
/// concurrency.
pub struct PgTransport {
    pool: PgPool,
}

impl PgTransport {
    pub async fn connect(url: &str) -> Result<Self> {
        Ok(Self {
            pool: PgPool::connect(url).await?,
        })
    }

    pub(crate) async fn connect_with(
        url: &str,
        max_connections: Option<u32>,
        connect_timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut opts = PgPoolOptions::new();
        if let Some(max) = max_connections {
            opts = opts.max_connections(max);
        }
        if let Some(timeout) = connect_timeout {
            opts = opts.acquire_timeout(timeout);
        }
        Ok(Self {
            pool: opts.connect(url).await?,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the core schema. Idempotent; runs automatically at store
    /// connect time.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(indoc! {r#"
            create table if not exists docs (
                key        text primary key,
                collection text not null,
                doc        jsonb not null,
                version    int not null default 1,
                created_at timestamptz not null default now(),
                updated_at timestamptz not null default now()
            )
        "#})
        .execute(&self.pool)
        .await?;
        sqlx::query("create index if not exists docs_collection_idx on docs (collection)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn select_docs(&self, keys: &[String]) -> Result<Vec<Document>> {
        let rows: Vec<DocRow> =
            sqlx::query_as("select key, collection, doc, version from docs where key = any($1)")
                .bind(keys)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(key, collection, body, version)| Document {
                key,
                collection,
                body,
                version,
            })
            .collect())
    }

    /// Resolve include paths against already-fetched root bodies and load
    /// the related documents, skipping keys the caller already holds.
    async fn load_related<'a, I>(
        &self,
        roots: I,
        includes: &[IncludePath],
        exclude: &HashSet<&str>,
    ) -> Result<Vec<Document>>
    where
        I: IntoIterator<Item = &'a Value>,
    {
        if includes.is_empty() {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::new();
        let mut related: Vec<String> = Vec::new();
        for body in roots {
            for key in include::related_keys(body, includes) {
                if !exclude.contains(key.as_str()) && seen.insert(key.clone()) {
                    related.push(key);
                }
            }
        }

        if related.is_empty() {
            return Ok(Vec::new());
        }
        self.select_docs(&related).await
    }
}

#[async_trait]
impl Transport for PgTransport {
    async fn fetch_one(&self, key: &str, includes: &[IncludePath]) -> Result<FetchResponse> {
        self.fetch_many(&[key.to_string()], includes).await
    }

    async fn fetch_many(
        &self,
        keys: &[String],
        includes: &[IncludePath],
    ) -> Result<FetchResponse> {
        let mut documents: HashMap<String, Option<Document>> =
            keys.iter().map(|key| (key.clone(), None)).collect();
        for doc in self.select_docs(keys).await? {
            documents.insert(doc.key.clone(), Some(doc));
        }

        let exclude: HashSet<&str> = documents.keys().map(String::as_str).collect();
        let roots = documents.values().flatten().map(|doc| &doc.body);
        let included = self.load_related(roots, includes, &exclude).await?;

        Ok(FetchResponse {
            documents,
            included,
        })
    }

    async fn fetch_metadata(&self, key: &str) -> Result<Option<DocumentMetadata>> {
        let row: Option<(
            i32,
            chrono::DateTime<chrono::Utc>,
            chrono::DateTime<chrono::Utc>,
        )> = sqlx::query_as("select version, created_at, updated_at from docs where key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(version, created_at, updated_at)| DocumentMetadata {
            version,
            created_at,
            updated_at,
        }))
    }

    async fn apply_batch(&self, ops: &[WriteOp]) -> Result<Vec<(String, i32)>> {
        tracing::debug!(ops = ops.len(), "applying write batch");
        let mut tx = self.pool.begin().await?;
        let mut versions = Vec::new();

        // Any early return drops the transaction, rolling the whole batch
        // back: apply_batch is all-or-nothing.
        for op in ops {
            match op {
                WriteOp::Put {
                    key,
                    body,
                    expected: Some(expected),
                    ..
                } => {
                    let rec: Option<(i32,)> = sqlx::query_as(indoc! {r#"
                        update docs
                           set doc = $2,
                               version = version + 1,
                               updated_at = now()
                         where key = $1 and version = $3
                        returning version
                    "#})
                    .bind(key)
                    .bind(body)
                    .bind(expected)
                    .fetch_optional(&mut *tx)
                    .await?;

                    match rec {
                        Some((version,)) => versions.push((key.clone(), version)),
                        None => {
                            metrics::record_doc_conflicts(1);
                            return Err(Error::VersionConflict(key.clone()));
                        }
                    }
                }
                WriteOp::Put {
                    key,
                    collection,
                    body,
                    expected: None,
                } => {
                    let version: i32 = sqlx::query_scalar(indoc! {r#"
                        with up as (
                            insert into docs (key, collection, doc, version)
                            values ($1, $2, $3, 1)
                            on conflict (key) do update
                              set doc = excluded.doc,
                                  collection = excluded.collection,
                                  version = docs.version + 1,
                                  updated_at = now()
                            returning version
                        ) select version from up
                    "#})
                    .bind(key)
                    .bind(collection)
                    .bind(body)
                    .fetch_one(&mut *tx)
                    .await?;
                    versions.push((key.clone(), version));
                }
                WriteOp::Delete {
                    key,
                    expected: Some(expected),
                } => {
                    let result = sqlx::query("delete from docs where key = $1 and version = $2")
                        .bind(key)
                        .bind(expected)
                        .execute(&mut *tx)
                        .await?;
                    if result.rows_affected() == 0 {
                        metrics::record_doc_conflicts(1);
                        return Err(Error::VersionConflict(key.clone()));
                    }
                }
                WriteOp::Delete {
                    key,
                    expected: None,
                } => {
                    sqlx::query("delete from docs where key = $1")
                        .bind(key)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(versions)
    }

    async fn query(
        &self,
        index: &IndexDef,
        predicate: &Predicate,
        includes: &[IncludePath],
    ) -> Result<QueryResponse> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "select key, collection, doc, version from docs where collection = any(",
        );
        builder.push_bind(index.collections().to_vec());
        builder.push(") and ");
        predicate.push_sql(&mut builder);
        builder.push(" order by key");

        let rows: Vec<DocRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        let documents: Vec<Document> = rows
            .into_iter()
            .map(|(key, collection, body, version)| Document {
                key,
                collection,
                body,
                version,
            })
            .collect();

        let exclude: HashSet<&str> = documents.iter().map(|doc| doc.key.as_str()).collect();
        let roots = documents.iter().map(|doc| &doc.body);
        let included = self.load_related(roots, includes, &exclude).await?;

        Ok(QueryResponse {
            documents,
            included,
        })
    }

    async fn ensure_indexes(&self, indexes: &[IndexDef]) -> Result<()> {
        self.migrate().await?;
        for index in indexes {
            for field in index.fields() {
                let name = ident(&format!("docs_{}_{}_idx", index.name(), field));
                let stmt = format!(
                    "create index if not exists {} on docs ((doc ->> '{}'))",
                    name,
                    field.replace('\'', "''")
                );
                sqlx::query(&stmt).execute(&self.pool).await?;
            }
        }
        Ok(())
    }
}

// Index names reach the DDL string unquoted; clamp to a safe lowercase
// identifier alphabet.
fn ident(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}
