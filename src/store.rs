use crate::{
    Error, Result, WithContext,
    keys::{KeyGenerator, SequentialKeys},
    pg::PgTransport,
    query::IndexDef,
    session::Session,
    transport::Transport,
};
use std::{collections::HashMap, sync::Arc, time::Duration};

/// Long-lived handle shared by every session: the transport, the key policy,
/// and the index registry.
///
/// Cheap to clone and safe to share across tasks; sessions minted from it
/// are independent and never see each other's uncommitted state. Construct
/// one explicitly at process start and pass it to whatever opens sessions —
/// there is no hidden global.
#[derive(Clone)]
pub struct Store {
    transport: Arc<dyn Transport>,
    keys: Arc<dyn KeyGenerator>,
    indexes: Arc<HashMap<String, IndexDef>>,
}

impl Store {
    /// Connect to Postgres with defaults. Shorthand for
    /// `Store::configure(url).connect()`.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::configure(url).connect().await
    }

    /// First phase of the explicit two-phase construction: collect
    /// configuration, then [`connect`](StoreBuilder::connect).
    pub fn configure(url: impl Into<String>) -> StoreBuilder {
        StoreBuilder::new().url(url)
    }

    /// A builder with no backend chosen yet; supply a
    /// [`transport`](StoreBuilder::transport) or a
    /// [`url`](StoreBuilder::url) before connecting.
    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    /// Mint a fresh unit-of-work session.
    pub fn session(&self) -> Session {
        Session::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.keys),
            Arc::clone(&self.indexes),
        )
    }

    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.get(name)
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

/// Deferred store configuration: the `configure` half of configure→connect.
pub struct StoreBuilder {
    url: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    max_connections: Option<u32>,
    connect_timeout: Option<Duration>,
    keys: Arc<dyn KeyGenerator>,
    indexes: Vec<IndexDef>,
}

impl StoreBuilder {
    fn new() -> Self {
        Self {
            url: None,
            transport: None,
            max_connections: None,
            connect_timeout: None,
            keys: Arc::new(SequentialKeys::new()),
            indexes: Vec::new(),
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Use a caller-supplied transport instead of the Postgres one; the url
    /// is ignored when set.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max.max(1));
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Key policy applied when documents are stored without an identity.
    /// Defaults to [`SequentialKeys`].
    pub fn key_generator<G>(mut self, keys: G) -> Self
    where
        G: KeyGenerator + 'static,
    {
        self.keys = Arc::new(keys);
        self
    }

    /// Register a named index. Registration is deployment: the transport
    /// materializes every registered definition at connect time, and only
    /// registered names are queryable.
    pub fn register_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Second phase: open the backend, materialize registered indexes, and
    /// yield the shareable [`Store`].
    pub async fn connect(self) -> Result<Store> {
        let transport: Arc<dyn Transport> = match (self.transport, self.url) {
            (Some(transport), _) => transport,
            (None, Some(url)) => Arc::new(
                PgTransport::connect_with(&url, self.max_connections, self.connect_timeout)
                    .await
                    .context("connecting document store")?,
            ),
            (None, None) => {
                return Err(Error::Transport(
                    "store configuration names neither a url nor a transport".into(),
                ));
            }
        };

        transport.ensure_indexes(&self.indexes).await?;

        let indexes = self
            .indexes
            .into_iter()
            .map(|index| (index.name().to_string(), index))
            .collect();

        Ok(Store {
            transport,
            keys: self.keys,
            indexes: Arc::new(indexes),
        })
    }
}
