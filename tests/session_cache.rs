use anyhow::Result;
use docket::{Entity, Store, testing::MemoryTransport};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
struct Product {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    price: f64,
}

impl Entity for Product {
    const COLLECTION: &'static str = "products";

    fn key(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn assign_key(&mut self, key: String) {
        self.id = Some(key);
    }
}

async fn store_with(transport: &Arc<MemoryTransport>) -> Result<Store> {
    Ok(Store::builder().transport(transport.clone()).connect().await?)
}

#[tokio::test]
async fn repeated_loads_share_one_instance_and_one_fetch() -> Result<()> {
    let transport = Arc::new(MemoryTransport::new());
    transport.seed(
        "products/1",
        "products",
        json!({"id": "products/1", "name": "Chai", "price": 18.0}),
    );
    let store = store_with(&transport).await?;
    let mut session = store.session();

    let p1 = session.load::<Product>("products/1").await?.expect("seeded");
    let p2 = session.load::<Product>("products/1").await?.expect("seeded");
    assert_eq!(p1, p2);

    let raw1 = session.load_raw("products/1").await?.expect("seeded");
    let raw2 = session.load_raw("products/1").await?.expect("seeded");
    assert!(Arc::ptr_eq(&raw1, &raw2));

    assert_eq!(transport.fetch_calls(), 1);

    let rendered = docket::metrics::render_prometheus();
    assert!(rendered.contains("doc_reads_total"));
    assert!(rendered.contains("session_cache_hits_total"));

    session.close();
    Ok(())
}

#[tokio::test]
async fn absent_keys_are_values_and_misses_are_remembered() -> Result<()> {
    let transport = Arc::new(MemoryTransport::new());
    let store = store_with(&transport).await?;
    let mut session = store.session();

    assert!(session.load::<Product>("products/99").await?.is_none());
    assert!(session.load::<Product>("products/99").await?.is_none());
    assert_eq!(transport.fetch_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn staged_documents_are_served_from_the_session() -> Result<()> {
    let transport = Arc::new(MemoryTransport::new());
    let store = store_with(&transport).await?;
    let mut session = store.session();

    let mut product = Product {
        id: None,
        name: "Tofu".into(),
        price: 23.25,
    };
    let key = session.store(&mut product)?;
    assert_eq!(key, "products/1");
    assert_eq!(product.id.as_deref(), Some("products/1"));

    let cached = session.load::<Product>(&key).await?.expect("staged");
    assert_eq!(cached.name, "Tofu");
    assert!(session.is_dirty(&key));
    assert_eq!(transport.fetch_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn deleted_keys_read_as_absent_without_a_fetch() -> Result<()> {
    let transport = Arc::new(MemoryTransport::new());
    transport.seed(
        "products/1",
        "products",
        json!({"id": "products/1", "name": "Chai", "price": 18.0}),
    );
    let store = store_with(&transport).await?;
    let mut session = store.session();

    session.load::<Product>("products/1").await?.expect("seeded");
    session.delete("products/1");

    assert!(session.load::<Product>("products/1").await?.is_none());
    assert_eq!(transport.fetch_calls(), 1);
    assert_eq!(session.pending_writes(), 1);
    Ok(())
}

#[tokio::test]
async fn clear_forgets_cache_and_staged_state() -> Result<()> {
    let transport = Arc::new(MemoryTransport::new());
    transport.seed(
        "products/1",
        "products",
        json!({"id": "products/1", "name": "Chai", "price": 18.0}),
    );
    let store = store_with(&transport).await?;
    let mut session = store.session();

    session.load::<Product>("products/1").await?.expect("seeded");
    let mut product = Product {
        id: None,
        name: "Tofu".into(),
        price: 23.25,
    };
    session.store(&mut product)?;
    session.clear();

    assert_eq!(session.pending_writes(), 0);
    session.load::<Product>("products/1").await?.expect("seeded");
    assert_eq!(transport.fetch_calls(), 2);
    Ok(())
}
