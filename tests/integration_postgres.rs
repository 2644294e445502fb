use anyhow::Result;
use docket::{Entity, IncludePath, IndexDef, Predicate, Store};
use serde::{Deserialize, Serialize};
use testcontainers::{
    GenericImage, ImageExt,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};

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

#[derive(Serialize, Deserialize, Clone, Debug)]
struct Order {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    product: String,
    quantity: u32,
}

impl Entity for Order {
    const COLLECTION: &'static str = "orders";

    fn key(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn assign_key(&mut self, key: String) {
        self.id = Some(key);
    }
}

#[tokio::test]
#[ignore = "needs a local docker daemon for the postgres container"]
async fn postgres_transport_end_to_end() -> Result<()> {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres");
    let container = image.start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgres://postgres:postgres@{host}:{port}/postgres?sslmode=disable");

    let store = Store::configure(&url)
        .max_connections(5)
        .register_index(
            IndexDef::new("products_by_name")
                .collection("products")
                .field("name"),
        )
        .connect()
        .await?;

    // Store + commit, then read back through a fresh session.
    let mut session = store.session();
    let mut product = Product {
        id: None,
        name: "Chai".into(),
        price: 18.0,
    };
    let product_key = session.store(&mut product)?;
    let mut order = Order {
        id: None,
        product: product_key.clone(),
        quantity: 3,
    };
    let order_key = session.store(&mut order)?;
    session.commit().await?;

    let mut reader = store.session();
    let loaded = reader
        .load::<Product>(&product_key)
        .await?
        .expect("committed");
    assert_eq!(loaded.name, "Chai");
    let meta = reader.metadata_for(&product_key).await?.expect("committed");
    assert_eq!(meta.version, 1);

    // Include prefetch across the order -> product relation.
    let mut includer = store.session();
    let fetched_order = includer
        .load_with::<Order>(&order_key, &[IncludePath::field("product")])
        .await?
        .expect("committed");
    includer
        .load::<Product>(&fetched_order.product)
        .await?
        .expect("included");

    // Indexed query.
    let mut querier = store.session();
    let rows: Vec<Product> = querier
        .query("products_by_name", Predicate::eq("name", "Chai"), &[])
        .await?;
    assert_eq!(rows.len(), 1);

    // Version-conflict rejection leaves the loser's buffer intact.
    let mut winner = store.session();
    let mut loser = store.session();
    let mut fresh = winner
        .load::<Product>(&product_key)
        .await?
        .expect("committed");
    let mut stale = loser
        .load::<Product>(&product_key)
        .await?
        .expect("committed");

    fresh.price = 19.0;
    winner.store(&mut fresh)?;
    winner.commit().await?;

    stale.price = 21.0;
    loser.store(&mut stale)?;
    let err = loser.commit().await.expect_err("stale version");
    assert!(err.is_conflict());
    assert_eq!(loser.pending_writes(), 1);

    // Deletes ship in the same batched path.
    let mut cleaner = store.session();
    cleaner.load::<Order>(&order_key).await?.expect("committed");
    cleaner.delete(&order_key);
    cleaner.commit().await?;
    assert!(store.session().load::<Order>(&order_key).await?.is_none());

    Ok(())
}
