use anyhow::Result;
use docket::{Entity, IncludePath, IndexDef, Predicate, Store, testing::MemoryTransport};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Serialize, Deserialize, Clone, Debug)]
struct Order {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    company: String,
    employee: String,
    lines: Vec<OrderLine>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct OrderLine {
    product: String,
    quantity: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct Company {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct Employee {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    first_name: String,
    last_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct Product {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
}

macro_rules! entity {
    ($ty:ident, $collection:literal) => {
        impl Entity for $ty {
            const COLLECTION: &'static str = $collection;

            fn key(&self) -> Option<&str> {
                self.id.as_deref()
            }

            fn assign_key(&mut self, key: String) {
                self.id = Some(key);
            }
        }
    };
}

entity!(Order, "orders");
entity!(Company, "companies");
entity!(Employee, "employees");
entity!(Product, "products");

fn seed_graph(transport: &MemoryTransport) {
    transport.seed(
        "orders/1",
        "orders",
        json!({
            "id": "orders/1",
            "company": "companies/64",
            "employee": "employees/2",
            "lines": [
                { "product": "products/4", "quantity": 2 },
                { "product": "products/5", "quantity": 7 },
            ],
        }),
    );
    transport.seed(
        "companies/64",
        "companies",
        json!({"id": "companies/64", "name": "Save-a-lot Markets"}),
    );
    transport.seed(
        "employees/2",
        "employees",
        json!({"id": "employees/2", "first_name": "Andrew", "last_name": "Fuller"}),
    );
    transport.seed(
        "products/4",
        "products",
        json!({"id": "products/4", "name": "Chef Anton's Cajun Seasoning"}),
    );
    transport.seed(
        "products/5",
        "products",
        json!({"id": "products/5", "name": "Gumbo Mix"}),
    );
}

fn order_includes() -> Vec<IncludePath> {
    vec![
        IncludePath::field("company"),
        IncludePath::field("employee"),
        IncludePath::items("lines", "product"),
    ]
}

#[tokio::test]
async fn includes_prefetch_relations_in_the_primary_round_trip() -> Result<()> {
    let transport = Arc::new(MemoryTransport::new());
    seed_graph(&transport);
    let store = Store::builder().transport(transport.clone()).connect().await?;
    let mut session = store.session();

    let order = session
        .load_with::<Order>("orders/1", &order_includes())
        .await?
        .expect("seeded");
    assert_eq!(transport.fetch_calls(), 1);

    // Every relation — two singular fields plus the keys discovered inside
    // the lines sequence — is already in the identity map.
    let company = session.load::<Company>(&order.company).await?.expect("included");
    let employee = session
        .load::<Employee>(&order.employee)
        .await?
        .expect("included");
    for line in &order.lines {
        session.load::<Product>(&line.product).await?.expect("included");
    }
    let line_keys: Vec<&str> = order.lines.iter().map(|l| l.product.as_str()).collect();
    let products = session.load_many::<Product>(&line_keys).await?;

    assert_eq!(transport.fetch_calls(), 1);
    assert_eq!(company.name, "Save-a-lot Markets");
    assert_eq!(employee.first_name, "Andrew");
    assert_eq!(products.len(), 2);
    Ok(())
}

#[tokio::test]
async fn query_includes_land_in_the_identity_map() -> Result<()> {
    let transport = Arc::new(MemoryTransport::new());
    seed_graph(&transport);
    let store = Store::builder()
        .transport(transport.clone())
        .register_index(
            IndexDef::new("orders_by_company")
                .collection("orders")
                .field("company"),
        )
        .connect()
        .await?;
    let mut session = store.session();

    let orders: Vec<Order> = session
        .query(
            "orders_by_company",
            Predicate::eq("company", "companies/64"),
            &[IncludePath::field("company")],
        )
        .await?;
    assert_eq!(orders.len(), 1);
    assert_eq!(transport.query_calls(), 1);

    session
        .load::<Company>("companies/64")
        .await?
        .expect("included");
    assert_eq!(transport.fetch_calls(), 0);

    // Query roots are tracked too: reloading one is a cache hit.
    session.load::<Order>("orders/1").await?.expect("tracked");
    assert_eq!(transport.fetch_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn load_many_resolves_includes_for_the_whole_batch() -> Result<()> {
    let transport = Arc::new(MemoryTransport::new());
    seed_graph(&transport);
    transport.seed(
        "orders/2",
        "orders",
        json!({
            "id": "orders/2",
            "company": "companies/64",
            "employee": "employees/2",
            "lines": [{ "product": "products/5", "quantity": 1 }],
        }),
    );
    let store = Store::builder().transport(transport.clone()).connect().await?;
    let mut session = store.session();

    let orders = session
        .load_many_with::<Order>(&["orders/1", "orders/2"], &order_includes())
        .await?;
    assert_eq!(orders.len(), 2);
    assert_eq!(transport.fetch_calls(), 1);

    session.load::<Company>("companies/64").await?.expect("included");
    session.load::<Product>("products/5").await?.expect("included");
    assert_eq!(transport.fetch_calls(), 1);
    Ok(())
}
