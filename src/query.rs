use serde::Serialize;
use serde_json::Value;
use sqlx::{Postgres, QueryBuilder, types::Json};

/// A named, pre-registered server-side view: which collections it maps over
/// and which top-level fields it exposes to predicates.
///
/// Registering an index on the [`StoreBuilder`](crate::store::StoreBuilder)
/// is what deploys it — the transport materializes the definition at connect
/// time. A multi-map index over a polymorphic collection is just an index
/// whose collection list (or single tagged-enum collection) covers every
/// shape.
#[derive(Clone, Debug)]
pub struct IndexDef {
    name: String,
    collections: Vec<String>,
    fields: Vec<String>,
}

impl IndexDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collections: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// Add a collection this index maps over.
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collections.push(collection.into());
        self
    }

    /// Expose a top-level document field to predicates.
    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.fields.push(field.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collections(&self) -> &[String] {
        &self.collections
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn covers(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }
}

/// Declarative filter over indexed fields.
///
/// Deliberately small: equality, ordering over numerics, membership, and
/// boolean composition — the subset an index-backed lookup dispatches to the
/// server. Anything richer belongs to the store, not the session.
#[derive(Clone, Debug)]
pub enum Predicate {
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    Gt { field: String, value: f64 },
    Ge { field: String, value: f64 },
    Lt { field: String, value: f64 },
    Le { field: String, value: f64 },
    In { field: String, values: Vec<Value> },
    Not(Box<Predicate>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    fn to_value<T: Serialize>(value: T) -> Value {
        serde_json::to_value(value).expect("serializable value")
    }

    pub fn eq(field: impl Into<String>, value: impl Serialize) -> Self {
        Self::Eq {
            field: field.into(),
            value: Self::to_value(value),
        }
    }

    pub fn ne(field: impl Into<String>, value: impl Serialize) -> Self {
        Self::Ne {
            field: field.into(),
            value: Self::to_value(value),
        }
    }

    pub fn gt(field: impl Into<String>, value: f64) -> Self {
        Self::Gt {
            field: field.into(),
            value,
        }
    }

    pub fn ge(field: impl Into<String>, value: f64) -> Self {
        Self::Ge {
            field: field.into(),
            value,
        }
    }

    pub fn lt(field: impl Into<String>, value: f64) -> Self {
        Self::Lt {
            field: field.into(),
            value,
        }
    }

    pub fn le(field: impl Into<String>, value: f64) -> Self {
        Self::Le {
            field: field.into(),
            value,
        }
    }

    pub fn r#in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Serialize,
    {
        Self::In {
            field: field.into(),
            values: values.into_iter().map(Self::to_value).collect(),
        }
    }

    pub fn negate(predicate: Predicate) -> Self {
        Self::Not(Box::new(predicate))
    }

    pub fn and(predicates: Vec<Predicate>) -> Self {
        Self::And(predicates)
    }

    pub fn or(predicates: Vec<Predicate>) -> Self {
        Self::Or(predicates)
    }

    /// Every field this predicate touches, for validation against an index.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::Eq { field, .. }
            | Predicate::Ne { field, .. }
            | Predicate::Gt { field, .. }
            | Predicate::Ge { field, .. }
            | Predicate::Lt { field, .. }
            | Predicate::Le { field, .. }
            | Predicate::In { field, .. } => out.push(field),
            Predicate::Not(inner) => inner.collect_fields(out),
            Predicate::And(predicates) | Predicate::Or(predicates) => {
                for predicate in predicates {
                    predicate.collect_fields(out);
                }
            }
        }
    }

    /// Evaluate against a document body. Used by the in-memory transport;
    /// the Postgres transport pushes the same tree down as SQL.
    pub fn matches(&self, body: &Value) -> bool {
        fn number(body: &Value, field: &str) -> Option<f64> {
            body.get(field).and_then(Value::as_f64)
        }

        match self {
            Predicate::Eq { field, value } => body.get(field) == Some(value),
            Predicate::Ne { field, value } => body.get(field) != Some(value),
            Predicate::Gt { field, value } => number(body, field).is_some_and(|n| n > *value),
            Predicate::Ge { field, value } => number(body, field).is_some_and(|n| n >= *value),
            Predicate::Lt { field, value } => number(body, field).is_some_and(|n| n < *value),
            Predicate::Le { field, value } => number(body, field).is_some_and(|n| n <= *value),
            Predicate::In { field, values } => body
                .get(field)
                .is_some_and(|found| values.iter().any(|v| v == found)),
            Predicate::Not(inner) => !inner.matches(body),
            Predicate::And(predicates) => predicates.iter().all(|p| p.matches(body)),
            Predicate::Or(predicates) => predicates.iter().any(|p| p.matches(body)),
        }
    }

    pub(crate) fn push_sql(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Predicate::Eq { field, value } => {
                builder.push("(");
                push_json_expr(builder, field);
                builder.push(" = ");
                builder.push_bind(Json(value.clone()));
                builder.push(")");
            }
            Predicate::Ne { field, value } => {
                builder.push("(");
                push_json_expr(builder, field);
                builder.push(" <> ");
                builder.push_bind(Json(value.clone()));
                builder.push(")");
            }
            Predicate::Gt { field, value } => push_numeric_cmp(builder, field, *value, ">"),
            Predicate::Ge { field, value } => push_numeric_cmp(builder, field, *value, ">="),
            Predicate::Lt { field, value } => push_numeric_cmp(builder, field, *value, "<"),
            Predicate::Le { field, value } => push_numeric_cmp(builder, field, *value, "<="),
            Predicate::In { field, values } => {
                if values.is_empty() {
                    builder.push("false");
                } else {
                    builder.push("(");
                    push_json_expr(builder, field);
                    builder.push(" in (");
                    let mut separated = builder.separated(", ");
                    for value in values {
                        separated.push_bind(Json(value.clone()));
                    }
                    builder.push("))");
                }
            }
            Predicate::Not(inner) => {
                builder.push("not (");
                inner.push_sql(builder);
                builder.push(")");
            }
            Predicate::And(predicates) => {
                if predicates.is_empty() {
                    builder.push("true");
                } else {
                    builder.push("(");
                    let mut iter = predicates.iter();
                    if let Some(first) = iter.next() {
                        first.push_sql(builder);
                    }
                    for predicate in iter {
                        builder.push(" and ");
                        predicate.push_sql(builder);
                    }
                    builder.push(")");
                }
            }
            Predicate::Or(predicates) => {
                if predicates.is_empty() {
                    builder.push("false");
                } else {
                    builder.push("(");
                    let mut iter = predicates.iter();
                    if let Some(first) = iter.next() {
                        first.push_sql(builder);
                    }
                    for predicate in iter {
                        builder.push(" or ");
                        predicate.push_sql(builder);
                    }
                    builder.push(")");
                }
            }
        }
    }
}

fn push_json_expr(builder: &mut QueryBuilder<'_, Postgres>, field: &str) {
    builder.push("doc -> ");
    builder.push_bind(field.to_string());
}

fn push_numeric_cmp(builder: &mut QueryBuilder<'_, Postgres>, field: &str, value: f64, op: &str) {
    builder.push("((doc ->> ");
    builder.push_bind(field.to_string());
    builder.push(")::numeric ");
    builder.push(op);
    builder.push(" ");
    builder.push_bind(value);
    builder.push(")");
}
