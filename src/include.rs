use serde_json::Value;
use std::collections::HashSet;

/// Declarative relation descriptor: names a field on a document whose value
/// is the key of another document to prefetch in the same round trip.
///
/// Two shapes cover the walkthrough's needs: a singular key-valued field
/// (`IncludePath::field("company")`) and a key-valued field inside each
/// element of a sequence field (`IncludePath::items("lines", "product")`).
/// Paths are data, not callbacks — the transport walks them server-side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncludePath {
    field: String,
    item_field: Option<String>,
}

impl IncludePath {
    /// A top-level field holding a single related key.
    pub fn field(name: impl Into<String>) -> Self {
        Self {
            field: name.into(),
            item_field: None,
        }
    }

    /// A sequence field whose elements each hold a related key under
    /// `item_field`.
    pub fn items(sequence: impl Into<String>, item_field: impl Into<String>) -> Self {
        Self {
            field: sequence.into(),
            item_field: Some(item_field.into()),
        }
    }

    pub fn field_name(&self) -> &str {
        &self.field
    }

    pub fn item_field(&self) -> Option<&str> {
        self.item_field.as_deref()
    }
}

/// Collect every related key named by `paths` from a document body, in
/// discovery order, deduplicated.
pub fn related_keys(body: &Value, paths: &[IncludePath]) -> Vec<String> {
    fn push(value: &Value, seen: &mut HashSet<String>, keys: &mut Vec<String>) {
        if let Some(key) = value.as_str() {
            if seen.insert(key.to_string()) {
                keys.push(key.to_string());
            }
        }
    }

    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    for path in paths {
        match (&path.item_field, body.get(&path.field)) {
            (None, Some(value)) => push(value, &mut seen, &mut keys),
            (Some(item_field), Some(Value::Array(items))) => {
                for item in items {
                    if let Some(value) = item.get(item_field) {
                        push(value, &mut seen, &mut keys);
                    }
                }
            }
            _ => {}
        }
    }

    keys
}
