use serde::{Serialize, de::DeserializeOwned};

/// A typed document: knows the logical collection it lives in and carries its
/// own key.
///
/// Keys are plain strings in `"{collection}/{id}"` shape (`"products/1"`). An
/// entity stored without a key gets one from the store's
/// [`KeyGenerator`](crate::keys::KeyGenerator) and has it written back via
/// [`assign_key`](Entity::assign_key).
///
/// Base and derived shapes sharing one collection are modeled as a serde
/// internally-tagged enum implementing `Entity` once — the variant tag rides
/// inside the payload and survives the round trip, so reads dispatch on it
/// without any runtime type inspection.
pub trait Entity: Serialize + DeserializeOwned {
    /// Collection tag, e.g. `"products"`. Selects the key prefix and which
    /// indexes cover this type.
    const COLLECTION: &'static str;

    fn key(&self) -> Option<&str>;

    fn assign_key(&mut self, key: String);
}
