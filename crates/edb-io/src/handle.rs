//! Object handles and their encoding inside request payloads.
//!
//! A handle reference travels inside a JSON payload as
//!
//! ```text
//! {"$handle": {"id": 42, "deferred": false}}
//! ```
//!
//! A *deferred* handle stands for an object that a buffered write will create;
//! its `id` is a client-chosen deferred id until the buffer is flushed and the
//! server reports the real id. [`Handle`] is the shared cell the application
//! holds: every clone, and every alias registered with the buffer, observes the
//! resolution.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Key marking a handle reference inside a payload.
pub const HANDLE_KEY: &str = "$handle";

/// Plain handle value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleRef {
    pub id: u64,
    #[serde(default)]
    pub deferred: bool,
}

impl HandleRef {
    pub fn resolved(id: u64) -> Self {
        Self {
            id,
            deferred: false,
        }
    }

    pub fn deferred(deferred_id: u64) -> Self {
        Self {
            id: deferred_id,
            deferred: true,
        }
    }

    /// Payload encoding of this reference.
    pub fn to_value(self) -> Value {
        json!({ HANDLE_KEY: { "id": self.id, "deferred": self.deferred } })
    }

    /// Decode a payload node, if it is a handle reference.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        if map.len() != 1 {
            return None;
        }
        serde_json::from_value(map.get(HANDLE_KEY)?.clone()).ok()
    }
}

/// Shared, mutate-through handle.
#[derive(Debug, Clone)]
pub struct Handle {
    slot: Arc<RwLock<HandleRef>>,
}

impl Handle {
    pub fn new(value: HandleRef) -> Self {
        Self {
            slot: Arc::new(RwLock::new(value)),
        }
    }

    pub fn resolved(id: u64) -> Self {
        Self::new(HandleRef::resolved(id))
    }

    pub fn deferred(deferred_id: u64) -> Self {
        Self::new(HandleRef::deferred(deferred_id))
    }

    /// Wrap the handle reference found in a response payload.
    pub fn from_value(value: &Value) -> Option<Self> {
        HandleRef::from_value(value).map(Self::new)
    }

    /// Current value.
    pub fn get(&self) -> HandleRef {
        *self.slot.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u64 {
        self.get().id
    }

    pub fn is_deferred(&self) -> bool {
        self.get().deferred
    }

    /// Deferred id, while still unresolved.
    pub fn deferred_id(&self) -> Option<u64> {
        let value = self.get();
        value.deferred.then_some(value.id)
    }

    pub fn to_value(&self) -> Value {
        self.get().to_value()
    }

    /// Whether two handles are the same cell (clones of each other).
    pub fn same_cell(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    pub(crate) fn resolve(&self, id: u64) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        *slot = HandleRef::resolved(id);
    }
}

/// Every handle reference in a payload, in document order.
pub fn collect_handles(payload: &Value) -> Vec<HandleRef> {
    let mut found = Vec::new();
    walk(payload, &mut found);
    found
}

fn walk(node: &Value, found: &mut Vec<HandleRef>) {
    if let Some(handle) = HandleRef::from_value(node) {
        found.push(handle);
        return;
    }
    match node {
        Value::Array(items) => items.iter().for_each(|item| walk(item, found)),
        Value::Object(map) => map.values().for_each(|item| walk(item, found)),
        _ => {}
    }
}

/// Whether a payload still references any unresolved handle.
pub fn has_deferred(payload: &Value) -> bool {
    collect_handles(payload).iter().any(|h| h.deferred)
}

/// Replace every deferred reference whose id appears in `resolved` with the
/// resolved handle. Returns the number of references rewritten.
pub fn rewrite_resolved(payload: &mut Value, resolved: &HashMap<u64, u64>) -> usize {
    if let Some(handle) = HandleRef::from_value(payload) {
        return match resolved.get(&handle.id) {
            Some(&id) if handle.deferred => {
                *payload = HandleRef::resolved(id).to_value();
                1
            }
            _ => 0,
        };
    }
    match payload {
        Value::Array(items) => items
            .iter_mut()
            .map(|item| rewrite_resolved(item, resolved))
            .sum(),
        Value::Object(map) => map
            .values_mut()
            .map(|item| rewrite_resolved(item, resolved))
            .sum(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_ref_encoding() {
        let value = HandleRef::deferred(7).to_value();
        assert_eq!(value, json!({"$handle": {"id": 7, "deferred": true}}));
        assert_eq!(HandleRef::from_value(&value), Some(HandleRef::deferred(7)));
    }

    #[test]
    fn test_from_value_requires_single_marker_key() {
        let value = json!({"$handle": {"id": 1}, "other": 2});
        assert_eq!(HandleRef::from_value(&value), None);

        // deferred defaults to false
        let value = json!({"$handle": {"id": 3}});
        assert_eq!(HandleRef::from_value(&value), Some(HandleRef::resolved(3)));

        assert_eq!(HandleRef::from_value(&json!({"id": 3})), None);
    }

    #[test]
    fn test_collect_nested_handles() {
        let payload = json!({
            "target": HandleRef::resolved(10).to_value(),
            "params": {
                "layers": [HandleRef::deferred(2).to_value(), HandleRef::resolved(11).to_value()],
                "name": "top"
            }
        });
        let mut handles = collect_handles(&payload);
        handles.sort();
        assert_eq!(
            handles,
            vec![
                HandleRef::deferred(2),
                HandleRef::resolved(10),
                HandleRef::resolved(11)
            ]
        );
        assert!(has_deferred(&payload));
    }

    #[test]
    fn test_rewrite_resolved() {
        let mut payload = json!({
            "a": HandleRef::deferred(2).to_value(),
            "b": [HandleRef::deferred(2).to_value(), HandleRef::deferred(3).to_value()],
            "c": HandleRef::resolved(2).to_value(),
            "d": HandleRef::deferred(4).to_value()
        });
        let resolved = HashMap::from([(2, 500), (4, 501)]);
        assert_eq!(rewrite_resolved(&mut payload, &resolved), 3);
        assert_eq!(payload["a"], HandleRef::resolved(500).to_value());
        assert_eq!(payload["b"][0], HandleRef::resolved(500).to_value());
        assert_eq!(payload["b"][1], HandleRef::deferred(3).to_value());
        // already-resolved id 2 is a different object
        assert_eq!(payload["c"], HandleRef::resolved(2).to_value());
        assert_eq!(payload["d"], HandleRef::resolved(501).to_value());
    }

    #[test]
    fn test_rewrite_resolved_with_empty_table() {
        let mut payload = json!({"a": HandleRef::deferred(2).to_value()});
        assert_eq!(rewrite_resolved(&mut payload, &HashMap::new()), 0);
        assert!(has_deferred(&payload));
    }

    #[test]
    fn test_clones_observe_resolution() {
        let handle = Handle::deferred(4);
        let alias = handle.clone();
        assert_eq!(alias.deferred_id(), Some(4));

        handle.resolve(99);
        assert!(!alias.is_deferred());
        assert_eq!(alias.id(), 99);
        assert_eq!(alias.deferred_id(), None);
        assert!(alias.same_cell(&handle));
    }

    #[test]
    fn test_separate_cells_are_independent() {
        let a = Handle::deferred(4);
        let b = Handle::from_value(&HandleRef::deferred(4).to_value()).unwrap();
        assert!(!a.same_cell(&b));

        a.resolve(1);
        assert!(b.is_deferred());
    }
}
