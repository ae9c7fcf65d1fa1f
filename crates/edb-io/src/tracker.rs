//! Handles touched by the call currently being intercepted.

use std::collections::HashSet;

use serde_json::Value;

use crate::handle::{collect_handles, HandleRef};

#[derive(Debug, Default)]
pub struct ActiveHandles {
    handles: HashSet<HandleRef>,
}

impl ActiveHandles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tracked set with the handles referenced by `request`.
    pub fn record(&mut self, request: &Value) {
        self.handles = collect_handles(request).into_iter().collect();
    }

    /// Move a tracked deferred handle to its resolved id.
    pub fn resolve(&mut self, deferred_id: u64, handle_id: u64) {
        if self.handles.remove(&HandleRef::deferred(deferred_id)) {
            self.handles.insert(HandleRef::resolved(handle_id));
        }
    }

    pub fn clear(&mut self) {
        self.handles.clear();
    }

    pub fn contains(&self, handle: HandleRef) -> bool {
        self.handles.contains(&handle)
    }

    /// Resolved handle ids, sorted.
    pub fn resolved_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .handles
            .iter()
            .filter(|h| !h.deferred)
            .map(|h| h.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
