//! Per-method I/O facts.
//!
//! A [`MethodPolicy`] is derived from the raw [`IoFlag`]s declared for a
//! remote method in the service schema. Policies are immutable once built.

use serde::{Deserialize, Serialize};

/// Raw I/O flag as declared on a method in the service schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoFlag {
    /// Read whose response may be served from the client cache.
    Cache,
    /// Read that must always go over the wire.
    ReadNoCache,
    /// Write that may be queued in the client buffer.
    Buffer,
    /// Write that must always go over the wire.
    WriteNoBuffer,
    /// Successful call creates a server object and returns its handle.
    ReturnsHandle,
    /// Write that leaves previously cached reads valid.
    WriteNoCacheInvalidation,
}

/// A cached accessor that a write could invalidate, with the scope it applies to.
///
/// Carried as metadata only; the cache still clears everything on invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvalidationTarget {
    /// Accessor path, `service/method`.
    pub accessor: String,

    /// Which objects the invalidation reaches (e.g. `self`, `layout`).
    pub scope: String,
}

impl InvalidationTarget {
    pub fn new(accessor: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            accessor: accessor.into(),
            scope: scope.into(),
        }
    }

    /// Split the accessor into `(service, method)`.
    pub fn service_and_method(&self) -> Option<(&str, &str)> {
        let (service, method) = self.accessor.rsplit_once('/')?;
        if service.is_empty() || method.is_empty() {
            return None;
        }
        Some((service, method))
    }
}

/// Fixed facts about one remote method.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MethodPolicy {
    pub is_read: bool,
    pub is_write: bool,
    pub can_cache: bool,
    pub can_buffer: bool,
    pub returns_handle: bool,
    pub invalidates_cache: bool,
    pub invalidation_scope: Vec<InvalidationTarget>,
}

impl MethodPolicy {
    /// Derive a policy from declared flags.
    pub fn from_flags(flags: &[IoFlag]) -> Self {
        let has = |flag: IoFlag| flags.contains(&flag);

        let is_read = has(IoFlag::Cache) || has(IoFlag::ReadNoCache);
        let is_write = has(IoFlag::Buffer) || has(IoFlag::WriteNoBuffer);

        Self {
            is_read,
            is_write,
            can_cache: has(IoFlag::Cache),
            can_buffer: has(IoFlag::Buffer),
            returns_handle: has(IoFlag::ReturnsHandle),
            invalidates_cache: is_write && !has(IoFlag::WriteNoCacheInvalidation),
            invalidation_scope: Vec::new(),
        }
    }

    /// Policy applied to methods the registry does not know.
    ///
    /// Never cached, never buffered, and always treated as a write that
    /// invalidates the cache.
    pub fn conservative() -> Self {
        Self {
            is_read: false,
            is_write: true,
            can_cache: false,
            can_buffer: false,
            returns_handle: false,
            invalidates_cache: true,
            invalidation_scope: Vec::new(),
        }
    }

    pub fn with_invalidation_scope(mut self, scope: Vec<InvalidationTarget>) -> Self {
        self.invalidation_scope = scope;
        self
    }
}
