//! Transport contract consumed by the I/O layer.
//!
//! A transport is a synchronous request/response channel to a single server
//! process. Besides plain calls it must support an ordered batch of buffered
//! writes, a batched cache refresh, and one-way notifications.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcResult;

pub mod fake;

/// One-way events the client owes the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Notification {
    /// Client discarded its cache; stop assuming it holds prefetched entries.
    CacheInvalidated,
    /// Client sent its buffered writes.
    BufferFlushed,
    /// Client started caching; the server may attach prefetch bundles.
    CachingStarted,
    /// Client stopped caching; the server should stop attaching them.
    CachingEnded,
}

/// A request/response pair the server volunteers for the client cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedCall {
    pub service: String,
    pub method: String,
    pub request: Value,
    pub response: Value,
}

impl CachedCall {
    pub fn new(
        service: impl Into<String>,
        method: impl Into<String>,
        request: Value,
        response: Value,
    ) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            request,
            response,
        }
    }
}

/// Prefetched answers about one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefetchBundle {
    pub handle_id: u64,
    #[serde(default)]
    pub entries: Vec<CachedCall>,
}

/// Severity of a server-side log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerLogLevel {
    Fatal,
    Error,
    Warn,
    Info,
}

/// Log record attached to a reply by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLog {
    pub level: ServerLogLevel,
    pub message: String,
}

/// Reply to a single call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub body: Value,

    /// Cache entries the server attached for objects it expects the client to query.
    #[serde(default)]
    pub prefetch: Vec<PrefetchBundle>,

    #[serde(default)]
    pub server_logs: Vec<ServerLog>,
}

impl Reply {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            prefetch: Vec::new(),
            server_logs: Vec::new(),
        }
    }

    pub fn with_prefetch(mut self, bundle: PrefetchBundle) -> Self {
        self.prefetch.push(bundle);
        self
    }

    pub fn with_server_log(mut self, level: ServerLogLevel, message: impl Into<String>) -> Self {
        self.server_logs.push(ServerLog {
            level,
            message: message.into(),
        });
        self
    }
}

/// One buffered write as sent in a flush batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub service: String,
    pub method: String,
    pub request: Value,

    /// Set when the write creates an object the client already refers to.
    #[serde(default)]
    pub deferred_id: Option<u64>,
}

/// Server id assigned to a deferred handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub deferred_id: u64,
    pub handle_id: u64,
}

/// Reply to a flush batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReply {
    /// One response per entry, in batch order.
    #[serde(default)]
    pub responses: Vec<Value>,

    #[serde(default)]
    pub resolved: Vec<Resolution>,
}

/// Synchronous connection to the server.
pub trait Transport {
    /// Issue one call.
    fn call(&self, service: &str, method: &str, request: &Value) -> RpcResult<Reply>;

    /// Apply buffered writes in order, resolving every deferred id they introduce.
    fn call_batch(&self, entries: &[BatchEntry]) -> RpcResult<BatchReply>;

    /// Fetch fresh prefetch bundles for the given objects.
    fn refresh(&self, handle_ids: &[u64]) -> RpcResult<Vec<PrefetchBundle>>;

    /// Deliver a one-way notification.
    fn notify(&self, notification: Notification) -> RpcResult<()>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn call(&self, service: &str, method: &str, request: &Value) -> RpcResult<Reply> {
        (**self).call(service, method, request)
    }

    fn call_batch(&self, entries: &[BatchEntry]) -> RpcResult<BatchReply> {
        (**self).call_batch(entries)
    }

    fn refresh(&self, handle_ids: &[u64]) -> RpcResult<Vec<PrefetchBundle>> {
        (**self).refresh(handle_ids)
    }

    fn notify(&self, notification: Notification) -> RpcResult<()> {
        (**self).notify(notification)
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn call(&self, service: &str, method: &str, request: &Value) -> RpcResult<Reply> {
        (**self).call(service, method, request)
    }

    fn call_batch(&self, entries: &[BatchEntry]) -> RpcResult<BatchReply> {
        (**self).call_batch(entries)
    }

    fn refresh(&self, handle_ids: &[u64]) -> RpcResult<Vec<PrefetchBundle>> {
        (**self).refresh(handle_ids)
    }

    fn notify(&self, notification: Notification) -> RpcResult<()> {
        (**self).notify(notification)
    }
}
