//! Lifecycle and interception entry point for the optimizers.
//!
//! An [`IoManager`] is either disabled (every call passes straight through) or
//! enabled with a cache, a buffer, or both. It is an explicit context object:
//! one per connection, owned by the [`Channel`](crate::channel::Channel) that
//! drives it. Starting it twice without an `end` in between is an error.

use std::collections::HashMap;
use std::sync::Arc;

use edb_io_policy::PolicyRegistry;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::buffer::{FlushContext, WriteBuffer};
use crate::cache::ResponseCache;
use crate::config::{IoConfig, IoMode};
use crate::error::{RpcError, RpcResult};
use crate::handle::{rewrite_resolved, Handle};
use crate::notify::PendingNotifications;
use crate::stats::IoStats;
use crate::tracker::ActiveHandles;
use crate::transport::{Notification, PrefetchBundle, Resolution, Transport};

/// Result of a call as seen by the application.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Real response, from the wire or from the cache.
    Response(Value),
    /// The call was buffered and will create this object on flush.
    Deferred(Handle),
    /// The call was buffered and has no payload.
    Acknowledged,
}

impl Outcome {
    pub fn into_response(self) -> Option<Value> {
        match self {
            Self::Response(value) => Some(value),
            _ => None,
        }
    }

    /// Handle carried by the outcome: the deferred handle, or a handle
    /// reference returned by the server.
    pub fn handle(&self) -> Option<Handle> {
        match self {
            Self::Deferred(handle) => Some(handle.clone()),
            Self::Response(value) => Handle::from_value(value),
            Self::Acknowledged => None,
        }
    }
}

/// What interception decided for one call.
#[derive(Debug, Clone)]
pub enum Interception {
    /// Answered without a wire call of its own.
    Satisfied(Outcome),
    /// Send the (possibly rewritten) request to the transport.
    PassThrough,
}

#[derive(Debug)]
pub struct IoManager {
    registry: Arc<PolicyRegistry>,
    mode: Option<IoMode>,
    cache: Option<ResponseCache>,
    buffer: Option<WriteBuffer>,
    tracker: ActiveHandles,
    pending: PendingNotifications,
    next_deferred_id: u64,
    resolved: HashMap<u64, u64>,
    stats: IoStats,
    log_traffic: bool,
}

impl IoManager {
    pub fn new(registry: Arc<PolicyRegistry>) -> Self {
        Self {
            registry,
            mode: None,
            cache: None,
            buffer: None,
            tracker: ActiveHandles::new(),
            pending: PendingNotifications::default(),
            next_deferred_id: 1,
            resolved: HashMap::new(),
            stats: IoStats::default(),
            log_traffic: false,
        }
    }

    /// Build a manager from config, loading the registry it names.
    pub fn from_config(config: &IoConfig) -> anyhow::Result<Self> {
        let registry = config.load_registry()?;
        Ok(Self::new(Arc::new(registry)).with_traffic_logging(config.log_traffic))
    }

    pub fn with_traffic_logging(mut self, enabled: bool) -> Self {
        self.log_traffic = enabled;
        self
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// Enable the optimizers `mode` asks for.
    pub fn start(&mut self, mode: IoMode) -> RpcResult<()> {
        if let Some(active) = self.mode {
            return Err(RpcError::AlreadyActive {
                mode: active.to_string(),
            });
        }
        if !mode.caches() && !mode.buffers() {
            warn!(%mode, "I/O mode enables neither cache nor buffer; staying disabled");
            return Ok(());
        }

        if mode.caches() {
            let mut cache = ResponseCache::new();
            cache.suppress_invalidation(mode.contains(IoMode::NO_CACHE_INVALIDATION));
            self.cache = Some(cache);
            self.pending.push(Notification::CachingStarted);
        }
        if mode.buffers() {
            let mut buffer = WriteBuffer::new(self.next_deferred_id);
            buffer.suppress_flushing(mode.contains(IoMode::NO_BUFFER_FLUSHING));
            self.buffer = Some(buffer);
        }
        self.mode = Some(mode);
        info!(%mode, "I/O management started");
        Ok(())
    }

    /// Flush anything still buffered, tell the server caching is over, then
    /// disable.
    ///
    /// The manager is disabled even when the final flush fails; the first
    /// error is returned after teardown.
    pub fn end(&mut self, transport: &dyn Transport) -> RpcResult<()> {
        let Some(mode) = self.mode.take() else {
            return Ok(());
        };

        let mut result = match self.buffer.as_mut() {
            Some(buffer) => {
                buffer.suppress_flushing(false);
                let mut ctx = FlushContext {
                    transport,
                    cache: self.cache.as_mut(),
                    pending: &mut self.pending,
                    tracker: &mut self.tracker,
                    resolved: &mut self.resolved,
                };
                buffer.flush(&mut ctx).map(|_| ())
            }
            None => Ok(()),
        };

        if let Some(buffer) = self.buffer.take() {
            self.next_deferred_id = buffer.next_deferred_id();
            self.stats.merge(buffer.stats());
        }
        if let Some(cache) = self.cache.take() {
            self.stats.merge(cache.stats());
            let announced = !self
                .pending
                .as_slice()
                .contains(&Notification::CachingStarted);
            if announced {
                let ended = transport.notify(Notification::CachingEnded);
                if let Err(e) = &ended {
                    warn!(error = %e, "failed to announce end of caching");
                }
                result = result.and(ended);
            }
        }
        self.tracker.clear();
        self.pending.clear();

        info!(%mode, ok = result.is_ok(), "I/O management ended");
        result
    }

    /// Offer a call to the optimizers.
    ///
    /// On [`Interception::PassThrough`] the caller sends `request` (which a
    /// flush may have rewritten) and then reports back through
    /// [`complete`](Self::complete) or [`abandon`](Self::abandon).
    pub fn intercept(
        &mut self,
        service: &str,
        method: &str,
        request: &mut Value,
        transport: &dyn Transport,
    ) -> RpcResult<Interception> {
        if self.is_blocking() {
            return Ok(Interception::PassThrough);
        }
        if !self.resolved.is_empty() {
            rewrite_resolved(request, &self.resolved);
        }
        if !self.is_enabled() {
            return Ok(Interception::PassThrough);
        }

        self.tracker.record(request);
        if !self.registry.contains(service, method) {
            debug!(service, method, "no I/O policy for method, treating conservatively");
        }
        let policy = self.registry.lookup_or_conservative(service, method);

        if let Some(cache) = self.cache.as_mut() {
            if let Err(e) = cache.refresh_for(&self.tracker, transport) {
                self.tracker.clear();
                return Err(e);
            }
        }

        if let Some(buffer) = self.buffer.as_mut() {
            let mut ctx = FlushContext {
                transport,
                cache: self.cache.as_mut(),
                pending: &mut self.pending,
                tracker: &mut self.tracker,
                resolved: &mut self.resolved,
            };
            match buffer.intercept(service, method, request, policy, &mut ctx) {
                Ok(Some(outcome)) => {
                    self.tracker.clear();
                    return Ok(Interception::Satisfied(outcome));
                }
                Ok(None) => {}
                Err(e) => {
                    self.tracker.clear();
                    return Err(e);
                }
            }
        }

        if let Some(cache) = self.cache.as_mut() {
            let pending = &mut self.pending;
            if let Some(response) = cache.intercept(service, method, request, policy, pending) {
                self.tracker.clear();
                return Ok(Interception::Satisfied(Outcome::Response(response)));
            }
        }

        Ok(Interception::PassThrough)
    }

    /// Count a call that is about to reach the wire.
    pub fn record_wire_call(&mut self, service: &str, method: &str) {
        if self.log_traffic {
            self.stats.record_wire_call(service, method);
        }
    }

    /// Finish a passed-through call: ingest attached prefetch bundles and
    /// forget its active handles.
    pub fn complete(&mut self, prefetch: Vec<PrefetchBundle>) {
        match self.cache.as_mut() {
            Some(cache) => {
                for bundle in prefetch {
                    cache.ingest(bundle.handle_id, bundle.entries);
                }
            }
            None if !prefetch.is_empty() => {
                debug!(bundles = prefetch.len(), "cache disabled, ignoring prefetch");
            }
            None => {}
        }
        self.tracker.clear();
    }

    /// Forget the active handles of a call that failed on the wire.
    pub fn abandon(&mut self) {
        self.tracker.clear();
    }

    /// Flush the buffer now, if there is one.
    pub fn flush(&mut self, transport: &dyn Transport) -> RpcResult<Vec<Resolution>> {
        let Some(buffer) = self.buffer.as_mut() else {
            return Ok(Vec::new());
        };
        let mut ctx = FlushContext {
            transport,
            cache: self.cache.as_mut(),
            pending: &mut self.pending,
            tracker: &mut self.tracker,
            resolved: &mut self.resolved,
        };
        buffer.flush(&mut ctx)
    }

    /// Make `handle` follow the resolution of `deferred_id`.
    pub fn register_alias(&mut self, deferred_id: u64, handle: &Handle) -> bool {
        match self.buffer.as_mut() {
            Some(buffer) => buffer.register_alias(deferred_id, handle),
            None => {
                warn!(deferred_id, "alias registered while buffering is disabled");
                false
            }
        }
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        self.pending.take()
    }

    pub fn requeue_notifications(&mut self, undelivered: Vec<Notification>) {
        self.pending.requeue(undelivered);
    }

    pub fn pending_notifications(&self) -> &[Notification] {
        self.pending.as_slice()
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some() || self.buffer.is_some()
    }

    /// Whether an optimizer is inside its own internal transport call.
    pub fn is_blocking(&self) -> bool {
        self.cache.as_ref().is_some_and(ResponseCache::is_refreshing)
            || self.buffer.as_ref().is_some_and(WriteBuffer::is_flushing)
    }

    pub fn mode(&self) -> Option<IoMode> {
        self.mode
    }

    pub fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    pub fn buffer(&self) -> Option<&WriteBuffer> {
        self.buffer.as_ref()
    }

    pub fn active_handles(&self) -> &ActiveHandles {
        &self.tracker
    }

    /// Counters from every session so far, including the active one.
    pub fn stats(&self) -> IoStats {
        let mut stats = self.stats.clone();
        if let Some(cache) = &self.cache {
            stats.merge(cache.stats());
        }
        if let Some(buffer) = &self.buffer {
            stats.merge(buffer.stats());
        }
        stats
    }
}
