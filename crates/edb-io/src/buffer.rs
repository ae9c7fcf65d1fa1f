//! Write buffer and deferred-handle table.
//!
//! Bufferable writes are queued instead of sent. Anything else (a read, an
//! unbufferable write, a method the registry does not know) first forces the
//! queue out as one ordered batch, so no call ever observes server state that
//! is missing an earlier write.

use std::collections::HashMap;
use std::mem;

use edb_io_policy::MethodPolicy;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::block::BlockGuard;
use crate::cache::ResponseCache;
use crate::error::RpcResult;
use crate::handle::{has_deferred, rewrite_resolved, Handle};
use crate::manager::Outcome;
use crate::notify::PendingNotifications;
use crate::stats::IoStats;
use crate::tracker::ActiveHandles;
use crate::transport::{BatchEntry, Notification, Resolution, Transport};

/// Everything a flush touches besides the buffer itself.
pub struct FlushContext<'a> {
    pub transport: &'a dyn Transport,
    pub cache: Option<&'a mut ResponseCache>,
    pub pending: &'a mut PendingNotifications,
    pub tracker: &'a mut ActiveHandles,
    /// Deferred id to server id, for every deferred handle resolved so far.
    pub resolved: &'a mut HashMap<u64, u64>,
}

#[derive(Debug)]
pub struct WriteBuffer {
    entries: Vec<BatchEntry>,
    deferred: HashMap<u64, Vec<Handle>>,
    pending_invalidation: bool,
    flushing_suppressed: bool,
    flushing: bool,
    next_deferred_id: u64,
    stats: IoStats,
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new(1)
    }
}

impl WriteBuffer {
    /// Create an empty buffer handing out deferred ids from `first_deferred_id`.
    pub fn new(first_deferred_id: u64) -> Self {
        Self {
            entries: Vec::new(),
            deferred: HashMap::new(),
            pending_invalidation: false,
            flushing_suppressed: false,
            flushing: false,
            next_deferred_id: first_deferred_id,
            stats: IoStats::default(),
        }
    }

    /// Keep writes queued when a read would normally force them out.
    pub fn suppress_flushing(&mut self, suppressed: bool) {
        self.flushing_suppressed = suppressed;
    }

    /// Write-side interception.
    ///
    /// Returns the synthetic outcome of a buffered write, or `None` when the
    /// call must go to the wire. In the latter case the queue has already been
    /// flushed and `request` rewritten to carry every handle id resolved so
    /// far.
    pub fn intercept(
        &mut self,
        service: &str,
        method: &str,
        request: &mut Value,
        policy: &MethodPolicy,
        ctx: &mut FlushContext<'_>,
    ) -> RpcResult<Option<Outcome>> {
        if policy.is_read || !policy.can_buffer {
            self.flush(ctx)?;
            rewrite_resolved(request, ctx.resolved);
            if has_deferred(request) {
                warn!(service, method, "request references unresolved deferred handles");
            }
            return Ok(None);
        }

        if policy.invalidates_cache {
            self.pending_invalidation = true;
        }

        let (deferred_id, outcome) = if policy.returns_handle {
            let deferred_id = self.next_deferred_id;
            self.next_deferred_id += 1;

            let handle = Handle::deferred(deferred_id);
            self.deferred.insert(deferred_id, vec![handle.clone()]);
            (Some(deferred_id), Outcome::Deferred(handle))
        } else {
            (None, Outcome::Acknowledged)
        };

        self.entries.push(BatchEntry {
            service: service.to_string(),
            method: method.to_string(),
            request: mem::take(request),
            deferred_id,
        });
        self.stats.buffered_writes += 1;
        debug!(service, method, ?deferred_id, queued = self.entries.len(), "buffered write");

        Ok(Some(outcome))
    }

    /// Send every queued write as one ordered batch.
    ///
    /// The queue is emptied whether or not the transport call succeeds.
    pub fn flush(&mut self, ctx: &mut FlushContext<'_>) -> RpcResult<Vec<Resolution>> {
        if self.entries.is_empty() {
            return Ok(Vec::new());
        }
        if self.flushing_suppressed {
            debug!(queued = self.entries.len(), "buffer flushing suppressed");
            return Ok(Vec::new());
        }

        if mem::take(&mut self.pending_invalidation) {
            if let Some(cache) = ctx.cache.as_deref_mut() {
                cache.invalidate(ctx.pending);
            }
        }

        let entries = mem::take(&mut self.entries);
        let deferred = mem::take(&mut self.deferred);
        debug!(entries = entries.len(), deferred = deferred.len(), "flushing write buffer");

        let reply = {
            let _block = BlockGuard::engage(&mut self.flushing);
            ctx.transport.call_batch(&entries)?
        };
        self.stats.flushes += 1;
        self.stats.flushed_entries += entries.len() as u64;

        for resolution in &reply.resolved {
            if let Some(handles) = deferred.get(&resolution.deferred_id) {
                for handle in handles {
                    handle.resolve(resolution.handle_id);
                }
            }
            ctx.tracker.resolve(resolution.deferred_id, resolution.handle_id);
            ctx.resolved.insert(resolution.deferred_id, resolution.handle_id);
        }

        for deferred_id in entries.iter().filter_map(|e| e.deferred_id) {
            if !reply.resolved.iter().any(|r| r.deferred_id == deferred_id) {
                error!(deferred_id, "flush reply did not resolve deferred handle");
            }
        }

        ctx.pending.push(Notification::BufferFlushed);
        Ok(reply.resolved)
    }

    /// Register another reference to a queued, not yet resolved object.
    pub fn register_alias(&mut self, deferred_id: u64, handle: &Handle) -> bool {
        match self.deferred.get_mut(&deferred_id) {
            Some(handles) => {
                if !handles.iter().any(|h| h.same_cell(handle)) {
                    handles.push(handle.clone());
                }
                true
            }
            None => {
                warn!(deferred_id, "alias registered for unknown deferred id");
                false
            }
        }
    }

    pub fn next_deferred_id(&self) -> u64 {
        self.next_deferred_id
    }

    pub fn queued(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn has_pending_invalidation(&self) -> bool {
        self.pending_invalidation
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    pub fn stats(&self) -> &IoStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use crate::handle::HandleRef;
    use crate::transport::fake::FakeTransport;
    use crate::transport::CachedCall;
    use edb_io_policy::IoFlag;
    use serde_json::json;

    struct Harness {
        fake: FakeTransport,
        cache: ResponseCache,
        pending: PendingNotifications,
        tracker: ActiveHandles,
        resolved: HashMap<u64, u64>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                fake: FakeTransport::new(),
                cache: ResponseCache::new(),
                pending: PendingNotifications::default(),
                tracker: ActiveHandles::new(),
                resolved: HashMap::new(),
            }
        }

        fn ctx(&mut self) -> FlushContext<'_> {
            FlushContext {
                transport: &self.fake,
                cache: Some(&mut self.cache),
                pending: &mut self.pending,
                tracker: &mut self.tracker,
                resolved: &mut self.resolved,
            }
        }
    }

    fn create() -> MethodPolicy {
        MethodPolicy::from_flags(&[IoFlag::Buffer, IoFlag::ReturnsHandle])
    }

    fn set() -> MethodPolicy {
        MethodPolicy::from_flags(&[IoFlag::Buffer])
    }

    fn read() -> MethodPolicy {
        MethodPolicy::from_flags(&[IoFlag::Cache])
    }

    #[test]
    fn test_buffered_write_returns_deferred_handle() {
        let mut h = Harness::new();
        let mut buffer = WriteBuffer::new(5);

        let mut request = json!({"name": "a"});
        let outcome = buffer
            .intercept("svc", "Create", &mut request, &create(), &mut h.ctx())
            .unwrap();
        let Some(Outcome::Deferred(handle)) = outcome else {
            panic!("expected deferred handle");
        };
        assert_eq!(handle.deferred_id(), Some(5));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.queued()[0].deferred_id, Some(5));
        assert_eq!(buffer.queued()[0].request, json!({"name": "a"}));
        assert!(buffer.has_pending_invalidation());
        assert!(h.fake.journal().is_empty());
    }

    #[test]
    fn test_read_flushes_in_order_and_rewrites_request() {
        let mut h = Harness::new();
        let mut buffer = WriteBuffer::default();

        let mut create_req = json!({"name": "a"});
        let Some(Outcome::Deferred(handle)) = buffer
            .intercept("svc", "Create", &mut create_req, &create(), &mut h.ctx())
            .unwrap()
        else {
            panic!("expected deferred handle");
        };
        let mut set_req = json!({"target": handle.to_value(), "negative": true});
        let outcome = buffer
            .intercept("svc", "SetIsNegative", &mut set_req, &set(), &mut h.ctx())
            .unwrap();
        assert!(matches!(outcome, Some(Outcome::Acknowledged)));

        let mut read_req = json!({"target": handle.to_value()});
        let outcome = buffer
            .intercept("svc", "GetName", &mut read_req, &read(), &mut h.ctx())
            .unwrap();
        assert!(outcome.is_none());

        let batches = h.fake.batches();
        assert_eq!(batches.len(), 1);
        let methods: Vec<&str> = batches[0].iter().map(|e| e.method.as_str()).collect();
        assert_eq!(methods, ["Create", "SetIsNegative"]);

        assert_eq!(handle.get(), HandleRef::resolved(1000));
        assert_eq!(read_req["target"], HandleRef::resolved(1000).to_value());
        assert!(buffer.is_empty());
        assert_eq!(h.pending.as_slice(), &[Notification::BufferFlushed]);
    }

    #[test]
    fn test_stale_reference_rewritten_after_earlier_flush() {
        let mut h = Harness::new();
        let mut buffer = WriteBuffer::default();

        let Some(Outcome::Deferred(handle)) = buffer
            .intercept("svc", "Create", &mut json!({}), &create(), &mut h.ctx())
            .unwrap()
        else {
            panic!("expected deferred handle");
        };
        let stale = handle.to_value();
        buffer
            .intercept("svc", "GetName", &mut json!({}), &read(), &mut h.ctx())
            .unwrap();
        assert_eq!(h.resolved.get(&1), Some(&1000));

        // nothing queued, the reference is still rewritten
        let mut read_req = json!({"target": stale});
        buffer
            .intercept("svc", "GetName", &mut read_req, &read(), &mut h.ctx())
            .unwrap();
        assert_eq!(read_req["target"], HandleRef::resolved(1000).to_value());
        assert_eq!(h.fake.batches().len(), 1);
    }

    #[test]
    fn test_unbufferable_write_flushes_first() {
        let mut h = Harness::new();
        let mut buffer = WriteBuffer::default();

        buffer
            .intercept("svc", "SetName", &mut json!({}), &set(), &mut h.ctx())
            .unwrap();
        let save = MethodPolicy::from_flags(&[IoFlag::WriteNoBuffer]);
        let outcome = buffer
            .intercept("svc", "Save", &mut json!({}), &save, &mut h.ctx())
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(h.fake.batches().len(), 1);

        // unknown methods behave the same way
        buffer
            .intercept("svc", "SetName", &mut json!({}), &set(), &mut h.ctx())
            .unwrap();
        let unknown = MethodPolicy::conservative();
        buffer
            .intercept("svc", "Mystery", &mut json!({}), &unknown, &mut h.ctx())
            .unwrap();
        assert_eq!(h.fake.batches().len(), 2);
    }

    #[test]
    fn test_pending_invalidation_clears_cache_before_batch() {
        let mut h = Harness::new();
        h.cache.ingest(
            9,
            vec![CachedCall::new("svc", "GetName", json!({}), json!("old"))],
        );
        let mut buffer = WriteBuffer::default();

        buffer
            .intercept("svc", "SetName", &mut json!({}), &set(), &mut h.ctx())
            .unwrap();
        assert_eq!(h.cache.len(), 1);

        buffer.flush(&mut h.ctx()).unwrap();
        assert!(h.cache.is_empty());
        assert!(!buffer.has_pending_invalidation());
        assert_eq!(
            h.pending.as_slice(),
            &[Notification::CacheInvalidated, Notification::BufferFlushed]
        );
    }

    #[test]
    fn test_failed_flush_still_empties_buffer() {
        let mut h = Harness::new();
        h.fake.fail_next_batch(RpcError::from_status(14, "gone"));
        let mut buffer = WriteBuffer::default();

        let mut request = json!({});
        let Some(Outcome::Deferred(handle)) = buffer
            .intercept("svc", "Create", &mut request, &create(), &mut h.ctx())
            .unwrap()
        else {
            panic!("expected deferred handle");
        };

        let err = buffer.flush(&mut h.ctx()).unwrap_err();
        assert!(err.is_retryable());
        assert!(buffer.is_empty());
        assert!(!buffer.is_flushing());
        assert!(handle.is_deferred());
        assert!(!buffer.register_alias(1, &handle));

        // nothing left to send
        buffer.flush(&mut h.ctx()).unwrap();
        assert_eq!(h.fake.batches().len(), 1);
    }

    #[test]
    fn test_alias_observes_resolution() {
        let mut h = Harness::new();
        let mut buffer = WriteBuffer::default();

        let Some(Outcome::Deferred(handle)) = buffer
            .intercept("svc", "Create", &mut json!({}), &create(), &mut h.ctx())
            .unwrap()
        else {
            panic!("expected deferred handle");
        };
        let alias = Handle::from_value(&handle.to_value()).unwrap();
        assert!(buffer.register_alias(1, &alias));
        assert!(!buffer.register_alias(42, &alias));

        buffer.flush(&mut h.ctx()).unwrap();
        assert_eq!(alias.get(), HandleRef::resolved(1000));
        assert_eq!(handle.get(), HandleRef::resolved(1000));
    }

    #[test]
    fn test_suppressed_flushing_keeps_queue() {
        let mut h = Harness::new();
        let mut buffer = WriteBuffer::default();
        buffer.suppress_flushing(true);

        buffer
            .intercept("svc", "SetName", &mut json!({}), &set(), &mut h.ctx())
            .unwrap();
        let outcome = buffer
            .intercept("svc", "GetName", &mut json!({}), &read(), &mut h.ctx())
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(buffer.len(), 1);
        assert!(h.fake.batches().is_empty());

        buffer.suppress_flushing(false);
        buffer.flush(&mut h.ctx()).unwrap();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_omitted_resolution_leaves_handle_deferred() {
        let mut h = Harness::new();
        h.fake.omit_resolution(1);
        let mut buffer = WriteBuffer::default();

        let Some(Outcome::Deferred(handle)) = buffer
            .intercept("svc", "Create", &mut json!({}), &create(), &mut h.ctx())
            .unwrap()
        else {
            panic!("expected deferred handle");
        };
        let resolved = buffer.flush(&mut h.ctx()).unwrap();
        assert!(resolved.is_empty());
        assert_eq!(handle.deferred_id(), Some(1));
    }
}
