//! Read cache.
//!
//! The cache only ever holds answers the server volunteered: prefetch bundles
//! attached to unrelated replies, or the result of an explicit refresh. A miss
//! is never memoized. Invalidation always clears the whole table and marks every
//! known handle [`Freshness::Stale`]; the next call touching a stale handle
//! pulls that handle's entries again before it is sent.

use std::collections::HashMap;

use edb_io_policy::MethodPolicy;
use serde_json::Value;
use tracing::{debug, warn};

use crate::block::BlockGuard;
use crate::canonical::CacheKey;
use crate::error::RpcResult;
use crate::notify::PendingNotifications;
use crate::stats::IoStats;
use crate::tracker::ActiveHandles;
use crate::transport::{CachedCall, Notification, Transport};

/// Whether the cached entries for a handle are current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
}

#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: HashMap<CacheKey, Value>,
    freshness: HashMap<u64, Freshness>,
    invalidation_suppressed: bool,
    refreshing: bool,
    stats: IoStats,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave entries in place when a write would invalidate them.
    pub fn suppress_invalidation(&mut self, suppressed: bool) {
        self.invalidation_suppressed = suppressed;
    }

    /// Read-side interception. Returns the cached response on a hit.
    pub fn intercept(
        &mut self,
        service: &str,
        method: &str,
        request: &Value,
        policy: &MethodPolicy,
        pending: &mut PendingNotifications,
    ) -> Option<Value> {
        if policy.invalidates_cache {
            self.invalidate(pending);
            return None;
        }
        if !policy.can_cache {
            return None;
        }

        let key = match CacheKey::new(service, method, request) {
            Ok(key) => key,
            Err(e) => {
                warn!(service, method, error = %e, "request not canonicalizable, skipping cache");
                self.stats.cache_misses += 1;
                return None;
            }
        };

        match self.entries.get(&key) {
            Some(response) => {
                debug!(service, method, "cache hit");
                self.stats.cache_hits += 1;
                Some(response.clone())
            }
            None => {
                debug!(service, method, "cache miss");
                self.stats.cache_misses += 1;
                None
            }
        }
    }

    /// Insert server-provided entries about `handle_id` and mark it fresh.
    pub fn ingest(&mut self, handle_id: u64, entries: Vec<CachedCall>) -> usize {
        let mut inserted = 0;
        for call in entries {
            match CacheKey::new(&call.service, &call.method, &call.request) {
                Ok(key) => {
                    self.entries.insert(key, call.response);
                    inserted += 1;
                }
                Err(e) => {
                    warn!(
                        service = %call.service,
                        method = %call.method,
                        error = %e,
                        "dropping prefetched entry"
                    );
                }
            }
        }
        self.freshness.insert(handle_id, Freshness::Fresh);
        self.stats.ingested_entries += inserted as u64;
        debug!(handle_id, inserted, "ingested prefetch bundle");
        inserted
    }

    /// Clear every entry. Returns whether anything was discarded.
    pub fn invalidate(&mut self, pending: &mut PendingNotifications) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        if self.invalidation_suppressed {
            debug!(entries = self.entries.len(), "cache invalidation suppressed");
            return false;
        }

        let discarded = self.entries.len();
        self.entries.clear();
        for state in self.freshness.values_mut() {
            *state = Freshness::Stale;
        }
        self.stats.invalidations += 1;
        pending.push(Notification::CacheInvalidated);
        debug!(discarded, "cache invalidated");
        true
    }

    /// Refresh-ahead for the handles an outgoing call touches.
    ///
    /// Only resolved handles currently marked stale are refreshed, in one
    /// batched call. On failure they stay stale and are retried by the next
    /// call that touches them.
    pub fn refresh_for(
        &mut self,
        active: &ActiveHandles,
        transport: &dyn Transport,
    ) -> RpcResult<()> {
        let stale: Vec<u64> = active
            .resolved_ids()
            .into_iter()
            .filter(|id| self.freshness.get(id) == Some(&Freshness::Stale))
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        debug!(handles = ?stale, "refreshing stale handles");
        let bundles = {
            let _block = BlockGuard::engage(&mut self.refreshing);
            transport.refresh(&stale)?
        };
        self.stats.refreshes += 1;
        for bundle in bundles {
            self.ingest(bundle.handle_id, bundle.entries);
        }
        Ok(())
    }

    pub fn get(&self, service: &str, method: &str, request: &Value) -> Option<&Value> {
        let key = CacheKey::new(service, method, request).ok()?;
        self.entries.get(&key)
    }

    pub fn freshness(&self, handle_id: u64) -> Option<Freshness> {
        self.freshness.get(&handle_id).copied()
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing
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
    use edb_io_policy::IoFlag;
    use serde_json::json;

    fn cacheable() -> MethodPolicy {
        MethodPolicy::from_flags(&[IoFlag::Cache])
    }

    fn name_entry(id: u64, name: &str) -> CachedCall {
        CachedCall::new(
            "svc",
            "GetName",
            json!({"target": HandleRef::resolved(id).to_value()}),
            json!({"name": name}),
        )
    }

    fn request(id: u64) -> Value {
        json!({"target": HandleRef::resolved(id).to_value()})
    }

    #[test]
    fn test_hit_after_ingest_and_no_insert_on_miss() {
        let mut cache = ResponseCache::new();
        let mut pending = PendingNotifications::default();

        let hit = cache.intercept("svc", "GetName", &request(1), &cacheable(), &mut pending);
        assert_eq!(hit, None);
        assert!(cache.is_empty());

        cache.ingest(1, vec![name_entry(1, "top")]);
        assert_eq!(
            cache.intercept("svc", "GetName", &request(1), &cacheable(), &mut pending),
            Some(json!({"name": "top"}))
        );
        assert_eq!(cache.freshness(1), Some(Freshness::Fresh));
        assert_eq!(cache.stats().cache_hits, 1);
        assert_eq!(cache.stats().cache_misses, 1);
    }

    #[test]
    fn test_uncacheable_method_misses() {
        let mut cache = ResponseCache::new();
        let mut pending = PendingNotifications::default();
        cache.ingest(1, vec![name_entry(1, "top")]);

        let policy = MethodPolicy::from_flags(&[IoFlag::ReadNoCache]);
        assert_eq!(cache.intercept("svc", "GetName", &request(1), &policy, &mut pending), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidating_call_clears_and_marks_stale() {
        let mut cache = ResponseCache::new();
        let mut pending = PendingNotifications::default();
        cache.ingest(1, vec![name_entry(1, "top")]);
        cache.ingest(2, vec![name_entry(2, "bottom")]);

        let conservative = MethodPolicy::conservative();
        let hit = cache.intercept("svc", "Unknown", &json!({}), &conservative, &mut pending);
        assert_eq!(hit, None);
        assert!(cache.is_empty());
        assert_eq!(cache.freshness(1), Some(Freshness::Stale));
        assert_eq!(cache.freshness(2), Some(Freshness::Stale));
        assert_eq!(pending.as_slice(), &[Notification::CacheInvalidated]);
    }

    #[test]
    fn test_invalidate_empty_is_noop() {
        let mut cache = ResponseCache::new();
        let mut pending = PendingNotifications::default();
        assert!(!cache.invalidate(&mut pending));
        assert!(pending.is_empty());
        assert_eq!(cache.stats().invalidations, 0);
    }

    #[test]
    fn test_suppressed_invalidation_keeps_entries() {
        let mut cache = ResponseCache::new();
        let mut pending = PendingNotifications::default();
        cache.suppress_invalidation(true);
        cache.ingest(1, vec![name_entry(1, "top")]);

        assert!(!cache.invalidate(&mut pending));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.freshness(1), Some(Freshness::Fresh));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_refresh_only_stale_resolved_handles() {
        let fake = FakeTransport::new();
        fake.on_refresh(1, vec![name_entry(1, "renamed")]);

        let mut cache = ResponseCache::new();
        let mut pending = PendingNotifications::default();
        cache.ingest(1, vec![name_entry(1, "top")]);
        cache.invalidate(&mut pending);
        cache.ingest(2, vec![name_entry(2, "bottom")]);

        let mut active = ActiveHandles::new();
        active.record(&json!([
            HandleRef::resolved(1).to_value(),
            HandleRef::resolved(2).to_value(),
            HandleRef::resolved(3).to_value(),
            HandleRef::deferred(1).to_value()
        ]));

        cache.refresh_for(&active, &fake).unwrap();
        assert_eq!(fake.refreshes(), vec![vec![1]]);
        assert_eq!(cache.freshness(1), Some(Freshness::Fresh));
        assert_eq!(
            cache.get("svc", "GetName", &request(1)),
            Some(&json!({"name": "renamed"}))
        );
        assert!(!cache.is_refreshing());

        // nothing stale any more
        cache.refresh_for(&active, &fake).unwrap();
        assert_eq!(fake.refreshes().len(), 1);
    }

    #[test]
    fn test_failed_refresh_leaves_handle_stale() {
        let fake = FakeTransport::new();
        fake.fail_next_refresh(RpcError::transport("down"));

        let mut cache = ResponseCache::new();
        let mut pending = PendingNotifications::default();
        cache.ingest(1, vec![name_entry(1, "top")]);
        cache.invalidate(&mut pending);

        let mut active = ActiveHandles::new();
        active.record(&request(1));

        assert!(cache.refresh_for(&active, &fake).is_err());
        assert!(!cache.is_refreshing());
        assert_eq!(cache.freshness(1), Some(Freshness::Stale));

        cache.refresh_for(&active, &fake).unwrap();
        assert_eq!(cache.freshness(1), Some(Freshness::Fresh));
        assert_eq!(fake.refreshes().len(), 2);
    }
}
