//! Scripted in-memory transport for tests and examples.
//!
//! `FakeTransport` answers from a script, assigns server ids to deferred
//! handles on flush, and keeps a journal of everything that reached the wire.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use super::{
    BatchEntry, BatchReply, CachedCall, Notification, PrefetchBundle, Reply, Resolution,
    ServerLog, ServerLogLevel, Transport,
};
use crate::error::{RpcError, RpcResult};
use crate::handle::HandleRef;

const FIRST_HANDLE_ID: u64 = 1000;

/// One observed wire event.
#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    Call {
        service: String,
        method: String,
        request: Value,
    },
    Batch(Vec<BatchEntry>),
    Refresh(Vec<u64>),
    Notify(Notification),
}

type MethodKey = (String, String);

fn method_key(service: &str, method: &str) -> MethodKey {
    (service.to_string(), method.to_string())
}

#[derive(Debug, Default)]
struct FakeState {
    responses: HashMap<MethodKey, Value>,
    prefetch: HashMap<MethodKey, Vec<PrefetchBundle>>,
    server_logs: HashMap<MethodKey, Vec<ServerLog>>,
    refresh_bundles: HashMap<u64, Vec<CachedCall>>,
    omitted: HashSet<u64>,
    next_handle_id: u64,
    fail_call: Option<RpcError>,
    fail_batch: Option<RpcError>,
    fail_refresh: Option<RpcError>,
    fail_notify: Option<RpcError>,
    journal: Vec<WireEvent>,
}

#[derive(Debug)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_handle_id: FIRST_HANDLE_ID,
                ..FakeState::default()
            }),
        }
    }

    /// First server id handed out on flush.
    pub fn with_first_handle_id(self, id: u64) -> Self {
        self.state().next_handle_id = id;
        self
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Body returned for `service/method`. Unscripted methods answer `null`.
    pub fn respond(&self, service: &str, method: &str, body: Value) {
        self.state().responses.insert(method_key(service, method), body);
    }

    /// Attach a prefetch bundle to every reply of `service/method`.
    pub fn attach_prefetch(&self, service: &str, method: &str, bundle: PrefetchBundle) {
        self.state()
            .prefetch
            .entry(method_key(service, method))
            .or_default()
            .push(bundle);
    }

    /// Attach a server log record to every reply of `service/method`.
    pub fn attach_server_log(
        &self,
        service: &str,
        method: &str,
        level: ServerLogLevel,
        message: &str,
    ) {
        self.state()
            .server_logs
            .entry(method_key(service, method))
            .or_default()
            .push(ServerLog {
                level,
                message: message.to_string(),
            });
    }

    /// Entries returned when `handle_id` is refreshed.
    pub fn on_refresh(&self, handle_id: u64, entries: Vec<CachedCall>) {
        self.state().refresh_bundles.insert(handle_id, entries);
    }

    /// Leave `deferred_id` out of the next batch reply that mentions it.
    pub fn omit_resolution(&self, deferred_id: u64) {
        self.state().omitted.insert(deferred_id);
    }

    pub fn fail_next_call(&self, error: RpcError) {
        self.state().fail_call = Some(error);
    }

    pub fn fail_next_batch(&self, error: RpcError) {
        self.state().fail_batch = Some(error);
    }

    pub fn fail_next_refresh(&self, error: RpcError) {
        self.state().fail_refresh = Some(error);
    }

    pub fn fail_next_notify(&self, error: RpcError) {
        self.state().fail_notify = Some(error);
    }

    /// Everything that reached the wire, in order.
    pub fn journal(&self) -> Vec<WireEvent> {
        self.state().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.state().journal.clear();
    }

    /// Number of single calls made to `service/method`.
    pub fn call_count(&self, service: &str, method: &str) -> usize {
        self.state()
            .journal
            .iter()
            .filter(|event| match event {
                WireEvent::Call {
                    service: s,
                    method: m,
                    ..
                } => s == service && m == method,
                _ => false,
            })
            .count()
    }

    pub fn batches(&self) -> Vec<Vec<BatchEntry>> {
        self.state()
            .journal
            .iter()
            .filter_map(|event| match event {
                WireEvent::Batch(entries) => Some(entries.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn refreshes(&self) -> Vec<Vec<u64>> {
        self.state()
            .journal
            .iter()
            .filter_map(|event| match event {
                WireEvent::Refresh(ids) => Some(ids.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.state()
            .journal
            .iter()
            .filter_map(|event| match event {
                WireEvent::Notify(n) => Some(*n),
                _ => None,
            })
            .collect()
    }
}

impl Transport for FakeTransport {
    fn call(&self, service: &str, method: &str, request: &Value) -> RpcResult<Reply> {
        let mut state = self.state();
        state.journal.push(WireEvent::Call {
            service: service.to_string(),
            method: method.to_string(),
            request: request.clone(),
        });
        if let Some(err) = state.fail_call.take() {
            return Err(err);
        }

        let key = method_key(service, method);
        Ok(Reply {
            body: state.responses.get(&key).cloned().unwrap_or(Value::Null),
            prefetch: state.prefetch.get(&key).cloned().unwrap_or_default(),
            server_logs: state.server_logs.get(&key).cloned().unwrap_or_default(),
        })
    }

    fn call_batch(&self, entries: &[BatchEntry]) -> RpcResult<BatchReply> {
        let mut state = self.state();
        state.journal.push(WireEvent::Batch(entries.to_vec()));
        if let Some(err) = state.fail_batch.take() {
            return Err(err);
        }

        let mut reply = BatchReply::default();
        for entry in entries {
            let body = match entry.deferred_id {
                Some(deferred_id) => {
                    let handle_id = state.next_handle_id;
                    state.next_handle_id += 1;
                    if !state.omitted.remove(&deferred_id) {
                        reply.resolved.push(Resolution {
                            deferred_id,
                            handle_id,
                        });
                    }
                    HandleRef::resolved(handle_id).to_value()
                }
                None => state
                    .responses
                    .get(&method_key(&entry.service, &entry.method))
                    .cloned()
                    .unwrap_or(Value::Null),
            };
            reply.responses.push(body);
        }
        Ok(reply)
    }

    fn refresh(&self, handle_ids: &[u64]) -> RpcResult<Vec<PrefetchBundle>> {
        let mut state = self.state();
        state.journal.push(WireEvent::Refresh(handle_ids.to_vec()));
        if let Some(err) = state.fail_refresh.take() {
            return Err(err);
        }

        Ok(handle_ids
            .iter()
            .map(|&handle_id| PrefetchBundle {
                handle_id,
                entries: state
                    .refresh_bundles
                    .get(&handle_id)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect())
    }

    fn notify(&self, notification: Notification) -> RpcResult<()> {
        let mut state = self.state();
        state.journal.push(WireEvent::Notify(notification));
        match state.fail_notify.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
