//! Application-facing entry point.
//!
//! Every generated accessor issues its call through [`Channel::call`]. With
//! I/O management disabled the call goes straight to the transport; inside an
//! [`IoScope`] it is first offered to the buffer and the cache.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use edb_io_policy::PolicyRegistry;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::{IoConfig, IoMode};
use crate::error::RpcResult;
use crate::handle::Handle;
use crate::manager::{Interception, IoManager, Outcome};
use crate::stats::IoStats;
use crate::transport::{Resolution, ServerLog, ServerLogLevel, Transport};

/// Target used when re-emitting server-side log records.
pub const SERVER_LOG_TARGET: &str = "edb_io::server";

#[derive(Debug)]
pub struct Channel<T: Transport> {
    transport: T,
    manager: IoManager,
    default_mode: IoMode,
}

impl<T: Transport> Channel<T> {
    /// Channel owning `transport` and a fresh, disabled manager.
    ///
    /// The manager's cache, buffer and deferred ids are private to this
    /// channel. Every call to one server connection must go through the same
    /// channel; two channels sharing a transport would each hand out deferred
    /// ids from 1 and would not see each other's queued writes.
    pub fn new(transport: T, registry: Arc<PolicyRegistry>) -> Self {
        Self {
            transport,
            manager: IoManager::new(registry),
            default_mode: IoMode::default(),
        }
    }

    /// Channel configured from [`IoConfig`] (registry, traffic logging and
    /// the mode used by [`enable_default_io`](Self::enable_default_io)).
    pub fn from_config(transport: T, config: &IoConfig) -> anyhow::Result<Self> {
        Ok(Self {
            transport,
            manager: IoManager::from_config(config)?,
            default_mode: config.mode,
        })
    }

    /// Issue one call.
    pub fn call(&mut self, service: &str, method: &str, mut request: Value) -> RpcResult<Outcome> {
        if let Interception::Satisfied(outcome) =
            self.manager
                .intercept(service, method, &mut request, &self.transport)?
        {
            return Ok(outcome);
        }

        if let Err(e) = self.deliver_notifications() {
            self.manager.abandon();
            return Err(e);
        }

        self.manager.record_wire_call(service, method);
        let reply = match self.transport.call(service, method, &request) {
            Ok(reply) => reply,
            Err(e) => {
                self.manager.abandon();
                return Err(e);
            }
        };

        forward_server_logs(service, method, &reply.server_logs);
        self.manager.complete(reply.prefetch);
        Ok(Outcome::Response(reply.body))
    }

    /// Send owed notifications in queue order. Undelivered ones stay queued.
    fn deliver_notifications(&mut self) -> RpcResult<()> {
        let owed = self.manager.take_notifications();
        for (i, notification) in owed.iter().enumerate() {
            if let Err(e) = self.transport.notify(*notification) {
                self.manager.requeue_notifications(owed[i..].to_vec());
                return Err(e);
            }
        }
        Ok(())
    }

    /// Flush buffered writes now.
    pub fn flush(&mut self) -> RpcResult<Vec<Resolution>> {
        self.manager.flush(&self.transport)
    }

    /// Make `handle` follow the resolution of `deferred_id`.
    pub fn register_alias(&mut self, deferred_id: u64, handle: &Handle) -> bool {
        self.manager.register_alias(deferred_id, handle)
    }

    pub fn start(&mut self, mode: IoMode) -> RpcResult<()> {
        self.manager.start(mode)
    }

    pub fn end(&mut self) -> RpcResult<()> {
        self.manager.end(&self.transport)
    }

    /// Enable I/O management until the returned scope is dropped or finished.
    pub fn enable_io(&mut self, mode: IoMode) -> RpcResult<IoScope<'_, T>> {
        self.start(mode)?;
        Ok(IoScope {
            channel: self,
            finished: false,
        })
    }

    /// [`enable_io`](Self::enable_io) with the configured default mode.
    pub fn enable_default_io(&mut self) -> RpcResult<IoScope<'_, T>> {
        let mode = self.default_mode;
        self.enable_io(mode)
    }

    /// Run `f` with I/O management enabled, tearing down afterwards whatever
    /// `f` returns. An error from `f` takes precedence over a teardown error.
    pub fn with_io<R>(
        &mut self,
        mode: IoMode,
        f: impl FnOnce(&mut Self) -> RpcResult<R>,
    ) -> RpcResult<R> {
        let mut scope = self.enable_io(mode)?;
        let result = f(&mut *scope);
        let teardown = scope.finish();

        match (result, teardown) {
            (Ok(value), teardown) => teardown.map(|()| value),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown)) => {
                error!(error = %teardown, "I/O teardown failed after an earlier error");
                Err(e)
            }
        }
    }

    pub fn is_io_enabled(&self) -> bool {
        self.manager.is_enabled()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn manager(&self) -> &IoManager {
        &self.manager
    }

    pub fn stats(&self) -> IoStats {
        self.manager.stats()
    }
}

/// Re-emit server log records through `tracing`.
fn forward_server_logs(service: &str, method: &str, logs: &[ServerLog]) {
    for log in logs {
        let message = log.message.as_str();
        match log.level {
            ServerLogLevel::Fatal => {
                error!(target: SERVER_LOG_TARGET, service, method, fatal = true, "{message}")
            }
            ServerLogLevel::Error => {
                error!(target: SERVER_LOG_TARGET, service, method, "{message}")
            }
            ServerLogLevel::Warn => {
                warn!(target: SERVER_LOG_TARGET, service, method, "{message}")
            }
            ServerLogLevel::Info => {
                info!(target: SERVER_LOG_TARGET, service, method, "{message}")
            }
        }
    }
}

/// I/O management scope. Dropping it ends management and flushes the buffer;
/// a flush failure at that point can only be logged, use
/// [`finish`](Self::finish) to observe it.
#[must_use = "I/O management ends as soon as the scope is dropped"]
pub struct IoScope<'a, T: Transport> {
    channel: &'a mut Channel<T>,
    finished: bool,
}

impl<T: Transport> IoScope<'_, T> {
    /// End management now and report the final flush result.
    pub fn finish(mut self) -> RpcResult<()> {
        self.finished = true;
        self.channel.end()
    }
}

impl<T: Transport> Deref for IoScope<'_, T> {
    type Target = Channel<T>;

    fn deref(&self) -> &Channel<T> {
        self.channel
    }
}

impl<T: Transport> DerefMut for IoScope<'_, T> {
    fn deref_mut(&mut self) -> &mut Channel<T> {
        self.channel
    }
}

impl<T: Transport> Drop for IoScope<'_, T> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.channel.end() {
            error!(error = %e, "flush during I/O scope teardown failed");
        }
    }
}
