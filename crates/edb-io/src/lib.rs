//! Request optimization layer for the EDB RPC client.
//!
//! Sits between generated accessors and the transport and reduces round trips
//! in two ways:
//!
//! - **Read cache**: cacheable reads are answered from entries the server
//!   volunteers alongside other replies. A miss is never memoized.
//! - **Write buffer**: bufferable writes are queued and sent as one ordered
//!   batch when a read (or any unbufferable call) needs to observe them. A
//!   buffered write that creates an object returns a deferred [`Handle`] the
//!   application can keep using; it is resolved in place on flush.
//!
//! ```
//! use std::sync::Arc;
//! use edb_io::{Channel, IoMode, Outcome};
//! use edb_io::fake::FakeTransport;
//! use edb_io_policy::PolicyRegistry;
//! use serde_json::json;
//!
//! let registry = Arc::new(PolicyRegistry::bundled().unwrap());
//! let mut channel = Channel::new(FakeTransport::new(), registry);
//!
//! channel
//!     .with_io(IoMode::READ_AND_WRITE, |ch| {
//!         let rect = ch
//!             .call("ansys.api.edb.v1.RectangleService", "Create", json!({"width": 2.0}))?
//!             .handle()
//!             .unwrap();
//!         assert!(rect.is_deferred());
//!
//!         ch.call(
//!             "ansys.api.edb.v1.PrimitiveService",
//!             "GetIsNegative",
//!             json!({"target": rect.to_value()}),
//!         )?;
//!         assert!(!rect.is_deferred());
//!         Ok(())
//!     })
//!     .unwrap();
//! ```
//!
//! ## Configuration
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `EDB_IO_MODE` | Default mode, e.g. `read,write,no_cache_invalidation` |
//! | `EDB_IO_LOG_TRAFFIC` | Count calls that reach the wire |
//! | `EDB_IO_POLICY_PATH` | Policy schema to load instead of the bundled one |

pub mod buffer;
pub mod cache;
pub mod canonical;
pub mod channel;
pub mod config;
pub mod error;
pub mod handle;
pub mod manager;
pub mod notify;
pub mod stats;
pub mod tracker;
pub mod transport;

mod block;

pub use transport::fake;

pub use buffer::{FlushContext, WriteBuffer};
pub use cache::{Freshness, ResponseCache};
pub use canonical::CacheKey;
pub use channel::{Channel, IoScope, SERVER_LOG_TARGET};
pub use config::{IoConfig, IoMode, ModeParseError};
pub use error::{RpcError, RpcResult};
pub use handle::{Handle, HandleRef};
pub use manager::{Interception, IoManager, Outcome};
pub use stats::IoStats;
pub use tracker::ActiveHandles;
pub use transport::{
    BatchEntry, BatchReply, CachedCall, Notification, PrefetchBundle, Reply, Resolution,
    ServerLog, ServerLogLevel, Transport,
};
