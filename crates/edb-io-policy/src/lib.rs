//! Per-method I/O policy registry for the EDB RPC client.
//!
//! Every remote method carries a small set of fixed facts (is it a read, may
//! its response be cached, may it be buffered, does it return a new object
//! handle, does it invalidate cached reads). Those facts come from the service
//! schema and are looked up here by `(service, method)`.
//!
//! ```
//! use edb_io_policy::PolicyRegistry;
//!
//! let registry = PolicyRegistry::bundled().unwrap();
//! let policy = registry.lookup_or_conservative("ansys.api.edb.v1.RectangleService", "Create");
//! assert!(policy.can_buffer && policy.returns_handle);
//! ```

pub mod error;
pub mod policy;
pub mod registry;

pub use error::{PolicyError, PolicyResult};
pub use policy::{InvalidationTarget, IoFlag, MethodPolicy};
pub use registry::{MethodSpec, PolicyRegistry, PolicySchema, DEFAULT_SCHEMA_YAML};
