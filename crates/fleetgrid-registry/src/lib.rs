//! fleetgrid-registry: authoritative store of live agents.
//!
//! Defines the [`Registry`] contract the control loop consumes and an
//! embedded implementation, [`RegistryStore`], backed by
//! [redb](https://docs.rs/redb).
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{agent_id}:{queue}`, `{agent_id}:{job_id}`) allow
//! prefix scans for per-agent records.
//!
//! Every mutating operation runs in a single redb write transaction, and
//! redb serializes write transactions, so conditional operations
//! (`register_agent`, `try_acquire_lease`) are atomic across concurrent
//! ticks sharing one database.

pub mod error;
pub mod registry;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{RegistryError, RegistryResult};
pub use registry::Registry;
pub use store::RegistryStore;
pub use types::*;
