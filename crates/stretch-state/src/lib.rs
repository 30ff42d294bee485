//! stretch-state — durable agent registry for the Stretch pool manager.
//!
//! Backed by [redb](https://docs.rs/redb), holds one `AgentRecord` per
//! build agent ever created plus the lease used to keep reconciliation
//! cycles from overlapping.
//!
//! # Architecture
//!
//! Records are JSON-serialized into redb's `&[u8]` value columns, keyed by
//! a surrogate id allocated from a counter in the same write transaction as
//! the insert. A second table indexes vm names so lookups by name are a
//! single point read.
//!
//! The `AgentRegistry` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`).

pub mod error;
pub mod lease;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use lease::Lease;
pub use store::AgentRegistry;
pub use types::*;
