//! redb table definitions for the agent registry.
//!
//! Agent records are JSON-serialized into `&[u8]` value columns and keyed by
//! their numeric id. `AGENT_NAMES` is the unique index from vm name to id.

use redb::TableDefinition;

/// Agent records keyed by `id`.
pub const AGENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("agents");

/// Unique vm name index: `vm_name` → `id`.
pub const AGENT_NAMES: TableDefinition<&str, u64> = TableDefinition::new("agent_names");

/// Counters keyed by name (`next_agent_id`).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Cycle leases keyed by lease name.
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");

pub const NEXT_AGENT_ID: &str = "next_agent_id";
