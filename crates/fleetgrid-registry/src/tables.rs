//! redb table definitions for the registry.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Agents keyed by `{agent_id}`.
pub const AGENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("agents");

/// Machines keyed by `{machine_id}`.
pub const MACHINES: TableDefinition<&str, &[u8]> = TableDefinition::new("machines");

/// Queue depth keyed by `{queue_name}`.
pub const QUEUES: TableDefinition<&str, &[u8]> = TableDefinition::new("queues");

/// Last job activity keyed by `{agent_id}:{queue_name}`.
pub const ACTIVITY: TableDefinition<&str, &[u8]> = TableDefinition::new("activity");

/// In-flight work keyed by `{agent_id}:{job_id}`.
pub const WORK: TableDefinition<&str, &[u8]> = TableDefinition::new("work");

/// Tick leases keyed by `{cluster}`.
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");
