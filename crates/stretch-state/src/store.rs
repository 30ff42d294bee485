//! AgentRegistry — redb-backed persistence for build agent records.
//!
//! Every statement is scoped to one record (insert, point update, point
//! read) apart from the status scans used for counting and listing. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::lease::Lease;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe agent registry backed by redb.
#[derive(Clone)]
pub struct AgentRegistry {
    db: Arc<Database>,
}

impl AgentRegistry {
    /// Open (or create) a persistent registry at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "agent registry opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory registry (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory agent registry opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(AGENTS).map_err(map_err!(Table))?;
        txn.open_table(AGENT_NAMES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.open_table(LEASES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Agents ─────────────────────────────────────────────────────

    /// Insert a new `Provisioning` record named `{name_prefix}{id}`.
    ///
    /// The id is allocated from the registry counter in the same write
    /// transaction as the insert, so ids and names are never reused.
    pub fn create_agent(&self, name_prefix: &str, now: u64) -> StateResult<AgentRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            let mut names = txn.open_table(AGENT_NAMES).map_err(map_err!(Table))?;
            let mut agents = txn.open_table(AGENTS).map_err(map_err!(Table))?;

            let id = meta
                .get(NEXT_AGENT_ID)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(1);
            let vm_name = format!("{name_prefix}{id}");

            if names.get(vm_name.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::DuplicateName(vm_name));
            }

            record = AgentRecord::new(id, vm_name, now);
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            agents
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
            names
                .insert(record.vm_name.as_str(), id)
                .map_err(map_err!(Write))?;
            meta.insert(NEXT_AGENT_ID, id + 1)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = record.id, vm_name = %record.vm_name, "agent record created");
        Ok(record)
    }

    /// Overwrite an existing record.
    pub fn put_agent(&self, record: &AgentRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let names = txn.open_table(AGENT_NAMES).map_err(map_err!(Table))?;
            match names
                .get(record.vm_name.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
            {
                Some(id) if id == record.id => {}
                Some(_) => return Err(StateError::DuplicateName(record.vm_name.clone())),
                None => return Err(StateError::NotFound(record.vm_name.clone())),
            }

            let mut agents = txn.open_table(AGENTS).map_err(map_err!(Table))?;
            agents
                .insert(record.id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = record.id, vm_name = %record.vm_name, status = %record.status, "agent record stored");
        Ok(())
    }

    /// Get a record by id.
    pub fn get_agent(&self, id: AgentId) -> StateResult<Option<AgentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AGENTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: AgentRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Get a record by its vm name.
    pub fn get_agent_by_name(&self, vm_name: &str) -> StateResult<Option<AgentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let names = txn.open_table(AGENT_NAMES).map_err(map_err!(Table))?;
        let id = match names.get(vm_name).map_err(map_err!(Read))? {
            Some(guard) => guard.value(),
            None => return Ok(None),
        };
        let agents = txn.open_table(AGENTS).map_err(map_err!(Table))?;
        match agents.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: AgentRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Err(StateError::NotFound(format!("{vm_name} (id {id})"))),
        }
    }

    /// List every record, ordered by id.
    pub fn list_agents(&self) -> StateResult<Vec<AgentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AGENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: AgentRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// List records whose status is in `statuses`.
    pub fn list_by_status(&self, statuses: &[AgentStatus]) -> StateResult<Vec<AgentRecord>> {
        Ok(self
            .list_agents()?
            .into_iter()
            .filter(|record| statuses.contains(&record.status))
            .collect())
    }

    /// Count records with the given status.
    pub fn count_by_status(&self, status: AgentStatus) -> StateResult<u32> {
        Ok(self.list_by_status(&[status])?.len() as u32)
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Try to take the named lease for `ttl_secs`.
    ///
    /// Succeeds if the lease is free, expired, or already held by `holder`
    /// (which renews it). Returns `None` if someone else holds it.
    pub fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: u64,
        ttl_secs: u64,
    ) -> StateResult<Option<Lease>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let lease;
        {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let current: Option<Lease> = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };

            if let Some(current) = current
                && !current.available_to(holder, now)
            {
                debug!(lease = %name, holder = %current.holder, "lease held elsewhere");
                return Ok(None);
            }

            lease = Lease {
                name: name.to_string(),
                holder: holder.to_string(),
                acquired_at: now,
                expires_at: now + ttl_secs,
            };
            let value = serde_json::to_vec(&lease).map_err(map_err!(Serialize))?;
            table
                .insert(name, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(lease = %name, %holder, expires_at = lease.expires_at, "lease acquired");
        Ok(Some(lease))
    }

    /// Release the named lease if `holder` owns it. Returns true if released.
    pub fn release_lease(&self, name: &str, holder: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released;
        {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let owned = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => {
                    let current: Lease =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    current.holder == holder
                }
                None => false,
            };
            if owned {
                table.remove(name).map_err(map_err!(Write))?;
            }
            released = owned;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(lease = %name, %holder, released, "lease released");
        Ok(released)
    }

    /// Current holder of the named lease, if any.
    pub fn get_lease(&self, name: &str) -> StateResult<Option<Lease>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LEASES).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let lease: Lease =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(lease))
            }
            None => Ok(None),
        }
    }
}
