//! Pool census — classifies the CI system's live agent listing.
//!
//! ```text
//! Ready     online  ∧ ¬assigned ∧ ¬completed
//! Building          assigned  ∧ ¬completed
//! Offline   offline ∧             completed
//! ```
//!
//! The rules are mutually exclusive; an entry matching none of them is left
//! out of all three lists. That includes an agent that is offline without
//! ever completing a job: a freshly created VM reports offline for a short
//! while before its agent comes online, and it must not be deprovisioned.
//! It also includes an idle agent that has already completed work.

use std::collections::HashSet;

use tracing::info;

use stretch_ci::PoolAgent;
use stretch_state::ExternalAgentId;

/// An agent running a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildingAgent {
    pub name: String,
    pub id: ExternalAgentId,
    /// Whether the CI system will still assign new jobs to it.
    pub enabled: bool,
}

/// An agent that has done its work and gone offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineAgent {
    pub name: String,
    pub id: ExternalAgentId,
}

/// Which census list an agent falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentClass {
    Ready,
    Building,
    Offline,
}

/// Classify a single agent, or `None` if no rule matches.
pub fn classify(agent: &PoolAgent) -> Option<AgentClass> {
    let assigned = agent.has_assigned_request();
    let completed = agent.has_completed_request();

    match (agent.is_online(), assigned, completed) {
        (true, false, false) => Some(AgentClass::Ready),
        (_, true, false) => Some(AgentClass::Building),
        (false, _, true) => Some(AgentClass::Offline),
        _ => None,
    }
}

/// One cycle's classified snapshot of the pool.
#[derive(Debug, Clone, Default)]
pub struct Census {
    pub ready: Vec<String>,
    pub building: Vec<BuildingAgent>,
    pub offline: Vec<OfflineAgent>,
    /// Every name in the listing, classified or not.
    listed: HashSet<String>,
}

impl Census {
    pub fn from_agents(agents: &[PoolAgent]) -> Self {
        let mut census = Census::default();
        for agent in agents {
            census.listed.insert(agent.name.clone());
            match classify(agent) {
                Some(AgentClass::Ready) => census.ready.push(agent.name.clone()),
                Some(AgentClass::Building) => census.building.push(BuildingAgent {
                    name: agent.name.clone(),
                    id: agent.id,
                    enabled: agent.enabled,
                }),
                Some(AgentClass::Offline) => census.offline.push(OfflineAgent {
                    name: agent.name.clone(),
                    id: agent.id,
                }),
                None => {}
            }
        }
        census
    }

    /// At least one agent can take or is running a job.
    ///
    /// Cleanup of deprovisioned agents is only safe when this holds: a
    /// census with no usable agents may be an API anomaly rather than an
    /// empty pool.
    pub fn has_usable_agents(&self) -> bool {
        self.ready.len() + self.building.len() > 0
    }

    /// Whether the CI listing contained this name at all.
    pub fn is_listed(&self, name: &str) -> bool {
        self.listed.contains(name)
    }

    pub fn log(&self) {
        info!(count = self.ready.len(), agents = ?self.ready, "agents ready");
        let building: Vec<&str> = self.building.iter().map(|a| a.name.as_str()).collect();
        info!(count = building.len(), agents = ?building, "agents building");
        let offline: Vec<&str> = self.offline.iter().map(|a| a.name.as_str()).collect();
        info!(count = offline.len(), agents = ?offline, "agents offline");
    }
}
