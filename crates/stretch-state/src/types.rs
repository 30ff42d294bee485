//! Domain types for the agent registry.
//!
//! An `AgentRecord` is created once per build agent and never deleted; its
//! `status` only moves forward through the lifecycle:
//!
//! ```text
//! Provisioning ──► Ready ──► Building ──► Deprovisioning ──► Done
//!      │             │                        ▲
//!      └─────────────┴────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Surrogate key of an agent record.
pub type AgentId = u64;

/// Numeric id the CI system assigns to a registered agent.
pub type ExternalAgentId = u32;

// ── Status ────────────────────────────────────────────────────────

/// Lifecycle status of a build agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Provisioning,
    Ready,
    Building,
    Deprovisioning,
    Done,
}

impl AgentStatus {
    pub const ALL: [AgentStatus; 5] = [
        AgentStatus::Provisioning,
        AgentStatus::Ready,
        AgentStatus::Building,
        AgentStatus::Deprovisioning,
        AgentStatus::Done,
    ];

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Re-entering the current status is allowed (and is a no-op) for every
    /// status except `Provisioning`, which can only be entered on insert.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, next),
            (Provisioning, Ready | Building | Deprovisioning)
                | (Ready, Ready | Building | Deprovisioning)
                | (Building, Building | Deprovisioning)
                | (Deprovisioning, Deprovisioning | Done)
                | (Done, Done)
        )
    }

    /// Validate a transition, returning the target status.
    pub fn transition(self, next: AgentStatus) -> StateResult<AgentStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(StateError::InvalidTransition { from: self, to: next })
        }
    }

    /// Statuses of an agent whose VM is (or is about to be) in service.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            AgentStatus::Provisioning | AgentStatus::Ready | AgentStatus::Building
        )
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Provisioning => "provisioning",
            AgentStatus::Ready => "ready",
            AgentStatus::Building => "building",
            AgentStatus::Deprovisioning => "deprovisioning",
            AgentStatus::Done => "done",
        };
        f.write_str(s)
    }
}

// ── Record ────────────────────────────────────────────────────────

/// Cloud resource ids belonging to one agent VM.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentResources {
    /// VM resource id, recorded when the agent is created.
    pub vm_id: Option<String>,
    /// The rest are captured on entering `Deprovisioning`, while the VM
    /// can still be inspected.
    pub nic_id: Option<String>,
    pub public_ip_id: Option<String>,
    pub disk_id: Option<String>,
}

/// Unix timestamps (seconds) of each lifecycle transition. Write-once.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentTimestamps {
    pub created: u64,
    pub ready: Option<u64>,
    pub building: Option<u64>,
    pub deprovisioning: Option<u64>,
    pub deprovisioned: Option<u64>,
}

/// One build agent, from creation to final cleanup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentRecord {
    pub id: AgentId,
    pub vm_name: String,
    pub status: AgentStatus,
    pub external_agent_id: Option<ExternalAgentId>,
    pub resources: AgentResources,
    pub timestamps: AgentTimestamps,
}

impl AgentRecord {
    /// A fresh record in `Provisioning`.
    pub fn new(id: AgentId, vm_name: String, now: u64) -> Self {
        Self {
            id,
            vm_name,
            status: AgentStatus::Provisioning,
            external_agent_id: None,
            resources: AgentResources::default(),
            timestamps: AgentTimestamps {
                created: now,
                ..Default::default()
            },
        }
    }

    /// The agent registered online and is idle.
    pub fn mark_ready(&mut self, now: u64) -> StateResult<()> {
        self.advance(AgentStatus::Ready, now)
    }

    /// The agent picked up a job.
    pub fn mark_building(&mut self, agent_id: ExternalAgentId, now: u64) -> StateResult<()> {
        self.advance(AgentStatus::Building, now)?;
        self.external_agent_id = Some(agent_id);
        Ok(())
    }

    /// VM deletion is about to be requested. `captured` holds the dependent
    /// resource ids read from the live VM.
    pub fn mark_deprovisioning(
        &mut self,
        agent_id: Option<ExternalAgentId>,
        captured: AgentResources,
        now: u64,
    ) -> StateResult<()> {
        let entering = self.status != AgentStatus::Deprovisioning;
        self.advance(AgentStatus::Deprovisioning, now)?;
        if entering {
            if agent_id.is_some() {
                self.external_agent_id = agent_id;
            }
            if captured.vm_id.is_some() {
                self.resources.vm_id = captured.vm_id;
            }
            self.resources.nic_id = captured.nic_id;
            self.resources.public_ip_id = captured.public_ip_id;
            self.resources.disk_id = captured.disk_id;
        }
        Ok(())
    }

    /// All infrastructure and the CI registration are gone.
    pub fn mark_done(&mut self, now: u64) -> StateResult<()> {
        self.advance(AgentStatus::Done, now)
    }

    fn advance(&mut self, to: AgentStatus, now: u64) -> StateResult<()> {
        self.status = self.status.transition(to)?;
        let slot = match to {
            AgentStatus::Provisioning => return Ok(()),
            AgentStatus::Ready => &mut self.timestamps.ready,
            AgentStatus::Building => &mut self.timestamps.building,
            AgentStatus::Deprovisioning => &mut self.timestamps.deprovisioning,
            AgentStatus::Done => &mut self.timestamps.deprovisioned,
        };
        slot.get_or_insert(now);
        Ok(())
    }
}
