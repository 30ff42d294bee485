//! Wire types of the Azure Pipelines distributed-task API.

use serde::{Deserialize, Serialize};

/// Envelope the API wraps every collection in.
#[derive(Debug, Clone, Deserialize)]
pub struct ListResponse<T> {
    #[serde(default)]
    pub count: Option<u32>,
    pub value: Vec<T>,
}

/// Connection status the CI system reports for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentConnectivity {
    Online,
    Offline,
}

/// One agent registered in the pool.
///
/// `assignedRequest` and `lastCompletedRequest` are only inspected for
/// presence, so they are kept as raw JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolAgent {
    pub id: u32,
    pub name: String,
    pub status: AgentConnectivity,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_request: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_request: Option<serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

impl PoolAgent {
    pub fn is_online(&self) -> bool {
        self.status == AgentConnectivity::Online
    }

    /// A job is currently assigned to this agent.
    pub fn has_assigned_request(&self) -> bool {
        matches!(&self.assigned_request, Some(v) if !v.is_null())
    }

    /// The agent has finished at least one job.
    pub fn has_completed_request(&self) -> bool {
        matches!(&self.last_completed_request, Some(v) if !v.is_null())
    }
}

/// A job request in the pool's queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub request_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_agent: Option<serde_json::Value>,
}

impl JobRequest {
    /// No agent has been reserved for this job yet.
    pub fn is_waiting(&self) -> bool {
        !matches!(&self.reserved_agent, Some(v) if !v.is_null())
    }
}

/// Body of the agent PATCH used to stop new job assignment.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct DisableAgentBody {
    pub enabled: bool,
    pub id: u32,
}
