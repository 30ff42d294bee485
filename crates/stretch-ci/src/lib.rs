//! stretch-ci — client for the CI system's agent-pool API.
//!
//! The reconciler talks to the CI system through the [`AgentPool`] trait;
//! [`PipelinesClient`] implements it against the Azure Pipelines
//! distributed-task REST API.
//!
//! # Endpoints
//!
//! ```text
//! GET    {url}/_apis/distributedtask/pools/{pool}/agents        list agents
//! PATCH  {url}/_apis/distributedtask/pools/{pool}/agents/{id}   disable agent
//! DELETE {url}/_apis/distributedtask/pools/{pool}/agents/{id}   remove agent
//! GET    {url}/_apis/distributedtask/pools/{pool}/jobrequests   job queue
//! ```

pub mod client;
pub mod error;
pub mod types;

pub use client::{AgentPool, PipelinesClient};
pub use error::{CiError, CiResult};
pub use types::{AgentConnectivity, JobRequest, PoolAgent};
