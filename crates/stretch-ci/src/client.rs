//! Azure Pipelines agent-pool client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use stretch_core::PipelinesConfig;

use crate::error::{CiError, CiResult};
use crate::types::{DisableAgentBody, JobRequest, ListResponse, PoolAgent};

const LIST_API_VERSION: &str = "5.1-preview.1";
const PATCH_API_VERSION: &str = "5.0";

/// Operations the reconciler needs from the CI system.
#[async_trait]
pub trait AgentPool: Send + Sync {
    /// Every agent registered in the pool, with request history.
    async fn list_agents(&self) -> CiResult<Vec<PoolAgent>>;

    /// Stop the CI system from assigning new jobs to the agent.
    async fn disable_agent(&self, agent_id: u32) -> CiResult<()>;

    /// Remove the agent's registration. Removing an unknown agent succeeds.
    async fn delete_agent(&self, agent_id: u32) -> CiResult<()>;

    /// Job requests currently in the pool's queue.
    async fn list_job_requests(&self) -> CiResult<Vec<JobRequest>>;

    /// Number of queued jobs that no agent has been reserved for.
    async fn queued_job_count(&self) -> CiResult<u32> {
        let requests = self.list_job_requests().await?;
        Ok(requests.iter().filter(|r| r.is_waiting()).count() as u32)
    }
}

/// REST client for one Azure Pipelines agent pool.
pub struct PipelinesClient {
    client: Client,
    base_url: String,
    pool_id: u32,
    token: String,
}

impl PipelinesClient {
    pub fn new(config: &PipelinesConfig) -> CiResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            pool_id: config.pool_id,
            token: config.token.clone(),
        })
    }

    fn pool_url(&self, path: &str) -> String {
        format!(
            "{}/_apis/distributedtask/pools/{}/{}",
            self.base_url, self.pool_id, path
        )
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .basic_auth("", Some(&self.token))
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn get_list<T: DeserializeOwned>(&self, url: &str) -> CiResult<Vec<T>> {
        let resp = self.request(Method::GET, url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CiError::Status {
                method: "GET",
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let body: ListResponse<T> = resp
            .json()
            .await
            .map_err(|e| CiError::Decode(e.to_string()))?;
        Ok(body.value)
    }
}

#[async_trait]
impl AgentPool for PipelinesClient {
    async fn list_agents(&self) -> CiResult<Vec<PoolAgent>> {
        let url = format!(
            "{}?includeAssignedRequest=true&includeLastCompletedRequest=true&api-version={LIST_API_VERSION}",
            self.pool_url("agents")
        );
        debug!(pool_id = self.pool_id, "retrieving agent data");
        self.get_list(&url).await
    }

    async fn disable_agent(&self, agent_id: u32) -> CiResult<()> {
        let url = format!(
            "{}?api-version={PATCH_API_VERSION}",
            self.pool_url(&format!("agents/{agent_id}"))
        );
        info!(agent_id, "disabling agent");

        let resp = self
            .request(Method::PATCH, &url)
            .json(&DisableAgentBody {
                enabled: false,
                id: agent_id,
            })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(CiError::Status {
                method: "PATCH",
                url,
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn delete_agent(&self, agent_id: u32) -> CiResult<()> {
        let url = format!(
            "{}?api-version={LIST_API_VERSION}",
            self.pool_url(&format!("agents/{agent_id}"))
        );
        info!(agent_id, "removing agent registration");

        let resp = self.request(Method::DELETE, &url).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => {
                debug!(agent_id, "agent registration already gone");
                Ok(())
            }
            status if status.is_success() => Ok(()),
            status => Err(CiError::Status {
                method: "DELETE",
                url,
                status: status.as_u16(),
            }),
        }
    }

    async fn list_job_requests(&self) -> CiResult<Vec<JobRequest>> {
        let url = format!(
            "{}?api-version={LIST_API_VERSION}",
            self.pool_url("jobrequests")
        );
        debug!(pool_id = self.pool_id, "retrieving queued job requests");
        self.get_list(&url).await
    }
}
