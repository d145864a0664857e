// HTTP client for the remote agent service (grader-agentd)
use grader_common::protocol::{
    AgentInfo, DirectoryHashesResponse, NewJobRequest, UpdateAliasesRequest, UpdateDirectoryRequest,
};
use grader_common::sync::DirectoryHashes;
use grader_common::types::RawResult;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Control calls only; job requests are bounded by the manager
const CONTROL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AgentError {
    /// The request never reached the agent
    #[error("agent {endpoint} is unreachable: {source}")]
    Unreachable {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("agent {endpoint} answered {status}: {body}")]
    Rejected {
        endpoint: String,
        status: StatusCode,
        body: String,
    },
    #[error("connection to agent {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
}

impl AgentError {
    /// Nothing was sent, so the request can safely go to another agent
    pub fn is_unreachable(&self) -> bool {
        matches!(self, AgentError::Unreachable { .. })
    }
}

#[derive(Debug, Clone)]
pub struct AgentClient {
    endpoint: String,
    client: Client,
}

impl AgentClient {
    pub fn new(endpoint: &str) -> Self {
        // Fresh connection per call: a stopped agent reads as unreachable
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(0)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn send_error(&self, source: reqwest::Error) -> AgentError {
        if source.is_connect() {
            AgentError::Unreachable {
                endpoint: self.endpoint.clone(),
                source,
            }
        } else {
            AgentError::Transport {
                endpoint: self.endpoint.clone(),
                source,
            }
        }
    }

    async fn check(&self, response: Response) -> Result<Response, AgentError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(AgentError::Rejected {
            endpoint: self.endpoint.clone(),
            status,
            body,
        })
    }

    async fn decode<T: DeserializeOwned>(&self, response: Response) -> Result<T, AgentError> {
        let response = self.check(response).await?;
        response.json::<T>().await.map_err(|source| AgentError::Transport {
            endpoint: self.endpoint.clone(),
            source,
        })
    }

    pub async fn health(&self) -> Result<(), AgentError> {
        let response = self
            .client
            .get(self.url("/health"))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        self.check(response).await.map(|_| ())
    }

    pub async fn info(&self) -> Result<AgentInfo, AgentError> {
        let response = self
            .client
            .get(self.url("/info"))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        self.decode(response).await
    }

    pub async fn new_job(&self, request: &NewJobRequest) -> Result<RawResult, AgentError> {
        debug!(endpoint = %self.endpoint, job_id = %request.job_id, "Dispatching job");
        let response = self
            .client
            .post(self.url("/jobs"))
            .json(request)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        self.decode(response).await
    }

    pub async fn directory_hashes(&self) -> Result<Option<DirectoryHashes>, AgentError> {
        let response = self
            .client
            .get(self.url("/directory"))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        let body: DirectoryHashesResponse = self.decode(response).await?;
        Ok(body.hashes)
    }

    pub async fn update_directory(&self, request: &UpdateDirectoryRequest) -> Result<(), AgentError> {
        let response = self
            .client
            .post(self.url("/directory"))
            .json(request)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        self.check(response).await.map(|_| ())
    }

    pub async fn update_aliases(&self, aliases: &BTreeMap<String, String>) -> Result<(), AgentError> {
        let request = UpdateAliasesRequest {
            aliases: aliases.clone(),
        };
        let response = self
            .client
            .put(self.url("/aliases"))
            .json(&request)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        self.check(response).await.map(|_| ())
    }
}
