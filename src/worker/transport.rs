//! How a worker talks to the coordinator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::timeout;

use crate::api::routes::{
    ClaimResponse, FinalRequest, FinalResponse, PartialRequest, RegisterRequest, RegisterResponse,
    RotateResponse, WorkResponse,
};
use crate::api::CALLER_KEY_HEADER;
use crate::dispatch::Dispatcher;
use crate::error::TransportError;
use crate::jobs::{ClaimedJob, JobId, Outcome};

/// Worker-side view of the dispatch operations, authenticated as one worker.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn claim(&self) -> Result<Option<ClaimedJob>, TransportError>;

    async fn heartbeat(&self, job_id: JobId) -> Result<(), TransportError>;

    async fn submit_partial(&self, job_id: JobId, chunk: &str) -> Result<(), TransportError>;

    /// Settle the job; returns the next job claimed on the worker's behalf.
    async fn submit_final(
        &self,
        job_id: JobId,
        chunk: &str,
        outcome: Outcome,
    ) -> Result<Option<ClaimedJob>, TransportError>;

    /// Block until work exists or `wait` elapses. Returns whether work exists.
    async fn wait_for_work(&self, wait: Duration) -> Result<bool, TransportError>;
}

// ── In-process ──────────────────────────────────────────────────────────

/// Calls a `Dispatcher` in the same process.
pub struct LocalTransport {
    dispatcher: Arc<Dispatcher>,
    api_key: SecretString,
}

impl LocalTransport {
    pub fn new(dispatcher: Arc<Dispatcher>, api_key: SecretString) -> Self {
        Self {
            dispatcher,
            api_key,
        }
    }
}

#[async_trait]
impl WorkerTransport for LocalTransport {
    async fn claim(&self) -> Result<Option<ClaimedJob>, TransportError> {
        Ok(self.dispatcher.claim(&self.api_key).await?)
    }

    async fn heartbeat(&self, job_id: JobId) -> Result<(), TransportError> {
        Ok(self.dispatcher.heartbeat(&self.api_key, job_id).await?)
    }

    async fn submit_partial(&self, job_id: JobId, chunk: &str) -> Result<(), TransportError> {
        Ok(self
            .dispatcher
            .submit_partial(&self.api_key, job_id, chunk)
            .await?)
    }

    async fn submit_final(
        &self,
        job_id: JobId,
        chunk: &str,
        outcome: Outcome,
    ) -> Result<Option<ClaimedJob>, TransportError> {
        Ok(self
            .dispatcher
            .submit_final(&self.api_key, job_id, chunk, outcome)
            .await?)
    }

    async fn wait_for_work(&self, wait: Duration) -> Result<bool, TransportError> {
        Ok(timeout(wait, self.dispatcher.wait_for_work()).await.is_ok())
    }
}

// ── HTTP ────────────────────────────────────────────────────────────────

/// Calls the coordinator's REST API.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Register a new worker and return a transport authenticated as it.
    pub async fn register(
        base_url: impl Into<String>,
        caller_key: &str,
        display_name: Option<String>,
    ) -> Result<Self, TransportError> {
        let mut transport = Self::new(base_url, SecretString::from(String::new()));
        let endpoint = "/api/workers";
        let request = transport
            .client
            .post(transport.url(endpoint))
            .header(CALLER_KEY_HEADER, caller_key)
            .json(&RegisterRequest { display_name });
        let registered: RegisterResponse = send(request, endpoint).await?;
        transport.api_key = SecretString::from(registered.api_key);
        tracing::info!(worker_id = %registered.worker_id, "Registered with coordinator");
        Ok(transport)
    }

    /// Swap this transport's secret for a fresh one.
    pub async fn rotate(&mut self) -> Result<(), TransportError> {
        let rotated: RotateResponse = self.post("/api/workers/rotate", &()).await?;
        self.api_key = SecretString::from(rotated.api_key);
        Ok(())
    }

    pub fn api_key(&self) -> &SecretString {
        &self.api_key
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{endpoint}", self.base_url)
    }

    async fn post<B, T>(&self, endpoint: &str, body: &B) -> Result<T, TransportError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let request = self
            .client
            .post(self.url(endpoint))
            .bearer_auth(self.api_key.expose_secret())
            .json(body);
        send(request, endpoint).await
    }
}

/// Send `request`, turning non-2xx responses into `Rejected`.
async fn send<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    endpoint: &str,
) -> Result<T, TransportError> {
    let response = request
        .send()
        .await
        .map_err(|e| TransportError::RequestFailed {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        let message = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|body| body.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or_else(|| status.to_string());
        return Err(TransportError::Rejected {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            message,
        });
    }

    response
        .json::<T>()
        .await
        .map_err(|e| TransportError::InvalidResponse {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
}

#[async_trait]
impl WorkerTransport for HttpTransport {
    async fn claim(&self) -> Result<Option<ClaimedJob>, TransportError> {
        let claimed: ClaimResponse = self.post("/api/jobs/claim", &()).await?;
        Ok(claimed.job)
    }

    async fn heartbeat(&self, job_id: JobId) -> Result<(), TransportError> {
        let _: serde_json::Value = self
            .post(&format!("/api/jobs/{job_id}/heartbeat"), &())
            .await?;
        Ok(())
    }

    async fn submit_partial(&self, job_id: JobId, chunk: &str) -> Result<(), TransportError> {
        let body = PartialRequest {
            chunk: chunk.to_string(),
        };
        let _: serde_json::Value = self
            .post(&format!("/api/jobs/{job_id}/partial"), &body)
            .await?;
        Ok(())
    }

    async fn submit_final(
        &self,
        job_id: JobId,
        chunk: &str,
        outcome: Outcome,
    ) -> Result<Option<ClaimedJob>, TransportError> {
        let body = FinalRequest {
            chunk: chunk.to_string(),
            outcome,
        };
        let finished: FinalResponse = self
            .post(&format!("/api/jobs/{job_id}/final"), &body)
            .await?;
        Ok(finished.next)
    }

    async fn wait_for_work(&self, wait: Duration) -> Result<bool, TransportError> {
        let endpoint = "/api/work/wait";
        let request = self
            .client
            .get(self.url(endpoint))
            .query(&[("timeout_ms", wait.as_millis() as u64)]);
        let work: WorkResponse = send(request, endpoint).await?;
        Ok(work.work)
    }
}
