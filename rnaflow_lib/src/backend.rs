//! Round trips against the analysis backend.
//!
//! Everything the watchers need from the backend goes through [`JobBackend`],
//! so tests can swap the HTTP implementation for a scripted one.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use rnaflow_data::{artifacts::GSEA_CORE_GENES, Job, PathwaySelection};
use tokio::time;
use tracing::{debug, instrument};

use crate::{action_runner::ActionRequest, config::ClientConfig, error::ClientError};

#[async_trait]
pub trait JobBackend: Send + Sync {
    /// one round trip for the current job record
    async fn fetch_job(&self, job_id: &str) -> Result<Job, ClientError>;

    /// asks the backend to compute a derived artifact in place
    /// Ok means the request was accepted and scheduled, not that it finished
    async fn request_action(&self, job_id: &str, request: &ActionRequest)
        -> Result<(), ClientError>;

    /// raw bytes of one artifact
    async fn fetch_output(&self, job_id: &str, name: &str) -> Result<Vec<u8>, ClientError>;

    /// the job's run log as text
    async fn fetch_log(&self, job_id: &str) -> Result<String, ClientError>;

    /// zip archive of every output, the status and the log of a job
    async fn fetch_bundle(&self, job_id: &str) -> Result<Vec<u8>, ClientError>;
}

pub type SharedBackend = Arc<dyn JobBackend>;

/// fetches a job record, giving up after `limit`
pub async fn fetch_within(
    backend: &dyn JobBackend,
    job_id: &str,
    limit: Duration,
) -> Result<Job, ClientError> {
    match time::timeout(limit, backend.fetch_job(job_id)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(ClientError::Timeout(limit.as_millis() as u64)),
    }
}

/// downloads and decodes the GSEA core-gene table of a job
/// the artifact has to be listed in `job` already
pub async fn load_core_gene_table(
    backend: &dyn JobBackend,
    job_id: &str,
    job: &Job,
) -> Result<Vec<PathwaySelection>, ClientError> {
    if !job.has_output(GSEA_CORE_GENES) {
        return Err(ClientError::Precondition {
            job_id: job_id.to_string(),
            missing: vec![GSEA_CORE_GENES.to_string()],
        });
    }
    let bytes = backend.fetch_output(job_id, GSEA_CORE_GENES).await?;
    let rows: Vec<PathwaySelection> = serde_json::from_slice(&bytes)?;
    Ok(rows)
}

/// [`JobBackend`] over the backend's HTTP API
pub struct HttpBackend {
    client: Client,
    api_url: Url,
}

impl HttpBackend {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let api_url = Url::parse(config.api_url.trim())
            .map_err(|e| ClientError::Config(format!("invalid api_url: {}", e)))?;
        if api_url.cannot_be_a_base() {
            return Err(ClientError::Config(format!(
                "api_url cannot be used as a base: {}",
                api_url
            )));
        }
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self { client, api_url })
    }

    /// `/api/jobs/{job_id}/{rest..}` with every segment percent-encoded
    fn job_url(&self, job_id: &str, rest: &[&str]) -> Result<Url, ClientError> {
        if job_id.trim().is_empty() {
            return Err(ClientError::EmptyJobId);
        }
        let mut url = self.api_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ClientError::Config("api_url cannot be a base".to_string()))?;
            segments.pop_if_empty().extend(["api", "jobs", job_id.trim()]);
            segments.extend(rest);
        }
        Ok(url)
    }

    async fn get_bytes(&self, url: Url) -> Result<Vec<u8>, ClientError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ClientError::from_response(response).await);
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl JobBackend for HttpBackend {
    #[instrument(skip(self))]
    async fn fetch_job(&self, job_id: &str) -> Result<Job, ClientError> {
        let url = self.job_url(job_id, &[])?;
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ClientError::from_response(response).await);
        }
        let bytes = response.bytes().await?;
        let job: Job = serde_json::from_slice(&bytes)?;
        debug!(state = %job.state, outputs = job.outputs.len(), "fetched job");
        Ok(job)
    }

    #[instrument(skip(self, request), fields(action = request.action().key()))]
    async fn request_action(
        &self,
        job_id: &str,
        request: &ActionRequest,
    ) -> Result<(), ClientError> {
        let url = self.job_url(job_id, &[request.action().endpoint()])?;
        let response = self
            .client
            .post(url)
            .form(&request.form_fields())
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => {
                debug!("action accepted");
                Ok(())
            }
            StatusCode::CONFLICT => match ClientError::from_response(response).await {
                ClientError::Http { message, .. } => Err(ClientError::ActionBusy {
                    job_id: job_id.to_string(),
                    action: request.action(),
                    message,
                }),
                other => Err(other),
            },
            _ => Err(ClientError::from_response(response).await),
        }
    }

    #[instrument(skip(self))]
    async fn fetch_output(&self, job_id: &str, name: &str) -> Result<Vec<u8>, ClientError> {
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(ClientError::InvalidRequest(format!(
                "invalid artifact name '{}'",
                name
            )));
        }
        self.get_bytes(self.job_url(job_id, &["outputs", name])?).await
    }

    #[instrument(skip(self))]
    async fn fetch_log(&self, job_id: &str) -> Result<String, ClientError> {
        let bytes = self.get_bytes(self.job_url(job_id, &["log"])?).await?;
        // R and conda write whatever encoding they like
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    #[instrument(skip(self))]
    async fn fetch_bundle(&self, job_id: &str) -> Result<Vec<u8>, ClientError> {
        let bytes = self.get_bytes(self.job_url(job_id, &["download"])?).await?;
        debug!(size = bytes.len(), "fetched output bundle");
        Ok(bytes)
    }
}
