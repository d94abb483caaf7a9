use crate::worker::{EmbedCall, WorkerClient, WorkerEndpoint};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tracing::debug;

// Talks to model-serving processes over loopback HTTP.
pub struct HttpWorkerClient {
    client: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpWorkerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn embed(
        &self,
        endpoint: &WorkerEndpoint,
        call: &EmbedCall,
    ) -> Result<()> {
        let url = endpoint.embed_url();
        debug!("POST {} input={}", url, call.input.display());

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json; charset=UTF-8")
            .json(call)
            .send()
            .await
            .with_context(|| format!("embed request to {} failed", url))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "unexpected HTTP status code {} from {}: {}",
                status.as_u16(),
                url,
                body
            ));
        }

        Ok(())
    }
}
