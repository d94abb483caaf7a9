pub mod fake;
pub mod pool;
pub mod process;
pub mod real;

use crate::cancel::Cancellation;
use crate::error::{ServiceError, ServiceResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, instrument};

/// A crop rectangle in image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    /// Returns `None` for degenerate rectangles, which mean "no crop".
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self {
            x,
            y,
            width,
            height,
        })
    }
}

impl fmt::Display for CropRect {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.width, self.height)
    }
}

/// What a caller wants embedded.
#[derive(Debug, Clone)]
pub struct EmbedPayload {
    pub image: Arc<Vec<u8>>,
    pub model_id: String,
    pub crop: Option<CropRect>,
}

impl EmbedPayload {
    pub fn new(
        image: Vec<u8>,
        model_id: impl Into<String>,
        crop: Option<CropRect>,
    ) -> Self {
        Self {
            image: Arc::new(image),
            model_id: model_id.into(),
            crop,
        }
    }
}

/// Body of the request sent to a model-serving process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmbedCall {
    pub input: PathBuf,
    pub output: PathBuf,
    /// `"x,y,w,h"`, or empty when the whole image is embedded.
    pub crop: String,
}

/// Loopback address of one model-serving process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerEndpoint {
    pub port: u16,
}

impl WorkerEndpoint {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn embed_url(&self) -> String {
        format!("http://127.0.0.1:{}/embed", self.port)
    }
}

/// Talks to a model-serving process.
///
/// The real implementation posts JSON over loopback HTTP; tests use
/// [`fake::FakeWorkerClient`] to script outcomes and watch concurrency.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Runs one embedding. Resolves once the worker has written `call.output`.
    /// Any transport failure or non-success status is an error.
    async fn embed(
        &self,
        endpoint: &WorkerEndpoint,
        call: &EmbedCall,
    ) -> Result<()>;
}

/// Integral devices are GPU indices.
pub fn format_device(device: &str) -> String {
    if device.parse::<u32>().is_ok() {
        format!("cuda:{}", device)
    } else {
        device.to_string()
    }
}

/// A handle to one live model-serving process bound to one device.
pub struct WorkerSlot {
    pub id: usize,
    pub device: String,
    pub endpoint: WorkerEndpoint,
    client: Arc<dyn WorkerClient>,
}

impl fmt::Debug for WorkerSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WorkerSlot")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl WorkerSlot {
    pub fn new(
        id: usize,
        device: impl Into<String>,
        endpoint: WorkerEndpoint,
        client: Arc<dyn WorkerClient>,
    ) -> Self {
        Self {
            id,
            device: device.into(),
            endpoint,
            client,
        }
    }

    /// Runs one job on this slot's process.
    ///
    /// The payload is staged in a private temp dir that is removed when this
    /// returns. If `cancel` fires mid-call the in-flight request is dropped,
    /// which aborts it.
    #[instrument(skip(self, payload, cancel), fields(device = %self.device, port = self.endpoint.port), err)]
    pub async fn execute(
        &self,
        payload: &EmbedPayload,
        cancel: &Cancellation,
    ) -> ServiceResult<Vec<u8>> {
        if let Some(err) = cancel.is_fired() {
            return Err(err);
        }
        let work_dir = tempfile::Builder::new()
            .prefix("embed-")
            .tempdir()
            .context("failed to create embed work dir")?;
        let input = work_dir.path().join("input");
        tokio::fs::write(&input, payload.image.as_slice())
            .await
            .context("failed to stage embed input")?;

        let call = EmbedCall {
            output: input.with_extension("npy"),
            input,
            crop: payload.crop.map(|c| c.to_string()).unwrap_or_default(),
        };

        tokio::select! {
            biased;
            err = cancel.fired() => return Err(err),
            res = self.client.embed(&self.endpoint, &call) => {
                res.map_err(|e| ServiceError::Upstream(format!("{:#}", e)))?
            }
        }

        let output = tokio::fs::read(&call.output).await.map_err(|e| {
            ServiceError::Upstream(format!(
                "worker reported success but output is unreadable: {}",
                e
            ))
        })?;
        debug!("embedding produced {} bytes", output.len());
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeWorkerClient;
    use super::*;
    use std::time::Duration;

    #[test]
    fn degenerate_crops_mean_no_crop() {
        assert!(CropRect::new(0, 0, 0, 10).is_none());
        assert!(CropRect::new(5, 5, 10, 0).is_none());
        let crop = CropRect::new(1, 2, 3, 4).unwrap();
        assert_eq!(crop.to_string(), "1,2,3,4");
    }

    #[test]
    fn integral_devices_are_gpus() {
        assert_eq!(format_device("0"), "cuda:0");
        assert_eq!(format_device("cpu"), "cpu");
        assert_eq!(format_device("cuda:1"), "cuda:1");
    }

    #[tokio::test]
    async fn execute_with_expired_deadline_never_calls_the_worker() {
        let client = Arc::new(FakeWorkerClient::new());
        let slot = WorkerSlot::new(0, "cpu", WorkerEndpoint::new(9000), client.clone());
        let payload = EmbedPayload::new(b"pixels".to_vec(), "m", None);
        let cancel = Cancellation::with_deadline(
            tokio::time::Instant::now() - Duration::from_millis(1),
        );

        let err = slot.execute(&payload, &cancel).await.unwrap_err();
        assert!(matches!(err, ServiceError::DeadlineExceeded));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn execute_returns_worker_output() {
        let client = Arc::new(FakeWorkerClient::new());
        let slot = WorkerSlot::new(0, "cpu", WorkerEndpoint::new(9000), client.clone());
        let payload = EmbedPayload::new(b"pixels".to_vec(), "m", None);

        let out = slot.execute(&payload, &Cancellation::none()).await.unwrap();
        assert_eq!(out, FakeWorkerClient::expected_output(b"pixels", ""));

        let calls = client.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].crop, "");
        // The work dir is gone once the slot is done.
        assert!(!calls[0].input.exists());
    }

    #[tokio::test]
    async fn execute_passes_crop() {
        let client = Arc::new(FakeWorkerClient::new());
        let slot = WorkerSlot::new(0, "cpu", WorkerEndpoint::new(9000), client.clone());
        let payload =
            EmbedPayload::new(b"pixels".to_vec(), "m", CropRect::new(1, 2, 3, 4));

        let out = slot.execute(&payload, &Cancellation::none()).await.unwrap();
        assert_eq!(out, FakeWorkerClient::expected_output(b"pixels", "1,2,3,4"));
    }

    #[tokio::test]
    async fn worker_failure_is_upstream() {
        let client = Arc::new(FakeWorkerClient::new().with_failure("HTTP 500"));
        let slot = WorkerSlot::new(0, "cpu", WorkerEndpoint::new(9000), client);
        let payload = EmbedPayload::new(b"pixels".to_vec(), "m", None);

        let err = slot
            .execute(&payload, &Cancellation::none())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Upstream(ref msg) if msg.contains("HTTP 500")));
    }

    #[tokio::test]
    async fn deadline_aborts_in_flight_call() {
        let client = Arc::new(
            FakeWorkerClient::new().with_latency(Duration::from_secs(30)),
        );
        let slot = WorkerSlot::new(0, "cpu", WorkerEndpoint::new(9000), client.clone());
        let payload = EmbedPayload::new(b"pixels".to_vec(), "m", None);

        let err = slot
            .execute(&payload, &Cancellation::with_timeout(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::DeadlineExceeded));
        assert_eq!(client.in_flight(), 0);
    }
}
