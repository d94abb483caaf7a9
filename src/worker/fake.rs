use crate::worker::{EmbedCall, WorkerClient, WorkerEndpoint};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// A scripted outcome for one call.
#[derive(Debug, Clone)]
pub enum FakeOutcome {
    Succeed,
    Fail(String),
}

/// A fake model-serving process for tests.
///
/// Successful calls write [`FakeWorkerClient::expected_output`] to the
/// requested output path. Outcomes queued with [`with_failure`] and
/// [`with_success`] are consumed in order; after that every call uses the
/// default outcome. The client also records how many calls each endpoint
/// served at once so tests can assert that a slot never runs two jobs.
///
/// [`with_failure`]: FakeWorkerClient::with_failure
/// [`with_success`]: FakeWorkerClient::with_success
pub struct FakeWorkerClient {
    scripted: Mutex<VecDeque<FakeOutcome>>,
    default_outcome: FakeOutcome,
    latency: Duration,
    calls: Mutex<Vec<EmbedCall>>,
    active: Mutex<HashMap<WorkerEndpoint, usize>>,
    max_per_endpoint: AtomicUsize,
    in_flight: AtomicUsize,
}

impl Default for FakeWorkerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeWorkerClient {
    pub fn new() -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            default_outcome: FakeOutcome::Succeed,
            latency: Duration::ZERO,
            calls: Mutex::new(vec![]),
            active: Mutex::new(HashMap::new()),
            max_per_endpoint: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// The bytes a successful call writes for `input` and `crop`.
    pub fn expected_output(input: &[u8], crop: &str) -> Vec<u8> {
        let mut out = b"npy:".to_vec();
        out.extend_from_slice(crop.as_bytes());
        out.push(b':');
        out.extend_from_slice(input);
        out
    }

    pub fn with_success(self) -> Self {
        self.scripted.lock().unwrap().push_back(FakeOutcome::Succeed);
        self
    }

    pub fn with_failure(self, message: &str) -> Self {
        self.scripted
            .lock()
            .unwrap()
            .push_back(FakeOutcome::Fail(message.to_string()));
        self
    }

    /// Every call that has no scripted outcome fails with `message`.
    pub fn failing_by_default(mut self, message: &str) -> Self {
        self.default_outcome = FakeOutcome::Fail(message.to_string());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<EmbedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Calls currently running across all endpoints.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls observed on any single endpoint.
    pub fn max_concurrency_per_endpoint(&self) -> usize {
        self.max_per_endpoint.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> FakeOutcome {
        self.scripted
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_outcome.clone())
    }
}

// Decrements the activity counters even when the call future is dropped
// mid-flight.
struct ActiveCall<'a> {
    client: &'a FakeWorkerClient,
    endpoint: WorkerEndpoint,
}

impl<'a> ActiveCall<'a> {
    fn enter(client: &'a FakeWorkerClient, endpoint: WorkerEndpoint) -> Self {
        let now_active = {
            let mut active = client.active.lock().unwrap();
            let count = active.entry(endpoint).or_insert(0);
            *count += 1;
            *count
        };
        client
            .max_per_endpoint
            .fetch_max(now_active, Ordering::SeqCst);
        client.in_flight.fetch_add(1, Ordering::SeqCst);
        Self { client, endpoint }
    }
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        if let Some(count) =
            self.client.active.lock().unwrap().get_mut(&self.endpoint)
        {
            *count -= 1;
        }
        self.client.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkerClient for FakeWorkerClient {
    async fn embed(
        &self,
        endpoint: &WorkerEndpoint,
        call: &EmbedCall,
    ) -> Result<()> {
        let _active = ActiveCall::enter(self, *endpoint);
        self.calls.lock().unwrap().push(call.clone());
        let outcome = self.next_outcome();

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match outcome {
            FakeOutcome::Succeed => {
                let input = tokio::fs::read(&call.input).await?;
                let output = Self::expected_output(&input, &call.crop);
                tokio::fs::write(&call.output, output).await?;
                Ok(())
            }
            FakeOutcome::Fail(message) => Err(anyhow::anyhow!(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_in(dir: &std::path::Path) -> EmbedCall {
        let input = dir.join("in");
        std::fs::write(&input, b"abc").unwrap();
        EmbedCall {
            output: dir.join("out.npy"),
            input,
            crop: String::new(),
        }
    }

    #[tokio::test]
    async fn test_scripted_outcomes_then_default() {
        let dir = tempfile::tempdir().unwrap();
        let call = call_in(dir.path());
        let endpoint = WorkerEndpoint::new(1);
        let client = FakeWorkerClient::new()
            .with_failure("first")
            .with_success();

        let first = client.embed(&endpoint, &call).await;
        assert_eq!(first.unwrap_err().to_string(), "first");

        client.embed(&endpoint, &call).await.unwrap();
        assert_eq!(
            std::fs::read(&call.output).unwrap(),
            FakeWorkerClient::expected_output(b"abc", "")
        );

        // Default outcome is success.
        client.embed(&endpoint, &call).await.unwrap();
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn test_failing_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let call = call_in(dir.path());
        let client = FakeWorkerClient::new().failing_by_default("down");
        let err = client
            .embed(&WorkerEndpoint::new(1), &call)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "down");
    }

    #[tokio::test]
    async fn test_tracks_concurrency_per_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let call = call_in(dir.path());
        let client = FakeWorkerClient::new()
            .with_latency(Duration::from_millis(50));

        let a = WorkerEndpoint::new(1);
        let b = WorkerEndpoint::new(2);
        let (ra, rb) = tokio::join!(client.embed(&a, &call), client.embed(&b, &call));
        ra.unwrap();
        rb.unwrap();
        assert_eq!(client.max_concurrency_per_endpoint(), 1);

        let (r1, r2) = tokio::join!(client.embed(&a, &call), client.embed(&a, &call));
        r1.unwrap();
        r2.unwrap();
        assert_eq!(client.max_concurrency_per_endpoint(), 2);
        assert_eq!(client.in_flight(), 0);
    }
}
