use crate::cancel::Cancellation;
use crate::error::{ServiceError, ServiceResult};
use crate::worker::pool::{SlotGuard, WorkerPool};
use crate::worker::EmbedPayload;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

// Counters shown on the status endpoint. `pending` covers queued and running
// jobs.
#[derive(Debug, Default)]
pub struct BrokerStats {
    pub pending: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BrokerStatsSnapshot {
    pub pending: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub idle_workers: usize,
    pub total_workers: usize,
}

/// One embed request travelling through the broker.
///
/// `finish` consumes the job, so each job delivers exactly one outcome.
pub struct Job {
    pub id: Uuid,
    pub payload: EmbedPayload,
    pub cancel: Cancellation,
    respond: oneshot::Sender<ServiceResult<Vec<u8>>>,
    stats: Arc<BrokerStats>,
}

impl Job {
    fn finish(self, outcome: ServiceResult<Vec<u8>>) {
        self.stats.pending.fetch_sub(1, Ordering::Relaxed);
        let counter = match &outcome {
            Ok(_) => &self.stats.succeeded,
            Err(e) if e.is_cancellation() => &self.stats.cancelled,
            Err(_) => &self.stats.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if self.respond.send(outcome).is_err() {
            debug!(job = %self.id, "caller went away before the outcome arrived");
        }
    }
}

enum Pairing {
    Paired(SlotGuard),
    Failed(ServiceError),
    Abandoned,
    Shutdown,
}

/// Matches queued embed jobs to idle worker slots, oldest job first.
#[derive(Clone)]
pub struct Broker {
    intake: mpsc::UnboundedSender<Job>,
    pool: Arc<WorkerPool>,
    stats: Arc<BrokerStats>,
}

impl Broker {
    /// Spawns the dispatch loop. It runs until `shutdown` is cancelled or every
    /// broker handle is dropped.
    pub fn start(
        pool: Arc<WorkerPool>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (intake, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(BrokerStats::default());
        let handle = tokio::spawn(dispatch(rx, pool.clone(), shutdown));
        (
            Self {
                intake,
                pool,
                stats,
            },
            handle,
        )
    }

    pub fn stats(&self) -> BrokerStatsSnapshot {
        BrokerStatsSnapshot {
            pending: self.stats.pending.load(Ordering::Relaxed),
            succeeded: self.stats.succeeded.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            cancelled: self.stats.cancelled.load(Ordering::Relaxed),
            idle_workers: self.pool.idle(),
            total_workers: self.pool.size(),
        }
    }

    /// Queues `payload` and waits for its outcome.
    ///
    /// If `cancel` fires while the job is still queued this returns right
    /// away; the dispatch loop drops the job without giving it a slot. If it
    /// fires mid-execution the in-flight worker call is aborted and the slot
    /// goes back to the pool once that call unwinds.
    #[instrument(skip(self, payload, cancel), fields(job), err)]
    pub async fn submit(
        &self,
        payload: EmbedPayload,
        cancel: Cancellation,
    ) -> ServiceResult<Vec<u8>> {
        let (respond, outcome) = oneshot::channel();
        let job = Job {
            id: Uuid::new_v4(),
            payload,
            cancel: cancel.clone(),
            respond,
            stats: self.stats.clone(),
        };
        let id = job.id;
        tracing::Span::current().record("job", tracing::field::display(id));

        self.stats.pending.fetch_add(1, Ordering::Relaxed);
        if let Err(mpsc::error::SendError(job)) = self.intake.send(job) {
            job.finish(Err(ServiceError::Cancelled));
            return Err(ServiceError::Internal(anyhow::anyhow!(
                "embed broker is not running"
            )));
        }
        info!(job = %id, "queued embed request");

        tokio::select! {
            biased;
            outcome = outcome => {
                info!(job = %id, "received embed response");
                outcome.map_err(|_| {
                    ServiceError::Internal(anyhow::anyhow!(
                        "embed job {} was dropped without an outcome",
                        id
                    ))
                })?
            }
            err = cancel.fired() => {
                info!(job = %id, "embed request gave up: {}", err);
                Err(err)
            }
        }
    }
}

async fn dispatch(
    mut intake: mpsc::UnboundedReceiver<Job>,
    pool: Arc<WorkerPool>,
    shutdown: CancellationToken,
) {
    info!(workers = pool.size(), "Starting embed dispatch loop");

    loop {
        let mut job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = intake.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        debug!(job = %job.id, "dequeued embed request");

        if let Some(err) = job.cancel.is_fired() {
            info!(job = %job.id, "queued embed request expired before pairing: {}", err);
            job.finish(Err(err));
            continue;
        }

        let pairing = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Pairing::Shutdown,
            _ = job.respond.closed() => Pairing::Abandoned,
            slot = pool.checkout(&job.cancel) => match slot {
                Ok(slot) => Pairing::Paired(slot),
                Err(err) => Pairing::Failed(err),
            },
        };

        match pairing {
            Pairing::Paired(slot) => {
                info!(job = %job.id, slot = slot.id, device = %slot.device, "found embedder");
                tokio::spawn(run_job(slot, job));
            }
            Pairing::Failed(err) => {
                info!(job = %job.id, "waiting for embedder ended: {}", err);
                job.finish(Err(err));
            }
            Pairing::Abandoned => {
                info!(job = %job.id, "caller abandoned queued embed request");
                job.finish(Err(ServiceError::Cancelled));
            }
            Pairing::Shutdown => {
                job.finish(Err(ServiceError::Cancelled));
                break;
            }
        }
    }

    intake.close();
    let mut drained = 0;
    while let Ok(job) = intake.try_recv() {
        job.finish(Err(ServiceError::Cancelled));
        drained += 1;
    }
    if drained > 0 {
        warn!("cancelled {} queued embed requests on shutdown", drained);
    }
    info!("Embed dispatch loop terminated");
}

async fn run_job(slot: SlotGuard, job: Job) {
    let outcome = slot.execute(&job.payload, &job.cancel).await;
    match &outcome {
        Ok(bytes) => info!(job = %job.id, slot = slot.id, bytes = bytes.len(), "finished embed request"),
        Err(e) => warn!(job = %job.id, slot = slot.id, "embed request failed: {}", e),
    }
    job.finish(outcome);
    drop(slot);
}
