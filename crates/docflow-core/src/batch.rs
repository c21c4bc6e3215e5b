//! Bounded-concurrency batch coordinator
//!
//! Fans a list of documents out over at most `max_concurrency` concurrent
//! workers. Each worker submits its document and then either polls until the
//! job is done or waits on the pending-result registry for a webhook. Every
//! job ends up in exactly one of `successes` or `failures`.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{instrument, Instrument};

use crate::client::RemoteJobClient;
use crate::dispatcher::panic_message;
use crate::error::{DocflowError, Result};
use crate::model::{BatchProgress, BatchResult, DocumentRequest, JobRef, JobStatus, ProcessedResult};
use crate::poll::{poll_until_done_cancellable, PollConfig};
use crate::registry::PendingResults;

/// Callback receiving a progress snapshot after each finished job
pub type ProgressCallback = Arc<dyn Fn(BatchProgress) + Send + Sync>;

/// How a worker learns that its job finished
#[derive(Clone)]
pub enum CompletionMode {
    /// Poll the remote status with backoff
    Poll,
    /// Wait for a webhook to resolve the job in `registry`
    ///
    /// A notification delivered before the worker registers its waiter is
    /// not seen; the wait then ends with a timeout.
    Webhook {
        registry: Arc<PendingResults>,
        wait_timeout: Duration,
    },
}

impl fmt::Debug for CompletionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionMode::Poll => f.write_str("Poll"),
            CompletionMode::Webhook { wait_timeout, .. } => f
                .debug_struct("Webhook")
                .field("wait_timeout", wait_timeout)
                .finish_non_exhaustive(),
        }
    }
}

/// Batch coordinator configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub poll: PollConfig,
    pub mode: CompletionMode,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            mode: CompletionMode::Poll,
        }
    }
}

impl BatchConfig {
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Complete jobs through webhooks delivered into `registry`
    pub fn with_webhook(mut self, registry: Arc<PendingResults>, wait_timeout: Duration) -> Self {
        self.mode = CompletionMode::Webhook {
            registry,
            wait_timeout,
        };
        self
    }
}

struct AggregatorState {
    successes: Vec<ProcessedResult>,
    failures: BTreeMap<JobRef, DocflowError>,
    reported: Vec<bool>,
}

/// Collects per-job outcomes; progress is published under the same lock so
/// snapshots are observed in order
struct Aggregator {
    total: usize,
    state: Mutex<AggregatorState>,
    on_progress: Option<ProgressCallback>,
}

impl Aggregator {
    fn new(total: usize, on_progress: Option<ProgressCallback>) -> Self {
        Self {
            total,
            state: Mutex::new(AggregatorState {
                successes: Vec::new(),
                failures: BTreeMap::new(),
                reported: vec![false; total],
            }),
            on_progress,
        }
    }

    fn record(&self, job: JobRef, outcome: Result<ProcessedResult>) {
        let mut state = self.state.lock();
        match state.reported.get_mut(job.index) {
            Some(reported) if !*reported => *reported = true,
            _ => return,
        }

        match outcome {
            Ok(result) => state.successes.push(result),
            Err(err) => {
                tracing::warn!(job = %job, error = %err, "batch job failed");
                state.failures.insert(job, err);
            }
        }

        let progress = BatchProgress {
            total: self.total,
            completed: state.successes.len(),
            failed: state.failures.len(),
        };
        if let Some(on_progress) = &self.on_progress {
            on_progress(progress);
        }
    }

    fn finish(&self, jobs: &[DocumentRequest]) -> BatchResult {
        let mut state = self.state.lock();
        for (index, request) in jobs.iter().enumerate() {
            if !state.reported[index] {
                state.reported[index] = true;
                state.failures.insert(
                    JobRef::new(index, &request.source_path),
                    DocflowError::Internal("job finished without reporting an outcome".into()),
                );
            }
        }

        BatchResult {
            successes: std::mem::take(&mut state.successes),
            failures: std::mem::take(&mut state.failures),
        }
    }
}

/// Runs batches of documents against a remote job client
///
/// Worker tasks are tracked for the coordinator's lifetime; after
/// [`shutdown`](Self::shutdown) no further batches are accepted.
pub struct BatchCoordinator {
    client: Arc<dyn RemoteJobClient>,
    config: BatchConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl BatchCoordinator {
    pub fn new(client: Arc<dyn RemoteJobClient>, config: BatchConfig) -> Self {
        Self {
            client,
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Process `jobs` with at most `max_concurrency` in flight (minimum 1)
    pub async fn process_documents(
        &self,
        jobs: Vec<DocumentRequest>,
        max_concurrency: usize,
        on_progress: Option<ProgressCallback>,
    ) -> Result<BatchResult> {
        self.process_documents_until(jobs, max_concurrency, on_progress, &CancellationToken::new())
            .await
    }

    /// [`process_documents`](Self::process_documents) that cancels in-flight
    /// jobs when `cancel` fires
    ///
    /// Cancelled jobs are recorded as `Cancelled` failures; the call still
    /// returns a complete [`BatchResult`].
    #[instrument(skip_all, fields(jobs = jobs.len(), max_concurrency = max_concurrency))]
    pub async fn process_documents_until(
        &self,
        jobs: Vec<DocumentRequest>,
        max_concurrency: usize,
        on_progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<BatchResult> {
        if self.is_shut_down() {
            return Err(DocflowError::ShutDown);
        }

        let aggregator = Arc::new(Aggregator::new(jobs.len(), on_progress));
        let batch_token = self.shutdown.child_token();
        // Dropping this call mid-flight cancels its workers
        let _drop_guard = batch_token.clone().drop_guard();
        let limit = max_concurrency.clamp(1, jobs.len().max(1).min(Semaphore::MAX_PERMITS));
        let permits = Arc::new(Semaphore::new(limit));
        let mut workers = JoinSet::new();

        tracing::info!(jobs = jobs.len(), "starting batch");

        for (index, request) in jobs.iter().cloned().enumerate() {
            let job = JobRef::new(index, &request.source_path);
            let span = tracing::info_span!("batch_job", index, path = %request.source_path.display());
            let client = Arc::clone(&self.client);
            let config = self.config.clone();
            let token = batch_token.clone();
            let permits = Arc::clone(&permits);
            let aggregator = Arc::clone(&aggregator);

            let worker = async move {
                let outcome = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(DocflowError::cancelled(
                        "batch cancelled before the job started",
                    )),
                    permit = permits.acquire_owned() => match permit {
                        Ok(_permit) => {
                            AssertUnwindSafe(run_job(client.as_ref(), &config, &request, &token))
                                .catch_unwind()
                                .await
                                .unwrap_or_else(|panic| {
                                    Err(DocflowError::Internal(format!(
                                        "batch worker panicked: {}",
                                        panic_message(panic.as_ref())
                                    )))
                                })
                        }
                        Err(_) => Err(DocflowError::ShutDown),
                    },
                };
                aggregator.record(job, outcome);
            };

            workers.spawn(self.tracker.track_future(worker.instrument(span)));
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled(), if !batch_token.is_cancelled() => {
                    tracing::info!("batch cancellation requested");
                    batch_token.cancel();
                }
                joined = workers.join_next() => match joined {
                    Some(Ok(())) => {}
                    Some(Err(e)) => tracing::error!(error = %e, "batch worker aborted"),
                    None => break,
                },
            }
        }

        let result = aggregator.finish(&jobs);
        tracing::info!(
            successes = result.successes.len(),
            failures = result.failures.len(),
            "batch finished"
        );
        Ok(result)
    }

    /// Cancel in-flight jobs and wait for every worker to finish
    pub async fn shutdown(&self) {
        tracing::info!("shutting down batch coordinator");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn run_job(
    client: &dyn RemoteJobClient,
    config: &BatchConfig,
    request: &DocumentRequest,
    cancel: &CancellationToken,
) -> Result<ProcessedResult> {
    let receipt = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(DocflowError::cancelled("batch cancelled during submission"));
        }
        receipt = client.submit(request) => receipt?,
    };

    if receipt.initial_status == JobStatus::Failed {
        return Err(DocflowError::RemoteJobFailed {
            job_id: receipt.job_id,
            attempt: 0,
        });
    }

    match &config.mode {
        CompletionMode::Poll => {
            poll_until_done_cancellable(client, &receipt.job_id, &config.poll, cancel).await
        }
        CompletionMode::Webhook {
            registry,
            wait_timeout,
        } => {
            registry
                .wait_cancellable(receipt.job_id.as_str(), *wait_timeout, cancel)
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryJobClient;
    use crate::error::ErrorKind;
    use crate::model::DocType;

    fn docs(n: usize) -> Vec<DocumentRequest> {
        (0..n)
            .map(|i| DocumentRequest::new("tester", DocType::Invoice, format!("doc-{i}.pdf")))
            .collect()
    }

    fn fast_poll() -> PollConfig {
        PollConfig::default()
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(50))
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_batch() {
        let coordinator = BatchCoordinator::new(
            Arc::new(InMemoryJobClient::new()),
            BatchConfig::default(),
        );

        let result = coordinator.process_documents(Vec::new(), 3, None).await.unwrap();

        assert_eq!(result.total(), 0);
        assert!(result.all_successful());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_concurrency_still_makes_progress() {
        let client = Arc::new(InMemoryJobClient::new());
        let coordinator =
            BatchCoordinator::new(client.clone(), BatchConfig::default().with_poll(fast_poll()));

        let result = coordinator.process_documents(docs(3), 0, None).await.unwrap();

        assert_eq!(result.successes.len(), 3);
        assert_eq!(client.peak_open_jobs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_concurrency_is_clamped() {
        let client = Arc::new(InMemoryJobClient::new());
        let coordinator =
            BatchCoordinator::new(client.clone(), BatchConfig::default().with_poll(fast_poll()));

        let result = coordinator
            .process_documents(docs(2), usize::MAX, None)
            .await
            .unwrap();

        assert_eq!(result.successes.len(), 2);
        assert!(result.failures.is_empty());
        assert!(client.peak_open_jobs() <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_on_submit_ack_is_recorded() {
        let client = Arc::new(
            InMemoryJobClient::new().initial_status_for("doc-1.pdf", JobStatus::Failed),
        );
        let coordinator =
            BatchCoordinator::new(client.clone(), BatchConfig::default().with_poll(fast_poll()));

        let result = coordinator.process_documents(docs(2), 2, None).await.unwrap();

        assert_eq!(result.successes.len(), 1);
        let failure = result
            .failures
            .get(&JobRef::new(1, std::path::Path::new("doc-1.pdf")))
            .unwrap();
        assert!(matches!(failure, DocflowError::RemoteJobFailed { attempt: 0, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_after_shutdown() {
        let coordinator = BatchCoordinator::new(
            Arc::new(InMemoryJobClient::new()),
            BatchConfig::default(),
        );
        coordinator.shutdown().await;

        let err = coordinator.process_documents(docs(1), 1, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShutDown);
        assert!(coordinator.is_shut_down());
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancel_marks_jobs_cancelled() {
        let client = Arc::new(
            InMemoryJobClient::new().with_default_script(vec![JobStatus::InProgress]),
        );
        let coordinator =
            BatchCoordinator::new(client, BatchConfig::default().with_poll(fast_poll()));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = coordinator
            .process_documents_until(docs(5), 2, None, &cancel)
            .await
            .unwrap();

        assert_eq!(result.failures.len(), 5);
        assert!(result
            .failures
            .values()
            .all(|err| err.kind() == ErrorKind::Cancelled));
        assert!(!coordinator.is_shut_down());
    }
}
