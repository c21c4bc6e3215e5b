// Single-document service
//
// Thin facade over a RemoteJobClient for callers that handle one document at
// a time. Background processing runs as a cooperative tokio task that sleeps
// on backoff, not as a callback chain.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::instrument;

use crate::client::RemoteJobClient;
use crate::error::{DocflowError, Result};
use crate::model::{DocumentRequest, Job, JobStatus, ProcessedResult, StatusReport};
use crate::poll::{poll_until_done, PollConfig};

/// Upload, inspect and await individual documents
#[derive(Clone)]
pub struct DocumentService {
    client: Arc<dyn RemoteJobClient>,
    poll: PollConfig,
}

impl DocumentService {
    pub fn new(client: Arc<dyn RemoteJobClient>) -> Self {
        Self {
            client,
            poll: PollConfig::default(),
        }
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn poll_config(&self) -> &PollConfig {
        &self.poll
    }

    pub fn client(&self) -> &Arc<dyn RemoteJobClient> {
        &self.client
    }

    /// Submit without waiting for completion
    ///
    /// Fails with `RemoteJobFailed` when the service rejects the document
    /// outright (initial status FAILED).
    #[instrument(skip(self, request), fields(path = %request.source_path.display()))]
    pub async fn upload(&self, request: &DocumentRequest) -> Result<Job> {
        let receipt = self.client.submit(request).await?;
        if receipt.initial_status == JobStatus::Failed {
            return Err(DocflowError::RemoteJobFailed {
                job_id: receipt.job_id,
                attempt: 0,
            });
        }
        Ok(Job::from_submission(request, &receipt))
    }

    pub async fn check_status(&self, job_id: &str) -> Result<StatusReport> {
        self.client.get_status(job_id).await
    }

    pub async fn fetch_result(&self, job_id: &str) -> Result<ProcessedResult> {
        let payload = self.client.get_result(job_id).await?;
        ProcessedResult::from_job_payload(job_id, &payload)
    }

    /// Submit, then poll until the job is done
    pub async fn upload_and_wait(&self, request: &DocumentRequest) -> Result<ProcessedResult> {
        let job = self.upload(request).await?;
        poll_until_done(self.client.as_ref(), &job.id, &self.poll).await
    }

    /// [`upload_and_wait`](Self::upload_and_wait) on a background task
    pub fn spawn_upload_and_wait(&self, request: DocumentRequest) -> JoinHandle<Result<ProcessedResult>> {
        let service = self.clone();
        tokio::spawn(async move { service.upload_and_wait(&request).await })
    }
}
