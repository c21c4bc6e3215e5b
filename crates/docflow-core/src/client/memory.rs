// In-memory remote job client
//
// Simulates the remote document API with scripted status sequences per source
// path. Used by tests and by the CLI `--simulate` mode.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use super::RemoteJobClient;
use crate::error::{DocflowError, Result};
use crate::model::{DocumentRequest, JobStatus, StatusReport, SubmitReceipt};

struct SimJob {
    source_path: PathBuf,
    script: VecDeque<JobStatus>,
    current: JobStatus,
    payload: Option<Value>,
    status_checks: u32,
    result_fetches: u32,
    open: bool,
}

#[derive(Default)]
struct SimState {
    jobs: HashMap<String, SimJob>,
    by_path: HashMap<PathBuf, String>,
    scripts: HashMap<PathBuf, Vec<JobStatus>>,
    initial_statuses: HashMap<PathBuf, JobStatus>,
    rejections: HashMap<PathBuf, String>,
    payloads: HashMap<PathBuf, Value>,
    submitted: usize,
    open_jobs: usize,
    peak_open_jobs: usize,
}

/// Scripted stand-in for the remote document API
///
/// Every job walks through its status script, one entry per `get_status`
/// call; the last entry repeats once the script is exhausted.
pub struct InMemoryJobClient {
    state: Mutex<SimState>,
    default_script: Vec<JobStatus>,
    latency: Duration,
}

impl Default for InMemoryJobClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobClient {
    /// Jobs report IN_PROGRESS once, then DONE
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            default_script: vec![JobStatus::InProgress, JobStatus::Done],
            latency: Duration::ZERO,
        }
    }

    /// Script used for paths without their own script
    pub fn with_default_script(mut self, script: Vec<JobStatus>) -> Self {
        if !script.is_empty() {
            self.default_script = script;
        }
        self
    }

    /// Simulated latency added to every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Status sequence for jobs submitted from `path`
    pub fn script_for(self, path: impl Into<PathBuf>, script: Vec<JobStatus>) -> Self {
        if !script.is_empty() {
            self.state.lock().scripts.insert(path.into(), script);
        }
        self
    }

    /// Reject submissions of `path` as a file validation failure
    pub fn reject_submit(self, path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        self.state.lock().rejections.insert(path.into(), reason.into());
        self
    }

    /// Status reported by the submit acknowledgement for `path`
    pub fn initial_status_for(self, path: impl Into<PathBuf>, status: JobStatus) -> Self {
        self.state.lock().initial_statuses.insert(path.into(), status);
        self
    }

    /// Result payload returned once a job from `path` is done
    pub fn with_result_payload(self, path: impl Into<PathBuf>, payload: Value) -> Self {
        self.state.lock().payloads.insert(path.into(), payload);
        self
    }

    /// Number of accepted submissions
    pub fn submitted(&self) -> usize {
        self.state.lock().submitted
    }

    pub fn status_checks(&self, job_id: &str) -> u32 {
        self.state
            .lock()
            .jobs
            .get(job_id)
            .map_or(0, |job| job.status_checks)
    }

    pub fn result_fetches(&self, job_id: &str) -> u32 {
        self.state
            .lock()
            .jobs
            .get(job_id)
            .map_or(0, |job| job.result_fetches)
    }

    /// Job id assigned to the most recent submission of `path`
    pub fn job_id_for(&self, path: impl AsRef<Path>) -> Option<String> {
        self.state.lock().by_path.get(path.as_ref()).cloned()
    }

    /// Highest number of jobs that were submitted but not yet observed terminal
    pub fn peak_open_jobs(&self) -> usize {
        self.state.lock().peak_open_jobs
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn default_payload(job_id: &str, source_path: &Path) -> Value {
        let file_name = source_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        json!({
            "process_id": job_id,
            "extracted_text": format!("Extracted text of {file_name}"),
            "pages": 1,
            "confidence_score": 0.92,
            "url": format!("https://sim.docflow.local/results/{job_id}"),
            "status": "UPLOADED",
            "structured_data": { "source_file": file_name }
        })
    }
}

#[async_trait]
impl RemoteJobClient for InMemoryJobClient {
    async fn submit(&self, request: &DocumentRequest) -> Result<SubmitReceipt> {
        self.simulate_latency().await;

        let mut state = self.state.lock();
        let path = request.source_path.clone();

        if let Some(reason) = state.rejections.get(&path) {
            return Err(DocflowError::file_validation(&path, reason.clone()));
        }

        let job_id = Uuid::now_v7().to_string();
        let initial_status = state
            .initial_statuses
            .get(&path)
            .copied()
            .unwrap_or(JobStatus::InProgress);
        let script = state
            .scripts
            .get(&path)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone());
        let payload = state.payloads.get(&path).cloned();
        let open = initial_status != JobStatus::Failed;

        state.jobs.insert(
            job_id.clone(),
            SimJob {
                source_path: path.clone(),
                script: script.into(),
                current: initial_status,
                payload,
                status_checks: 0,
                result_fetches: 0,
                open,
            },
        );
        state.by_path.insert(path, job_id.clone());
        state.submitted += 1;
        if open {
            state.open_jobs += 1;
            state.peak_open_jobs = state.peak_open_jobs.max(state.open_jobs);
        }

        tracing::debug!(job_id = %job_id, status = %initial_status, "simulated submit");

        Ok(SubmitReceipt {
            job_id,
            initial_status,
        })
    }

    async fn get_status(&self, job_id: &str) -> Result<StatusReport> {
        self.simulate_latency().await;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| DocflowError::NotFound(job_id.to_string()))?;

        job.status_checks += 1;
        if job.script.len() > 1 {
            if let Some(next) = job.script.pop_front() {
                job.current = next;
            }
        } else if let Some(last) = job.script.front() {
            job.current = *last;
        }

        let status = job.current;
        if status.is_terminal() && job.open {
            job.open = false;
            state.open_jobs = state.open_jobs.saturating_sub(1);
        }

        Ok(StatusReport {
            job_id: job_id.to_string(),
            status,
        })
    }

    async fn get_result(&self, job_id: &str) -> Result<Value> {
        self.simulate_latency().await;

        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| DocflowError::NotFound(job_id.to_string()))?;

        if job.current != JobStatus::Done {
            return Err(DocflowError::NotReady {
                job_id: job_id.to_string(),
            });
        }

        job.result_fetches += 1;
        Ok(job
            .payload
            .clone()
            .unwrap_or_else(|| Self::default_payload(job_id, &job.source_path)))
    }
}
