// Remote job client abstraction
//
// The polling engine, the batch coordinator and the document service only talk
// to the remote document API through this trait:
// - `HttpJobClient` for the real service
// - `InMemoryJobClient` for tests and `--simulate` runs

mod http;
mod memory;

pub use http::{HttpJobClient, MAX_UPLOAD_BYTES};
pub use memory::InMemoryJobClient;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::model::{DocumentRequest, StatusReport, SubmitReceipt};

/// Client for the remote document-processing API
///
/// Implementations must be safe to share across batch workers.
#[async_trait]
pub trait RemoteJobClient: Send + Sync {
    /// Upload a document and start processing
    ///
    /// Fails with `FileValidation`, `Authentication`, `Network` or `Server`.
    async fn submit(&self, request: &DocumentRequest) -> Result<SubmitReceipt>;

    /// Fetch the current status of a job
    ///
    /// Fails with `NotFound` for unknown ids.
    async fn get_status(&self, job_id: &str) -> Result<StatusReport>;

    /// Fetch the terminal result payload of a job
    ///
    /// Fails with `NotFound`, or `NotReady` when the job is not done yet.
    async fn get_result(&self, job_id: &str) -> Result<Value>;
}
