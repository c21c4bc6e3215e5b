//! # Docflow
//!
//! Client-side orchestration for remote document-processing jobs.
//!
//! A submitted document finishes either when a webhook notification arrives
//! or when local polling observes a terminal status. This crate reconciles
//! both signals:
//!
//! - **Backoff**: capped exponential delays ([`backoff::next_delay`])
//! - **Polling**: [`poll::poll_until_done`] drives a [`RemoteJobClient`] to a terminal state
//! - **Correlation**: [`PendingResults`] bridges blocked waiters and webhook handlers
//! - **Dispatch**: [`WebhookDispatcher`] routes event types to handlers
//! - **Batching**: [`BatchCoordinator`] runs many documents with bounded concurrency
//!
//! ```text
//!                ┌──────────────────────┐
//!                │   BatchCoordinator   │
//!                └──────────┬───────────┘
//!             pull          │          push
//!        ┌──────────────────┴─────────────────┐
//!        ▼                                    ▼
//! ┌──────────────┐                  ┌───────────────────┐
//! │ poll engine  │                  │  PendingResults   │◀── WebhookDispatcher
//! └──────┬───────┘                  └───────────────────┘
//!        ▼
//! ┌──────────────────┐
//! │ RemoteJobClient  │ (HTTP or in-memory)
//! └──────────────────┘
//! ```

pub mod backoff;
pub mod batch;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod model;
pub mod poll;
pub mod registry;
pub mod service;

pub use batch::{BatchConfig, BatchCoordinator, CompletionMode, ProgressCallback};
pub use client::{HttpJobClient, InMemoryJobClient, RemoteJobClient};
pub use dispatcher::{
    resolve_pending_handler, WebhookDispatcher, WebhookEvent, EVENT_COMPLETED,
    EVENT_READY_FOR_REVIEW,
};
pub use error::{DocflowError, ErrorKind, Result};
pub use model::{
    BatchProgress, BatchResult, CountryCode, DocType, DocumentRequest, Job, JobRef, JobStatus,
    ProcessedResult,
};
pub use poll::{poll_until_done, poll_until_done_cancellable, PollConfig};
pub use registry::{PendingResults, WaitKey, WaiterHandle, WaiterState};
pub use service::DocumentService;

/// Prelude for common imports
pub mod prelude {
    pub use crate::batch::{BatchConfig, BatchCoordinator, CompletionMode};
    pub use crate::client::{InMemoryJobClient, RemoteJobClient};
    pub use crate::dispatcher::{WebhookDispatcher, EVENT_COMPLETED, EVENT_READY_FOR_REVIEW};
    pub use crate::error::{DocflowError, ErrorKind, Result};
    pub use crate::model::{DocType, DocumentRequest, JobStatus, ProcessedResult};
    pub use crate::poll::PollConfig;
    pub use crate::registry::{PendingResults, WaitKey};
}
