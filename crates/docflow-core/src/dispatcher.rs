//! Webhook dispatch
//!
//! Maps event types to handlers. The dispatcher knows nothing about job
//! correlation; handlers built with [`resolve_pending_handler`] forward
//! results into a [`PendingResults`] registry.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{BoxError, DocflowError, Result};
use crate::model::ProcessedResult;
use crate::registry::PendingResults;

/// Document reviewed and awaiting confirmation
pub const EVENT_READY_FOR_REVIEW: &str = "document.ready_for_review";

/// Document processing finished
pub const EVENT_COMPLETED: &str = "document.completed";

/// A parsed inbound webhook notification
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub event_type: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl WebhookEvent {
    /// Job id carried by the payload, if any
    pub fn job_id(&self) -> Option<&str> {
        ["process_id", "job_id"]
            .iter()
            .find_map(|key| self.payload.get(*key).and_then(Value::as_str))
    }
}

/// Handler invoked synchronously for one event type
///
/// Handlers may run concurrently when the listener serves requests in parallel.
pub type WebhookHandler = Arc<dyn Fn(&WebhookEvent) -> std::result::Result<(), BoxError> + Send + Sync>;

/// Event-type to handler mapping; the last registration for a type wins
#[derive(Default)]
pub struct WebhookDispatcher {
    handlers: RwLock<HashMap<String, WebhookHandler>>,
}

impl WebhookDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`, replacing any previous one
    pub fn register_handler<F>(&self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(&WebhookEvent) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let replaced = self
            .handlers
            .write()
            .insert(event_type.clone(), Arc::new(handler))
            .is_some();
        tracing::debug!(event_type = %event_type, replaced, "webhook handler registered");
    }

    pub fn on_ready_for_review<F>(&self, handler: F)
    where
        F: Fn(&WebhookEvent) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.register_handler(EVENT_READY_FOR_REVIEW, handler);
    }

    pub fn on_completed<F>(&self, handler: F)
    where
        F: Fn(&WebhookEvent) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.register_handler(EVENT_COMPLETED, handler);
    }

    pub fn has_handler(&self, event_type: &str) -> bool {
        self.handlers.read().contains_key(event_type)
    }

    pub fn remove_handler(&self, event_type: &str) -> bool {
        self.handlers.write().remove(event_type).is_some()
    }

    pub fn clear_handlers(&self) {
        self.handlers.write().clear();
    }

    /// Parse `raw_payload` and hand it to the handler for `event_type`
    ///
    /// Returns `Ok(false)` for event types without a handler. A payload that is
    /// not a JSON object fails with `MalformedPayload`; handler errors and
    /// panics are wrapped in `WebhookProcessing`.
    pub fn dispatch(&self, event_type: &str, raw_payload: &str) -> Result<bool> {
        let payload: Value = serde_json::from_str(raw_payload)
            .map_err(|e| DocflowError::malformed(format!("webhook {event_type}: {e}")))?;
        self.dispatch_value(event_type, payload)
    }

    /// [`dispatch`](Self::dispatch) for an already parsed payload
    pub fn dispatch_value(&self, event_type: &str, payload: Value) -> Result<bool> {
        if !payload.is_object() {
            return Err(DocflowError::malformed(format!(
                "webhook {event_type}: payload must be a JSON object"
            )));
        }

        // Clone out so the lock is not held while the handler runs
        let handler = self.handlers.read().get(event_type).cloned();
        let Some(handler) = handler else {
            tracing::debug!(event_type, "no handler registered, ignoring webhook");
            return Ok(false);
        };

        let event = WebhookEvent {
            event_type: event_type.to_string(),
            payload,
            received_at: Utc::now(),
        };

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&event)));
        match outcome {
            Ok(Ok(())) => {
                tracing::info!(event_type, job_id = event.job_id(), "webhook handled");
                Ok(true)
            }
            Ok(Err(source)) => {
                tracing::error!(event_type, error = %source, "webhook handler failed");
                Err(DocflowError::WebhookProcessing {
                    event_type: event_type.to_string(),
                    source,
                })
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(event_type, panic = %message, "webhook handler panicked");
                Err(DocflowError::WebhookProcessing {
                    event_type: event_type.to_string(),
                    source: format!("handler panicked: {message}").into(),
                })
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handler that forwards the payload into `registry`
///
/// Payloads carrying a job id resolve that job's waiter; anything else
/// resolves the oldest pending waiter.
pub fn resolve_pending_handler(
    registry: Arc<PendingResults>,
) -> impl Fn(&WebhookEvent) -> std::result::Result<(), BoxError> + Send + Sync + 'static {
    move |event: &WebhookEvent| {
        let result = ProcessedResult::from_payload(&event.payload)?;
        match event.job_id() {
            Some(job_id) => {
                registry.resolve(job_id, result);
            }
            None => {
                registry.resolve_any(result);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::registry::WaiterState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_unknown_event_is_not_handled() {
        let dispatcher = WebhookDispatcher::new();
        let handled = dispatcher.dispatch("document.archived", "{}").unwrap();
        assert!(!handled);
    }

    #[test]
    fn test_last_registration_wins() {
        let dispatcher = WebhookDispatcher::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        dispatcher.on_completed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let counter = Arc::clone(&second);
        dispatcher.on_completed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(dispatcher.dispatch(EVENT_COMPLETED, "{}").unwrap());
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_malformed_payload_propagates() {
        let dispatcher = WebhookDispatcher::new();
        dispatcher.on_completed(|_| Ok(()));

        let err = dispatcher.dispatch(EVENT_COMPLETED, "{not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedPayload);

        let err = dispatcher.dispatch(EVENT_COMPLETED, "[1, 2]").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedPayload);
    }

    #[test]
    fn test_handler_error_wrapped_with_event_type() {
        let dispatcher = WebhookDispatcher::new();
        dispatcher.on_ready_for_review(|_| Err("review queue unavailable".into()));

        let err = dispatcher
            .dispatch(EVENT_READY_FOR_REVIEW, r#"{"process_id": "p1"}"#)
            .unwrap_err();

        match &err {
            DocflowError::WebhookProcessing { event_type, source } => {
                assert_eq!(event_type, EVENT_READY_FOR_REVIEW);
                assert_eq!(source.to_string(), "review queue unavailable");
            }
            other => panic!("expected WebhookProcessing, got {other:?}"),
        }
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let dispatcher = WebhookDispatcher::new();
        dispatcher.on_completed(|_| panic!("boom"));

        let err = dispatcher.dispatch(EVENT_COMPLETED, "{}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WebhookProcessing);
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_handler_management() {
        let dispatcher = WebhookDispatcher::new();
        dispatcher.on_completed(|_| Ok(()));
        dispatcher.on_ready_for_review(|_| Ok(()));

        assert!(dispatcher.has_handler(EVENT_COMPLETED));
        assert!(dispatcher.remove_handler(EVENT_COMPLETED));
        assert!(!dispatcher.remove_handler(EVENT_COMPLETED));
        assert!(!dispatcher.dispatch(EVENT_COMPLETED, "{}").unwrap());

        dispatcher.clear_handlers();
        assert!(!dispatcher.has_handler(EVENT_READY_FOR_REVIEW));
    }

    #[test]
    fn test_resolve_pending_by_job_id() {
        let registry = Arc::new(PendingResults::new());
        let other = registry.register("job-a");
        let target = registry.register("job-b");

        let dispatcher = WebhookDispatcher::new();
        dispatcher.on_completed(resolve_pending_handler(Arc::clone(&registry)));

        let handled = dispatcher
            .dispatch(EVENT_COMPLETED, r#"{"process_id": "job-b", "pages": 2}"#)
            .unwrap();

        assert!(handled);
        assert!(matches!(target.state(), WaiterState::Resolved(_)));
        assert!(matches!(other.state(), WaiterState::Pending));
    }

    #[test]
    fn test_resolve_pending_without_id_takes_oldest() {
        let registry = Arc::new(PendingResults::new());
        let oldest = registry.register("job-a");
        let newer = registry.register("job-b");

        let dispatcher = WebhookDispatcher::new();
        dispatcher.on_completed(resolve_pending_handler(Arc::clone(&registry)));
        dispatcher
            .dispatch(EVENT_COMPLETED, r#"{"confidence_score": 0.8}"#)
            .unwrap();

        assert!(matches!(oldest.state(), WaiterState::Resolved(_)));
        assert!(matches!(newer.state(), WaiterState::Pending));
    }

    #[test]
    fn test_unparseable_result_surfaces_as_processing_error() {
        let registry = Arc::new(PendingResults::new());
        let handle = registry.register("job-a");

        let dispatcher = WebhookDispatcher::new();
        dispatcher.on_completed(resolve_pending_handler(Arc::clone(&registry)));
        let err = dispatcher
            .dispatch(EVENT_COMPLETED, r#"{"process_id": "job-a", "pages": "many"}"#)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::WebhookProcessing);
        assert!(matches!(handle.state(), WaiterState::Pending));
    }
}
