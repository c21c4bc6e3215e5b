// Integration tests for the batch coordinator
//
// Runs batches against the in-memory job client in both completion modes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use docflow_core::{
    resolve_pending_handler, BatchConfig, BatchCoordinator, BatchProgress, DocType,
    DocumentRequest, ErrorKind, InMemoryJobClient, JobRef, JobStatus, PendingResults, PollConfig,
    ProgressCallback, WaitKey, WebhookDispatcher, EVENT_COMPLETED,
};
use parking_lot::Mutex;
use serde_json::json;

fn docs(n: usize) -> Vec<DocumentRequest> {
    (0..n)
        .map(|i| DocumentRequest::new("batch-user", DocType::Invoice, format!("invoice-{i}.pdf")))
        .collect()
}

fn fast_poll() -> PollConfig {
    PollConfig::default()
        .with_initial_delay(Duration::from_millis(20))
        .with_max_delay(Duration::from_millis(200))
}

// =============================================================================
// Poll mode
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_ten_jobs_three_failures_bounded_concurrency() {
    let failing = [2, 5, 8];
    let mut client = InMemoryJobClient::new().with_default_script(vec![
        JobStatus::InProgress,
        JobStatus::InProgress,
        JobStatus::Done,
    ]);
    for i in failing {
        client = client.script_for(
            format!("invoice-{i}.pdf"),
            vec![JobStatus::InProgress, JobStatus::Failed],
        );
    }
    let client = Arc::new(client);

    let coordinator =
        BatchCoordinator::new(client.clone(), BatchConfig::default().with_poll(fast_poll()));

    let snapshots: Arc<Mutex<Vec<BatchProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&snapshots);
    let on_progress: ProgressCallback =
        Arc::new(move |progress: BatchProgress| sink.lock().push(progress));

    let result = coordinator
        .process_documents(docs(10), 3, Some(on_progress))
        .await
        .unwrap();

    assert_eq!(result.successes.len(), 7);
    assert_eq!(result.failures.len(), 3);
    assert_eq!(result.total(), 10);
    for i in failing {
        let job = JobRef::new(i, Path::new(&format!("invoice-{i}.pdf")));
        assert_eq!(result.failures[&job].kind(), ErrorKind::RemoteJobFailed);
    }

    let snapshots = snapshots.lock();
    assert_eq!(snapshots.len(), 10);
    let mut previous = 0;
    for snapshot in snapshots.iter() {
        let done = snapshot.completed + snapshot.failed;
        assert_eq!(snapshot.total, 10);
        assert!(done <= snapshot.total);
        assert!(done > previous, "progress went from {previous} to {done}");
        previous = done;
    }
    assert!(snapshots.last().unwrap().is_complete());

    assert!(client.peak_open_jobs() <= 3);
    assert_eq!(client.submitted(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_submit_failures_are_isolated() {
    let client = Arc::new(
        InMemoryJobClient::new()
            .reject_submit("invoice-0.pdf", "file must be less than 10 MB")
            .reject_submit("invoice-3.pdf", "not a regular file"),
    );
    let coordinator =
        BatchCoordinator::new(client, BatchConfig::default().with_poll(fast_poll()));

    let result = coordinator.process_documents(docs(4), 2, None).await.unwrap();

    assert_eq!(result.successes.len(), 2);
    let failed: Vec<usize> = result.failures.keys().map(|job| job.index).collect();
    assert_eq!(failed, vec![0, 3]);
    assert!(result
        .failures
        .values()
        .all(|err| err.kind() == ErrorKind::FileValidation));
    assert_eq!(result.success_rate(), 50.0);
}

#[tokio::test(start_paused = true)]
async fn test_poll_budget_exhaustion_is_timeout_failure() {
    let client = Arc::new(InMemoryJobClient::new().script_for(
        "invoice-1.pdf",
        vec![JobStatus::InProgress],
    ));
    let coordinator = BatchCoordinator::new(
        client,
        BatchConfig::default().with_poll(fast_poll().with_max_attempts(5)),
    );

    let result = coordinator.process_documents(docs(3), 3, None).await.unwrap();

    assert_eq!(result.successes.len(), 2);
    let job = JobRef::new(1, Path::new("invoice-1.pdf"));
    assert_eq!(result.failures[&job].kind(), ErrorKind::Timeout);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_in_flight_jobs() {
    let client = Arc::new(
        InMemoryJobClient::new().with_default_script(vec![JobStatus::InProgress]),
    );
    let coordinator = Arc::new(BatchCoordinator::new(
        client,
        BatchConfig::default().with_poll(fast_poll()),
    ));

    let batch = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.process_documents(docs(6), 2, None).await })
    };

    tokio::time::sleep(Duration::from_millis(150)).await;
    coordinator.shutdown().await;

    let result = batch.await.unwrap().unwrap();
    assert_eq!(result.total(), 6);
    assert!(result.successes.is_empty());
    assert!(result
        .failures
        .values()
        .all(|err| err.kind() == ErrorKind::Cancelled));

    let err = coordinator.process_documents(docs(1), 1, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShutDown);
}

// =============================================================================
// Webhook mode
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_webhook_mode_resolves_through_dispatcher() {
    let client = Arc::new(InMemoryJobClient::new());
    let registry = Arc::new(PendingResults::new());
    let dispatcher = Arc::new(WebhookDispatcher::new());
    dispatcher.on_completed(resolve_pending_handler(Arc::clone(&registry)));

    let coordinator = BatchCoordinator::new(
        client.clone(),
        BatchConfig::default().with_webhook(Arc::clone(&registry), Duration::from_secs(60)),
    );

    // Delivers a completion for each job once its waiter is registered
    let notifier = {
        let client = Arc::clone(&client);
        let registry = Arc::clone(&registry);
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            let mut delivered = 0;
            while delivered < 4 {
                for i in 0..4 {
                    let Some(job_id) = client.job_id_for(format!("invoice-{i}.pdf")) else {
                        continue;
                    };
                    if registry.contains(&WaitKey::Job(job_id.clone())) {
                        let payload = json!({
                            "process_id": job_id,
                            "pages": i + 1,
                            "confidence_score": 0.9,
                        });
                        dispatcher
                            .dispatch(EVENT_COMPLETED, &payload.to_string())
                            .unwrap();
                        delivered += 1;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    let result = coordinator.process_documents(docs(4), 2, None).await.unwrap();
    notifier.await.unwrap();

    assert!(result.all_successful());
    assert_eq!(result.successes.len(), 4);
    let mut pages: Vec<u32> = result
        .successes
        .iter()
        .filter_map(|r| r.page_count)
        .collect();
    pages.sort_unstable();
    assert_eq!(pages, vec![1, 2, 3, 4]);
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_webhook_mode_times_out_without_notification() {
    let registry = Arc::new(PendingResults::new());
    let coordinator = BatchCoordinator::new(
        Arc::new(InMemoryJobClient::new()),
        BatchConfig::default().with_webhook(Arc::clone(&registry), Duration::from_secs(5)),
    );

    let result = coordinator.process_documents(docs(2), 2, None).await.unwrap();

    assert_eq!(result.failures.len(), 2);
    assert!(result
        .failures
        .values()
        .all(|err| err.kind() == ErrorKind::Timeout));
    assert!(registry.is_empty());
}
