// Command implementations

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use docflow_core::{
    resolve_pending_handler, BatchConfig, BatchCoordinator, BatchProgress, BatchResult,
    CountryCode, DocType, DocflowError, DocumentRequest, DocumentService, ErrorKind,
    HttpJobClient, InMemoryJobClient, JobStatus, PendingResults, PollConfig, ProcessedResult,
    ProgressCallback, RemoteJobClient, WebhookDispatcher,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::webhook;

/// Waiters older than this are cancelled by the background sweeper
const ABANDONED_WAITER_AGE: Duration = Duration::from_secs(3600);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Shared wiring for every command
///
/// The remote client is built on demand so the listener-only `serve` command
/// runs without API credentials.
pub struct App {
    pub config: AppConfig,
    pub poll: PollConfig,
    pub registry: Arc<PendingResults>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub simulate: bool,
    pub shutdown: CancellationToken,
}

impl App {
    pub fn new(config: AppConfig, simulate: bool, shutdown: CancellationToken) -> Self {
        let poll = if simulate {
            PollConfig::default()
                .with_initial_delay(Duration::from_millis(250))
                .with_max_delay(Duration::from_secs(2))
        } else {
            PollConfig::default()
        };

        let registry = Arc::new(PendingResults::new());
        let dispatcher = Arc::new(WebhookDispatcher::new());
        dispatcher.on_completed(resolve_pending_handler(Arc::clone(&registry)));
        dispatcher.on_ready_for_review(resolve_pending_handler(Arc::clone(&registry)));

        Self {
            config,
            poll,
            registry,
            dispatcher,
            simulate,
            shutdown,
        }
    }

    /// Client for the document service, or the simulator with `--simulate`
    fn client(&self) -> Result<Arc<dyn RemoteJobClient>> {
        if self.simulate {
            return Ok(Arc::new(
                InMemoryJobClient::new()
                    .with_default_script(vec![
                        JobStatus::InProgress,
                        JobStatus::InProgress,
                        JobStatus::Done,
                    ])
                    .with_latency(Duration::from_millis(50)),
            ));
        }

        let (api_key, webhook_url) = self.config.remote_credentials()?;
        Ok(Arc::new(
            HttpJobClient::new(&self.config.api_url, api_key).with_webhook_url(webhook_url),
        ))
    }

    fn spawn_listener(&self) -> JoinHandle<Result<()>> {
        tokio::spawn(webhook::serve(
            Arc::clone(&self.dispatcher),
            self.config.webhook_port,
            self.shutdown.child_token(),
        ))
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.registry
            .spawn_sweeper(SWEEP_INTERVAL, ABANDONED_WAITER_AGE, self.shutdown.child_token())
    }

    fn request(
        &self,
        file: PathBuf,
        doc_type: DocType,
        country: Option<CountryCode>,
        metadata: &BTreeMap<String, String>,
    ) -> DocumentRequest {
        let mut request = DocumentRequest::new(self.config.user.clone(), doc_type, file);
        request.metadata = metadata.clone();
        request.country_code = country;
        request
    }
}

/// Run only the webhook listener until Ctrl-C
pub async fn serve(app: &App) -> Result<()> {
    let sweeper = app.spawn_sweeper();
    println!(
        "Listening for webhooks on port {} (POST /webhooks/ready, POST /webhooks/completed)",
        app.config.webhook_port
    );

    let served = webhook::serve(
        Arc::clone(&app.dispatcher),
        app.config.webhook_port,
        app.shutdown.clone(),
    )
    .await;

    app.shutdown.cancel();
    let _ = sweeper.await;
    served
}

pub struct UploadArgs {
    pub file: PathBuf,
    pub doc_type: DocType,
    pub country: Option<CountryCode>,
    pub metadata: BTreeMap<String, String>,
    pub wait_timeout: Duration,
    pub poll: bool,
}

/// Upload one document and wait for its result
pub async fn upload(app: &App, args: UploadArgs) -> Result<()> {
    let client = app.client()?;
    let service = DocumentService::new(Arc::clone(&client)).with_poll_config(app.poll.clone());
    let request = app.request(args.file, args.doc_type, args.country, &args.metadata);

    // Simulated jobs never send webhooks
    let result = if args.poll || app.simulate {
        let job = service.upload(&request).await?;
        println!("Uploaded {} as job {}, polling for completion", request.source_path.display(), job.id);
        tokio::select! {
            _ = app.shutdown.cancelled() => {
                return Err(DocflowError::cancelled("interrupted while polling").into());
            }
            result = docflow_core::poll_until_done(client.as_ref(), &job.id, &app.poll) => result?,
        }
    } else {
        let listener = app.spawn_listener();
        let job = service.upload(&request).await?;
        println!(
            "Uploaded {} as job {}, waiting up to {}s for webhook",
            request.source_path.display(),
            job.id,
            args.wait_timeout.as_secs()
        );
        let outcome = app
            .registry
            .wait_cancellable(job.id.as_str(), args.wait_timeout, &app.shutdown)
            .await;
        app.shutdown.cancel();
        join_listener(listener).await;
        outcome?
    };

    print_result(&result);
    Ok(())
}

pub struct BatchArgs {
    pub files: Vec<PathBuf>,
    pub doc_type: DocType,
    pub country: Option<CountryCode>,
    pub concurrency: usize,
    pub webhook: bool,
    pub wait_timeout: Duration,
}

/// Process several documents with bounded concurrency
pub async fn batch(app: &App, args: BatchArgs) -> Result<()> {
    let client = app.client()?;
    let use_webhooks = args.webhook && !app.simulate;
    let mut config = BatchConfig::default().with_poll(app.poll.clone());
    let mut background = Vec::new();
    if use_webhooks {
        config = config.with_webhook(Arc::clone(&app.registry), args.wait_timeout);
        background.push(app.spawn_listener());
    }

    let coordinator = BatchCoordinator::new(client, config);
    let jobs: Vec<DocumentRequest> = args
        .files
        .into_iter()
        .map(|file| app.request(file, args.doc_type, args.country, &BTreeMap::new()))
        .collect();

    println!(
        "Processing {} document(s) with concurrency {}",
        jobs.len(),
        args.concurrency
    );
    let on_progress: ProgressCallback = Arc::new(print_progress);

    let result = coordinator
        .process_documents_until(jobs, args.concurrency, Some(on_progress), &app.shutdown)
        .await
        .context("Batch processing failed")?;

    coordinator.shutdown().await;
    app.shutdown.cancel();
    for handle in background {
        join_listener(handle).await;
    }

    print_batch_summary(&result);
    if result.all_successful() {
        Ok(())
    } else {
        anyhow::bail!("{} of {} document(s) failed", result.failures.len(), result.total())
    }
}

async fn join_listener(handle: JoinHandle<Result<()>>) {
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "webhook listener failed"),
        Err(e) => tracing::error!(error = %e, "webhook listener task aborted"),
    }
}

fn print_progress(progress: BatchProgress) {
    println!(
        "  [{:>5.1}%] {} done, {} failed, {} pending",
        progress.completion_percentage(),
        progress.completed,
        progress.failed,
        progress.pending()
    );
}

fn print_result(result: &ProcessedResult) {
    println!("Job:        {}", result.job_id.as_deref().unwrap_or("-"));
    println!("Status:     {}", result.status.as_deref().unwrap_or("-"));
    println!(
        "Pages:      {}",
        result.page_count.map_or("-".to_string(), |p| p.to_string())
    );
    println!(
        "Confidence: {}",
        result
            .confidence_score
            .map_or("-".to_string(), |c| format!("{:.1}%", c * 100.0))
    );
    if let Some(url) = &result.result_url {
        println!("Result URL: {url}");
    }
    if let Some(data) = &result.structured_data {
        for (key, value) in data {
            println!("  {key}: {value}");
        }
    }
    let text = result.extracted_text_or_empty();
    if !text.is_empty() {
        println!("---\n{text}");
    }
}

fn print_batch_summary(result: &BatchResult) {
    println!(
        "\n{} succeeded, {} failed ({:.1}% success)",
        result.successes.len(),
        result.failures.len(),
        result.success_rate()
    );
    for (job, err) in &result.failures {
        println!("  {job}: {err}");
        if let Some(hint) = hint(err) {
            println!("    hint: {hint}");
        }
    }
}

/// Actionable suggestion for an error category
pub fn hint(err: &DocflowError) -> Option<&'static str> {
    match err.kind() {
        ErrorKind::FileValidation => {
            Some("Check that the file exists, is readable and is smaller than 10 MB")
        }
        ErrorKind::Authentication => Some("Check that DOCFLOW_API_KEY is set to a valid key"),
        ErrorKind::Network => Some("Check your network connection and DOCFLOW_API_URL"),
        ErrorKind::Server => Some("The document service is having trouble, retry later"),
        ErrorKind::Rejected => {
            Some("The service refused the request, check the document type and metadata")
        }
        ErrorKind::Timeout => {
            Some("Processing is taking longer than expected, retry with a larger --wait-timeout")
        }
        ErrorKind::RemoteJobFailed => {
            Some("The service could not process the document, check that the document type is correct")
        }
        _ => None,
    }
}

/// Parse a `key=value` metadata argument
pub fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid metadata '{s}', expected key=value"))?;
    if key.trim().is_empty() {
        return Err(format!("invalid metadata '{s}', key is empty"));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("invoice_number=INV-001").unwrap(),
            ("invoice_number".to_string(), "INV-001".to_string())
        );
        assert_eq!(
            parse_key_val("note=a=b").unwrap(),
            ("note".to_string(), "a=b".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_hints_cover_user_actionable_errors() {
        assert!(hint(&DocflowError::file_validation("a.pdf", "too big"))
            .unwrap()
            .contains("10 MB"));
        assert!(hint(&DocflowError::Authentication("bad".into()))
            .unwrap()
            .contains("DOCFLOW_API_KEY"));
        assert!(hint(&DocflowError::Rejected {
            status_code: 422,
            message: "bad metadata".into()
        })
        .unwrap()
        .contains("refused"));
        assert!(hint(&DocflowError::ShutDown).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_batch_succeeds() {
        let config = AppConfig::from_lookup(|_| None).unwrap();
        let app = App::new(config, true, CancellationToken::new());

        let args = BatchArgs {
            files: vec!["a.pdf".into(), "b.pdf".into(), "c.pdf".into()],
            doc_type: DocType::Invoice,
            country: None,
            concurrency: 2,
            webhook: false,
            wait_timeout: Duration::from_secs(5),
        };

        batch(&app, args).await.unwrap();
    }

    #[test]
    fn test_remote_mode_requires_credentials() {
        let config = AppConfig::from_lookup(|_| None).unwrap();
        let app = App::new(config, false, CancellationToken::new());
        let err = app.client().err().unwrap();
        assert!(err.to_string().contains("DOCFLOW_API_KEY"));
    }

    #[tokio::test]
    async fn test_upload_without_credentials_fails_before_io() {
        let config = AppConfig::from_lookup(|_| None).unwrap();
        let app = App::new(config, false, CancellationToken::new());

        let args = UploadArgs {
            file: "a.pdf".into(),
            doc_type: DocType::Invoice,
            country: None,
            metadata: BTreeMap::new(),
            wait_timeout: Duration::from_secs(1),
            poll: true,
        };

        let err = upload(&app, args).await.unwrap_err();
        assert!(err.to_string().contains("DOCFLOW_API_KEY"));
    }

    #[tokio::test]
    async fn test_serve_runs_without_credentials() {
        let mut config = AppConfig::from_lookup(|_| None).unwrap();
        config.webhook_port = 0;
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let app = App::new(config, false, shutdown);

        serve(&app).await.unwrap();
    }
}
