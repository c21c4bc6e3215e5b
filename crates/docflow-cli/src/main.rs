// Docflow CLI
//
// Decision: Use clap derive for argument parsing, env vars as fallbacks.
// Decision: Ctrl-C cancels one shared token; listener, waits and batches all observe it.

mod commands;
mod config;
mod telemetry;
mod webhook;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use docflow_core::{CountryCode, DocType, DocflowError};
use tokio_util::sync::CancellationToken;

use crate::commands::{App, BatchArgs, UploadArgs};
use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "docflow")]
#[command(about = "Docflow - submit documents for remote processing and collect the results")]
#[command(version)]
pub struct Cli {
    /// Use an in-memory simulator instead of the remote service
    #[arg(long, global = true)]
    pub simulate: bool,

    /// API base URL (overrides the environment default)
    #[arg(long, global = true, env = "DOCFLOW_API_URL")]
    pub api_url: Option<String>,

    /// Local webhook listener port
    #[arg(long, global = true, env = "DOCFLOW_WEBHOOK_PORT")]
    pub port: Option<u16>,

    /// User documents are tracked under
    #[arg(long, global = true, env = "DOCFLOW_USER")]
    pub user: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the webhook listener only
    Serve,

    /// Upload one document and wait for the result
    Upload {
        /// Document to upload
        file: PathBuf,

        /// Document type (invoice, export-declaration)
        #[arg(long, default_value = "invoice")]
        doc_type: DocType,

        /// Country of origin (ISO-3166 alpha-2)
        #[arg(long)]
        country: Option<CountryCode>,

        /// Metadata entry, may be repeated
        #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = commands::parse_key_val)]
        meta: Vec<(String, String)>,

        /// Seconds to wait for the completion webhook
        #[arg(long, default_value = "300")]
        wait_timeout: u64,

        /// Poll the job status instead of waiting for a webhook
        #[arg(long)]
        poll: bool,
    },

    /// Upload several documents with bounded concurrency
    Batch {
        /// Documents to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Maximum documents in flight
        #[arg(long, default_value = "5")]
        concurrency: usize,

        /// Document type for every file
        #[arg(long, default_value = "invoice")]
        doc_type: DocType,

        /// Country of origin for every file
        #[arg(long)]
        country: Option<CountryCode>,

        /// Wait for webhooks instead of polling
        #[arg(long)]
        webhook: bool,

        /// Seconds to wait for each completion webhook
        #[arg(long, default_value = "300")]
        wait_timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let cli = Cli::parse();

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C, shutting down");
            ctrl_c.cancel();
        }
    });

    if let Err(err) = run(cli, shutdown).await {
        if let Some(hint) = err
            .downcast_ref::<DocflowError>()
            .and_then(commands::hint)
        {
            eprintln!("hint: {hint}");
        }
        return Err(err);
    }
    Ok(())
}

async fn run(cli: Cli, shutdown: CancellationToken) -> Result<()> {
    let mut config = AppConfig::from_env().context("Invalid configuration")?;
    if let Some(api_url) = cli.api_url {
        config.api_url = api_url;
    }
    if let Some(port) = cli.port {
        config.webhook_port = port;
    }
    if let Some(user) = cli.user {
        config.user = user;
    }

    tracing::debug!(
        environment = %config.environment,
        api_url = %config.api_url,
        simulate = cli.simulate,
        "configuration loaded"
    );

    let app = App::new(config, cli.simulate, shutdown);

    match cli.command {
        Commands::Serve => commands::serve(&app).await,
        Commands::Upload {
            file,
            doc_type,
            country,
            meta,
            wait_timeout,
            poll,
        } => {
            commands::upload(
                &app,
                UploadArgs {
                    file,
                    doc_type,
                    country,
                    metadata: meta.into_iter().collect(),
                    wait_timeout: Duration::from_secs(wait_timeout),
                    poll,
                },
            )
            .await
        }
        Commands::Batch {
            files,
            concurrency,
            doc_type,
            country,
            webhook,
            wait_timeout,
        } => {
            commands::batch(
                &app,
                BatchArgs {
                    files,
                    doc_type,
                    country,
                    concurrency,
                    webhook,
                    wait_timeout: Duration::from_secs(wait_timeout),
                },
            )
            .await
        }
    }
}
