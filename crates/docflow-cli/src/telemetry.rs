// Tracing subscriber setup
//
// Log filter comes from RUST_LOG, falling back to LOG_LEVEL.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "docflow=info,docflow_core=info,tower_http=info";

/// Filter directive from the environment, or the default
fn log_filter<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|f| !f.trim().is_empty());
    non_empty("RUST_LOG")
        .or_else(|| non_empty("LOG_LEVEL"))
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

pub fn init_tracing() {
    let directive = log_filter(|key| std::env::var(key).ok());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .init();
}
