// Application configuration loaded from the environment
//
// Decision: API key and webhook URL are only demanded by commands that talk to
// the remote service, so `serve` and `--simulate` runs work without them.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const DEFAULT_USER: &str = "example-user";
const DEFAULT_WEBHOOK_PORT: u16 = 8080;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("invalid DOCFLOW_ENVIRONMENT '{0}', expected 'prod' or 'sandbox'")]
    InvalidEnvironment(String),

    #[error("invalid DOCFLOW_WEBHOOK_PORT '{0}', expected a number between 1 and 65535")]
    InvalidPort(String),
}

/// Remote service environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Environment {
    Prod,
    #[default]
    Sandbox,
}

impl Environment {
    /// Default API base URL for this environment
    pub fn base_url(&self) -> &'static str {
        match self {
            Environment::Prod => "https://api.docflow.io/v1",
            Environment::Sandbox => "https://sandbox.api.docflow.io/v1",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Prod => f.write_str("prod"),
            Environment::Sandbox => f.write_str("sandbox"),
        }
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "prod" | "production" => Ok(Environment::Prod),
            "sandbox" | "sand_box" | "" => Ok(Environment::Sandbox),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: Option<String>,
    pub webhook_url: Option<String>,
    pub environment: Environment,
    pub api_url: String,
    pub user: String,
    pub webhook_port: u16,
}

impl AppConfig {
    /// Load configuration from environment variables
    ///
    /// - `DOCFLOW_API_KEY`: API credential
    /// - `DOCFLOW_WEBHOOK_URL`: public base URL webhooks are delivered to
    /// - `DOCFLOW_ENVIRONMENT`: `prod` or `sandbox` (default)
    /// - `DOCFLOW_API_URL`: overrides the environment's base URL
    /// - `DOCFLOW_USER`: user documents are tracked under (default `example-user`)
    /// - `DOCFLOW_WEBHOOK_PORT`: local listener port (default 8080)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let environment = match non_empty("DOCFLOW_ENVIRONMENT") {
            Some(value) => value.parse()?,
            None => Environment::default(),
        };

        let webhook_port = match non_empty("DOCFLOW_WEBHOOK_PORT") {
            Some(value) => parse_port(&value)?,
            None => DEFAULT_WEBHOOK_PORT,
        };

        Ok(Self {
            api_key: non_empty("DOCFLOW_API_KEY"),
            webhook_url: non_empty("DOCFLOW_WEBHOOK_URL"),
            environment,
            api_url: non_empty("DOCFLOW_API_URL")
                .unwrap_or_else(|| environment.base_url().to_string()),
            user: non_empty("DOCFLOW_USER").unwrap_or_else(|| DEFAULT_USER.to_string()),
            webhook_port,
        })
    }

    /// Credentials needed to reach the remote service
    pub fn remote_credentials(&self) -> Result<(&str, &str), ConfigError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(ConfigError::Missing("DOCFLOW_API_KEY"))?;
        let webhook_url = self
            .webhook_url
            .as_deref()
            .ok_or(ConfigError::Missing("DOCFLOW_WEBHOOK_URL"))?;
        Ok((api_key, webhook_url))
    }
}

fn parse_port(value: &str) -> Result<u16, ConfigError> {
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort(value.to_string())),
    }
}
