// HTTP client for the remote document-processing API

use std::path::Path;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::instrument;

use super::RemoteJobClient;
use crate::error::{DocflowError, Result};
use crate::model::{DocumentRequest, JobStatus, StatusReport, SubmitReceipt};

/// Upload size ceiling (10 MiB)
pub const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct JobEnvelope {
    #[serde(default, alias = "process_id", alias = "id")]
    job_id: Option<String>,
    status: String,
}

/// reqwest-backed [`RemoteJobClient`]
pub struct HttpJobClient {
    base_url: String,
    api_key: String,
    webhook_url: Option<String>,
    http: reqwest::Client,
}

impl HttpJobClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Self {
        Self::with_http_client(base_url, api_key, reqwest::Client::new())
    }

    /// Use a preconfigured reqwest client (timeouts, proxies)
    pub fn with_http_client(
        base_url: &str,
        api_key: impl Into<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            webhook_url: None,
            http,
        }
    }

    /// Base URL the service should deliver webhook notifications to
    pub fn with_webhook_url(mut self, webhook_url: impl Into<String>) -> Self {
        self.webhook_url = Some(webhook_url.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check_response(
        response: reqwest::Response,
        job_id: Option<&str>,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        let subject = job_id.unwrap_or("request").to_string();

        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                DocflowError::Authentication(if message.is_empty() {
                    status.to_string()
                } else {
                    message
                })
            }
            StatusCode::NOT_FOUND => DocflowError::NotFound(subject),
            StatusCode::CONFLICT => DocflowError::NotReady { job_id: subject },
            _ if status.is_server_error() => DocflowError::Server {
                status_code: status.as_u16(),
                message,
            },
            _ => DocflowError::Rejected {
                status_code: status.as_u16(),
                message,
            },
        })
    }

    async fn read_envelope(response: reqwest::Response) -> Result<JobEnvelope> {
        response
            .json::<JobEnvelope>()
            .await
            .map_err(|e| DocflowError::malformed(format!("unexpected job response: {e}")))
    }
}

/// Reject files the service would refuse before spending an upload on them
async fn validate_upload(path: &Path) -> Result<u64> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| DocflowError::file_validation(path, format!("cannot access file: {e}")))?;

    if !metadata.is_file() {
        return Err(DocflowError::file_validation(path, "not a regular file"));
    }
    if metadata.len() > MAX_UPLOAD_BYTES {
        return Err(DocflowError::file_validation(
            path,
            format!(
                "file is {} bytes, must be at most {} bytes (10 MB)",
                metadata.len(),
                MAX_UPLOAD_BYTES
            ),
        ));
    }
    Ok(metadata.len())
}

fn transport_error(err: reqwest::Error) -> DocflowError {
    DocflowError::network(err.to_string())
}

#[async_trait]
impl RemoteJobClient for HttpJobClient {
    #[instrument(skip(self, request), fields(path = %request.source_path.display(), doc_type = %request.doc_type))]
    async fn submit(&self, request: &DocumentRequest) -> Result<SubmitReceipt> {
        let size = validate_upload(&request.source_path).await?;
        let bytes = tokio::fs::read(&request.source_path).await.map_err(|e| {
            DocflowError::file_validation(&request.source_path, format!("cannot read file: {e}"))
        })?;

        let file_name = request
            .source_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        let metadata = serde_json::to_string(&request.metadata)
            .map_err(|e| DocflowError::Internal(format!("failed to encode metadata: {e}")))?;

        let file_part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/octet-stream")
            .map_err(|e| DocflowError::Internal(format!("failed to build upload part: {e}")))?;
        let mut form = Form::new()
            .part("file", file_part)
            .text("user", request.user.clone())
            .text("doc_type", request.doc_type.to_string())
            .text("metadata", metadata);
        if let Some(country) = request.country_code {
            form = form.text("country_code", country.to_string());
        }
        if let Some(webhook_url) = &self.webhook_url {
            form = form.text("webhook_url", webhook_url.clone());
        }

        tracing::debug!(bytes = size, "uploading document");

        let response = self
            .http
            .post(self.url("/documents"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;
        let response = Self::check_response(response, None)
            .await
            .map_err(|err| match err {
                DocflowError::Rejected {
                    status_code: 413,
                    message,
                } => DocflowError::file_validation(
                    &request.source_path,
                    format!("rejected by the service as too large: {message}"),
                ),
                other => other,
            })?;
        let envelope = Self::read_envelope(response).await?;

        let job_id = envelope
            .job_id
            .ok_or_else(|| DocflowError::malformed("submit response carries no job id"))?;
        let initial_status = envelope.status.parse::<JobStatus>()?;

        tracing::info!(job_id = %job_id, status = %initial_status, "document submitted");

        Ok(SubmitReceipt {
            job_id,
            initial_status,
        })
    }

    #[instrument(skip(self))]
    async fn get_status(&self, job_id: &str) -> Result<StatusReport> {
        let response = self
            .http
            .get(self.url(&format!("/documents/{job_id}/status")))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        let response = Self::check_response(response, Some(job_id)).await?;
        let envelope = Self::read_envelope(response).await?;

        Ok(StatusReport {
            job_id: envelope.job_id.unwrap_or_else(|| job_id.to_string()),
            status: envelope.status.parse()?,
        })
    }

    #[instrument(skip(self))]
    async fn get_result(&self, job_id: &str) -> Result<Value> {
        let response = self
            .http
            .get(self.url(&format!("/documents/{job_id}/result")))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        let response = Self::check_response(response, Some(job_id)).await?;

        response
            .json::<Value>()
            .await
            .map_err(|e| DocflowError::malformed(format!("result body is not JSON: {e}")))
    }
}
