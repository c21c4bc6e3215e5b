//! Data model for document jobs, results and batch aggregation

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DocflowError, Result};

/// Kind of document submitted for processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocType {
    Invoice,
    ExportDeclaration,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Invoice => "INVOICE",
            DocType::ExportDeclaration => "EXPORT_DECLARATION",
        }
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocType {
    type Err = DocflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "INVOICE" => Ok(DocType::Invoice),
            "EXPORT_DECLARATION" => Ok(DocType::ExportDeclaration),
            other => Err(DocflowError::malformed(format!("unknown document type: {other}"))),
        }
    }
}

/// Country the document originates from (ISO-3166 alpha-2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CountryCode {
    Es,
    Pt,
    Fr,
    De,
    It,
    Gb,
    Us,
    Mx,
}

impl CountryCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CountryCode::Es => "ES",
            CountryCode::Pt => "PT",
            CountryCode::Fr => "FR",
            CountryCode::De => "DE",
            CountryCode::It => "IT",
            CountryCode::Gb => "GB",
            CountryCode::Us => "US",
            CountryCode::Mx => "MX",
        }
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CountryCode {
    type Err = DocflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ES" => Ok(CountryCode::Es),
            "PT" => Ok(CountryCode::Pt),
            "FR" => Ok(CountryCode::Fr),
            "DE" => Ok(CountryCode::De),
            "IT" => Ok(CountryCode::It),
            "GB" => Ok(CountryCode::Gb),
            "US" => Ok(CountryCode::Us),
            "MX" => Ok(CountryCode::Mx),
            other => Err(DocflowError::malformed(format!("unknown country code: {other}"))),
        }
    }
}

/// Remote job status, re-fetched on every poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Processing finished; the result can be fetched
    #[serde(rename = "UPLOADED", alias = "DONE", alias = "COMPLETED")]
    Done,
    /// Still being processed
    #[serde(rename = "IN_PROGRESS", alias = "PENDING")]
    InProgress,
    /// Processing failed; terminal
    #[serde(rename = "FAILED")]
    Failed,
}

impl JobStatus {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Done => f.write_str("UPLOADED"),
            JobStatus::InProgress => f.write_str("IN_PROGRESS"),
            JobStatus::Failed => f.write_str("FAILED"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = DocflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "UPLOADED" | "DONE" | "COMPLETED" => Ok(JobStatus::Done),
            "IN_PROGRESS" | "PENDING" => Ok(JobStatus::InProgress),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(DocflowError::malformed(format!("unknown job status: {other}"))),
        }
    }
}

/// Everything needed to submit one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRequest {
    /// User the document is tracked under
    pub user: String,
    pub doc_type: DocType,
    pub source_path: PathBuf,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub country_code: Option<CountryCode>,
}

impl DocumentRequest {
    pub fn new(user: impl Into<String>, doc_type: DocType, source_path: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            doc_type,
            source_path: source_path.into(),
            metadata: BTreeMap::new(),
            country_code: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_country(mut self, country_code: CountryCode) -> Self {
        self.country_code = Some(country_code);
        self
    }
}

/// Acknowledgement returned by a successful submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job_id: String,
    pub initial_status: JobStatus,
}

/// One status check response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub job_id: String,
    pub status: JobStatus,
}

/// A submitted job. The id is assigned by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub doc_type: DocType,
    pub source_path: PathBuf,
    pub metadata: BTreeMap<String, String>,
    pub country_code: Option<CountryCode>,
}

impl Job {
    pub fn from_submission(request: &DocumentRequest, receipt: &SubmitReceipt) -> Self {
        Self {
            id: receipt.job_id.clone(),
            doc_type: request.doc_type,
            source_path: request.source_path.clone(),
            metadata: request.metadata.clone(),
            country_code: request.country_code,
        }
    }
}

/// Typed view over a terminal result payload
///
/// Absent or null payload fields stay `None`; nothing is defaulted to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedResult {
    pub job_id: Option<String>,
    pub extracted_text: Option<String>,
    pub page_count: Option<u32>,
    /// Confidence in \[0, 1\] as reported by the service (not clamped)
    pub confidence_score: Option<f64>,
    pub result_url: Option<String>,
    pub status: Option<String>,
    pub structured_data: Option<Map<String, Value>>,
    pub observed_at: DateTime<Utc>,
}

impl ProcessedResult {
    /// Build a result from a payload returned by the service or carried by a webhook
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let object = payload
            .as_object()
            .ok_or_else(|| DocflowError::malformed("result payload is not a JSON object"))?;

        let job_id = match string_field(object, "process_id")? {
            Some(id) => Some(id),
            None => string_field(object, "job_id")?,
        };

        let structured_data = match object.get("structured_data") {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map.clone()),
            Some(other) => {
                return Err(DocflowError::malformed(format!(
                    "structured_data must be an object, got {other}"
                )))
            }
        };

        Ok(Self {
            job_id,
            extracted_text: string_field(object, "extracted_text")?,
            page_count: u32_field(object, "pages")?,
            confidence_score: f64_field(object, "confidence_score")?,
            result_url: string_field(object, "url")?,
            status: string_field(object, "status")?,
            structured_data,
            observed_at: Utc::now(),
        })
    }

    /// Like [`from_payload`](Self::from_payload), filling in the job id when the payload omits it
    pub fn from_job_payload(job_id: &str, payload: &Value) -> Result<Self> {
        let mut result = Self::from_payload(payload)?;
        if result.job_id.is_none() {
            result.job_id = Some(job_id.to_string());
        }
        Ok(result)
    }

    pub fn extracted_text_or_empty(&self) -> &str {
        self.extracted_text.as_deref().unwrap_or("")
    }

    /// True only when a score is present and at least `threshold`
    pub fn meets_confidence_threshold(&self, threshold: f64) -> bool {
        self.confidence_score
            .is_some_and(|score| score >= threshold)
    }

    pub fn structured_field(&self, name: &str) -> Option<&Value> {
        self.structured_data.as_ref()?.get(name)
    }

    pub fn structured_field_as_string(&self, name: &str) -> Option<String> {
        self.structured_field(name).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

fn present<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    object.get(key).filter(|value| !value.is_null())
}

fn string_field(object: &Map<String, Value>, key: &str) -> Result<Option<String>> {
    match present(object, key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(DocflowError::malformed(format!(
            "field {key} must be a string, got {other}"
        ))),
    }
}

fn u32_field(object: &Map<String, Value>, key: &str) -> Result<Option<u32>> {
    match present(object, key) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| {
                DocflowError::malformed(format!(
                    "field {key} must be a non-negative integer, got {value}"
                ))
            }),
    }
}

fn f64_field(object: &Map<String, Value>, key: &str) -> Result<Option<f64>> {
    match present(object, key) {
        None => Ok(None),
        Some(value) => value.as_f64().map(Some).ok_or_else(|| {
            DocflowError::malformed(format!("field {key} must be a number, got {value}"))
        }),
    }
}

/// Live counters reported after each job in a batch finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

impl BatchProgress {
    /// Jobs not yet finished
    pub fn pending(&self) -> usize {
        self.total.saturating_sub(self.completed + self.failed)
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.completed + self.failed) as f64 / self.total as f64 * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.pending() == 0
    }
}

/// Position and source of a job inside one batch call
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobRef {
    pub index: usize,
    pub source_path: PathBuf,
}

impl JobRef {
    pub fn new(index: usize, source_path: &Path) -> Self {
        Self {
            index,
            source_path: source_path.to_path_buf(),
        }
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.index, self.source_path.display())
    }
}

/// Aggregated outcome of one batch call
///
/// `successes.len() + failures.len()` always equals the number of submitted jobs.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub successes: Vec<ProcessedResult>,
    pub failures: BTreeMap<JobRef, DocflowError>,
}

impl BatchResult {
    pub fn total(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    /// Share of successful jobs as a percentage
    pub fn success_rate(&self) -> f64 {
        if self.total() == 0 {
            return 0.0;
        }
        self.successes.len() as f64 / self.total() as f64 * 100.0
    }

    pub fn all_successful(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn high_confidence_results(&self, threshold: f64) -> Vec<&ProcessedResult> {
        self.successes
            .iter()
            .filter(|result| result.meets_confidence_threshold(threshold))
            .collect()
    }
}
