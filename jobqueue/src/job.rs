use std::{
    fmt::Display,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub(crate) mod runner;

/// The loosely typed arguments of a job: a JSON object.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Identifies a job for the lifetime of the process.
///
/// Ids are issued from a process wide counter so two jobs never share an id, no matter how
/// quickly they are created.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(u64);

impl JobId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl From<JobId> for u64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job_{}", self.0)
    }
}

/// One unit of asynchronous work.
///
/// A job is owned by exactly one worker while it is being processed. Handlers only ever see a
/// shared reference, changes to the lifecycle fields are made by the queue itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: Payload,
    /// Number of times the handler has been invoked, including the current invocation.
    pub attempts: u32,
    pub max_retry: u32,
    pub status: JobStatus,
    /// The most recent error, kept across retries until a newer one replaces it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub(crate) fn new(job_type: impl Into<String>, payload: Payload, max_retry: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::next(),
            job_type: job_type.into(),
            payload,
            attempts: 0,
            max_retry,
            status: JobStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Decodes the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(self.payload.clone()))
    }

    /// Whether a failure of the current attempt would still be retried.
    pub fn has_retries_remaining(&self) -> bool {
        self.attempts < self.max_retry
    }

    pub(crate) fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.transition(JobStatus::Processing);
    }

    pub(crate) fn mark_completed(&mut self) {
        self.transition(JobStatus::Completed);
    }

    pub(crate) fn mark_retrying(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.transition(JobStatus::Retrying);
    }

    pub(crate) fn mark_failed(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.transition(JobStatus::Failed);
    }

    fn transition(&mut self, status: JobStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl JobStatus {
    /// `Completed` and `Failed` are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
