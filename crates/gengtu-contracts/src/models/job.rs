use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SizePreset;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// `completed` and `failed` never transition again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One answer-to-picture unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub job_id: String,
    pub account_id: String,
    pub answer: String,
    pub size: SizePreset,
    pub prompt: Option<String>,
    pub image_url: Option<String>,
    pub status: JobStatus,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl GenerationJob {
    pub fn pending(account_id: impl Into<String>, answer: impl Into<String>, size: SizePreset) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            answer: answer.into(),
            size,
            prompt: None,
            image_url: None,
            status: JobStatus::Pending,
            failure: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub(crate) fn complete(&mut self, prompt: String, image_url: String) {
        self.prompt = Some(prompt);
        self.image_url = Some(image_url);
        self.status = JobStatus::Completed;
        self.failure = None;
        self.finished_at = Some(Utc::now());
    }

    /// A prompt produced before the failure is kept for diagnostics.
    pub(crate) fn fail(&mut self, prompt: Option<String>, reason: String) {
        if prompt.is_some() {
            self.prompt = prompt;
        }
        self.status = JobStatus::Failed;
        self.failure = Some(reason);
        self.finished_at = Some(Utc::now());
    }
}
