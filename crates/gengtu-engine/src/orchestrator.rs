//! One answer in, one picture out, at most one credit spent.
//!
//! ```text
//! pending --text ok, image ok, debit ok--> completed
//! pending --any failure------------------> failed
//! ```
//!
//! The debit and the `completed` transition are a single ledger commit. Every
//! earlier failure moves the job to `failed` without touching the balance.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use gengtu_contracts::journal::{JobEvent, JobJournal};
use gengtu_contracts::ledger::{JobCompletion, JobFailure, Ledger, LedgerError};
use gengtu_contracts::models::{Account, GenerationJob, SizePreset};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::GenerationError;
use crate::images::{GeneratedImage, ImageGenerator};
use crate::text::PromptGenerator;

#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutcome {
    pub job: GenerationJob,
    pub account: Account,
    pub image_path: PathBuf,
    pub english_prompt: String,
}

pub struct GenerationOrchestrator {
    text: Arc<dyn PromptGenerator>,
    image: Arc<dyn ImageGenerator>,
    ledger: Arc<dyn Ledger>,
    public_prefix: String,
    journal: Option<JobJournal>,
}

impl GenerationOrchestrator {
    pub fn new(
        text: Arc<dyn PromptGenerator>,
        image: Arc<dyn ImageGenerator>,
        ledger: Arc<dyn Ledger>,
        public_prefix: impl Into<String>,
    ) -> Self {
        Self {
            text,
            image,
            ledger,
            public_prefix: public_prefix.into().trim_end_matches('/').to_string(),
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: JobJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn run(
        &self,
        account_id: &str,
        answer: &str,
        size: SizePreset,
    ) -> Result<GenerationOutcome, GenerationError> {
        let answer = answer.trim();
        if answer.is_empty() {
            return Err(GenerationError::MissingAnswer);
        }
        let account =
            self.ledger
                .account(account_id)?
                .ok_or_else(|| GenerationError::UnknownAccount {
                    account_id: account_id.to_string(),
                })?;
        if !account.can_start_job() {
            tracing::warn!(account_id, "rejected: no credits left");
            return Err(GenerationError::InsufficientCredits {
                account_id: account_id.to_string(),
            });
        }

        let job = self.ledger.create_job(account_id, answer, size)?;
        let _span = tracing::info_span!("generation", job_id = %job.job_id, account_id).entered();
        tracing::info!(size = size.as_str(), "job created");
        self.record(
            JobEvent::Created,
            &job,
            object(json!({ "answer": answer, "size": size.as_str() })),
        );

        let pair = match self.text.generate_prompt(answer) {
            Ok(pair) => pair,
            Err(err) => return Err(self.abandon(&job.job_id, None, err)),
        };
        let (width, height) = size.dimensions();
        tracing::info!(backend = self.text.name(), width, height, "prompt ready, requesting image");
        let image = match self.image.generate_image(&pair.chinese, width, height) {
            Ok(image) => image,
            Err(err) => return Err(self.abandon(&job.job_id, Some(pair.chinese), err)),
        };

        let completion = JobCompletion {
            prompt: pair.chinese.clone(),
            image_url: format!("{}/{}", self.public_prefix, image.file_name),
        };
        match self.ledger.commit_job(&job.job_id, completion) {
            Ok(receipt) => {
                tracing::info!(
                    image_url = receipt.job.image_url.as_deref().unwrap_or_default(),
                    credits_left = receipt.account.credits,
                    "job completed"
                );
                self.record(
                    JobEvent::Completed,
                    &receipt.job,
                    object(json!({
                        "image_url": receipt.job.image_url,
                        "credits_left": receipt.account.credits,
                    })),
                );
                Ok(GenerationOutcome {
                    job: receipt.job,
                    account: receipt.account,
                    image_path: image.path,
                    english_prompt: pair.english,
                })
            }
            Err(err) => {
                remove_orphan(&image);
                Err(self.abandon(&job.job_id, Some(pair.chinese), err.into()))
            }
        }
    }

    /// Moves the job to `failed` (unless the ledger already did) and hands the
    /// error back for the caller.
    fn abandon(&self, job_id: &str, prompt: Option<String>, err: GenerationError) -> GenerationError {
        tracing::warn!(kind = err.kind().as_str(), error = %err, "job failed");
        let failure = JobFailure {
            prompt,
            reason: err.to_string(),
        };
        let failed = match self.ledger.fail_job(job_id, failure) {
            Ok(job) => Some(job),
            Err(LedgerError::JobNotPending { .. }) => self.ledger.job(job_id).ok().flatten(),
            Err(ledger_err) => {
                tracing::error!(error = %ledger_err, "could not record job failure");
                None
            }
        };
        if let Some(job) = failed {
            self.record(
                JobEvent::Failed,
                &job,
                object(json!({ "error_kind": err.kind().as_str(), "reason": job.failure })),
            );
        }
        err
    }

    fn record(&self, event: JobEvent, job: &GenerationJob, extra: Map<String, Value>) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Err(err) = journal.record(event, job, extra) {
            tracing::warn!(error = %err, path = %journal.path().display(), "job journal write failed");
        }
    }
}

fn remove_orphan(image: &GeneratedImage) {
    if let Err(err) = fs::remove_file(&image.path) {
        tracing::warn!(path = %image.path.display(), error = %err, "failed to remove unreferenced image");
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
