//! Persistence seam for accounts and generation jobs.
//!
//! The orchestrator only ever talks to [`Ledger`]; the storage engine behind it
//! is interchangeable. [`JsonLedger`] keeps everything in a single JSON document
//! so that a credit debit and the job completion that pays for it land in the
//! same write.

mod json_store;

use thiserror::Error;

use crate::models::{Account, GenerationJob, JobStatus, SizePreset};

pub use json_store::JsonLedger;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("account not found: {account_id}")]
    UnknownAccount { account_id: String },

    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error("job {job_id} is already {status}")]
    JobNotPending { job_id: String, status: JobStatus },

    #[error("account {account_id} has no credits left")]
    InsufficientCredits { account_id: String },

    #[error("ledger lock poisoned")]
    Poisoned,

    #[error("ledger file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Everything the orchestrator writes when a job succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCompletion {
    pub prompt: String,
    pub image_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub prompt: Option<String>,
    pub reason: String,
}

/// State after a successful commit: the completed job and the debited account.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitReceipt {
    pub job: GenerationJob,
    pub account: Account,
}

pub trait Ledger: Send + Sync {
    fn account(&self, account_id: &str) -> Result<Option<Account>, LedgerError>;

    /// Creates or replaces an account with an exact balance.
    fn upsert_account(&self, account: Account) -> Result<Account, LedgerError>;

    /// Adds credits, creating the account when it does not exist yet.
    fn grant_credits(&self, account_id: &str, credits: u64) -> Result<Account, LedgerError>;

    /// Records a new `pending` job. Fails with `UnknownAccount` if the owner
    /// does not exist.
    fn create_job(
        &self,
        account_id: &str,
        answer: &str,
        size: SizePreset,
    ) -> Result<GenerationJob, LedgerError>;

    /// Moves a `pending` job to `failed` without touching any balance.
    fn fail_job(&self, job_id: &str, failure: JobFailure) -> Result<GenerationJob, LedgerError>;

    /// Compare-and-decrement commit. In one transaction: re-check the owner's
    /// balance, debit one credit and mark the job `completed`. When the balance
    /// is already zero the job is marked `failed` instead and
    /// `InsufficientCredits` is returned.
    fn commit_job(
        &self,
        job_id: &str,
        completion: JobCompletion,
    ) -> Result<CommitReceipt, LedgerError>;

    fn job(&self, job_id: &str) -> Result<Option<GenerationJob>, LedgerError>;

    /// Newest first.
    fn jobs_for_account(
        &self,
        account_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<GenerationJob>, LedgerError>;
}
