use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};

use super::{CommitReceipt, JobCompletion, JobFailure, Ledger, LedgerError};
use crate::models::{Account, GenerationJob, SizePreset};

const LEDGER_SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerState {
    schema_version: u64,
    #[serde(default)]
    accounts: BTreeMap<String, Account>,
    #[serde(default)]
    jobs: BTreeMap<String, GenerationJob>,
}

impl Default for LedgerState {
    fn default() -> Self {
        Self {
            schema_version: LEDGER_SCHEMA_VERSION,
            accounts: BTreeMap::new(),
            jobs: BTreeMap::new(),
        }
    }
}

impl LedgerState {
    fn pending_job_mut(&mut self, job_id: &str) -> Result<&mut GenerationJob, LedgerError> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| LedgerError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        if job.status.is_terminal() {
            return Err(LedgerError::JobNotPending {
                job_id: job_id.to_string(),
                status: job.status,
            });
        }
        Ok(job)
    }
}

enum CommitOutcome {
    Committed(CommitReceipt),
    Rejected { account_id: String },
}

/// Single-document JSON ledger.
///
/// Every mutation holds the instance mutex and an exclusive lock on
/// `<file>.lock`, re-reads the file, applies the change to that fresh state,
/// writes `<file>.tmp`, fsyncs and renames it over the ledger file. Handles in
/// other processes (or other handles in this one) therefore always debit the
/// balance the last writer left behind. Reads take a shared lock and refresh
/// the cached state.
#[derive(Debug)]
pub struct JsonLedger {
    path: Option<PathBuf>,
    state: Mutex<LedgerState>,
}

impl JsonLedger {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let state = read_state(&path)?;
        tracing::debug!(
            path = %path.display(),
            accounts = state.accounts.len(),
            jobs = state.jobs.len(),
            "ledger opened"
        );
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// A ledger that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read<T>(&self, view: impl FnOnce(&LedgerState) -> T) -> Result<T, LedgerError> {
        let mut guard = self.state.lock().map_err(|_| LedgerError::Poisoned)?;
        if let Some(path) = &self.path {
            let _file_lock = FileLock::shared(path)?;
            *guard = read_state(path)?;
        }
        Ok(view(&guard))
    }

    fn transact<T>(
        &self,
        apply: impl FnOnce(&mut LedgerState) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut guard = self.state.lock().map_err(|_| LedgerError::Poisoned)?;
        let _file_lock = match &self.path {
            Some(path) => {
                let lock = FileLock::exclusive(path)?;
                *guard = read_state(path)?;
                Some(lock)
            }
            None => None,
        };
        let mut next = guard.clone();
        let out = apply(&mut next)?;
        if let Some(path) = &self.path {
            write_state(path, &next)?;
        }
        *guard = next;
        Ok(out)
    }
}

impl Ledger for JsonLedger {
    fn account(&self, account_id: &str) -> Result<Option<Account>, LedgerError> {
        self.read(|state| state.accounts.get(account_id).cloned())
    }

    fn upsert_account(&self, account: Account) -> Result<Account, LedgerError> {
        self.transact(|state| {
            state
                .accounts
                .insert(account.account_id.clone(), account.clone());
            Ok(account)
        })
    }

    fn grant_credits(&self, account_id: &str, credits: u64) -> Result<Account, LedgerError> {
        self.transact(|state| {
            let account = state
                .accounts
                .entry(account_id.to_string())
                .or_insert_with(|| Account::new(account_id, 0));
            account.credits = account.credits.saturating_add(credits);
            Ok(account.clone())
        })
    }

    fn create_job(
        &self,
        account_id: &str,
        answer: &str,
        size: SizePreset,
    ) -> Result<GenerationJob, LedgerError> {
        self.transact(|state| {
            if !state.accounts.contains_key(account_id) {
                return Err(LedgerError::UnknownAccount {
                    account_id: account_id.to_string(),
                });
            }
            let job = GenerationJob::pending(account_id, answer, size);
            state.jobs.insert(job.job_id.clone(), job.clone());
            Ok(job)
        })
    }

    fn fail_job(&self, job_id: &str, failure: JobFailure) -> Result<GenerationJob, LedgerError> {
        self.transact(|state| {
            let job = state.pending_job_mut(job_id)?;
            job.fail(failure.prompt, failure.reason);
            Ok(job.clone())
        })
    }

    fn commit_job(
        &self,
        job_id: &str,
        completion: JobCompletion,
    ) -> Result<CommitReceipt, LedgerError> {
        let outcome = self.transact(|state| {
            let account_id = state.pending_job_mut(job_id)?.account_id.clone();
            let debited = match state.accounts.get_mut(&account_id) {
                Some(account) => account.try_debit(),
                None => {
                    return Err(LedgerError::UnknownAccount { account_id });
                }
            };

            let job = state.pending_job_mut(job_id)?;
            if !debited {
                job.fail(
                    Some(completion.prompt),
                    "insufficient credits at commit".to_string(),
                );
                return Ok(CommitOutcome::Rejected { account_id });
            }
            job.complete(completion.prompt, completion.image_url);
            let job = job.clone();
            let account = state
                .accounts
                .get(&account_id)
                .cloned()
                .ok_or(LedgerError::UnknownAccount { account_id })?;
            Ok(CommitOutcome::Committed(CommitReceipt { job, account }))
        })?;

        match outcome {
            CommitOutcome::Committed(receipt) => Ok(receipt),
            CommitOutcome::Rejected { account_id } => {
                Err(LedgerError::InsufficientCredits { account_id })
            }
        }
    }

    fn job(&self, job_id: &str) -> Result<Option<GenerationJob>, LedgerError> {
        self.read(|state| state.jobs.get(job_id).cloned())
    }

    fn jobs_for_account(
        &self,
        account_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<GenerationJob>, LedgerError> {
        self.read(|state| {
            let mut jobs = state
                .jobs
                .values()
                .filter(|job| job.account_id == account_id)
                .cloned()
                .collect::<Vec<GenerationJob>>();
            jobs.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| a.job_id.cmp(&b.job_id))
            });
            if let Some(limit) = limit {
                jobs.truncate(limit);
            }
            jobs
        })
    }
}

fn read_state(path: &Path) -> Result<LedgerState, LedgerError> {
    if !path.exists() {
        return Ok(LedgerState::default());
    }
    let raw = fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(LedgerState::default());
    }
    Ok(serde_json::from_str(&raw)?)
}

/// Advisory lock on `<ledger>.lock`, released on drop. The ledger file itself
/// is replaced by rename, so the lock lives on a sidecar that never moves.
struct FileLock {
    file: File,
}

impl FileLock {
    fn exclusive(ledger_path: &Path) -> Result<Self, LedgerError> {
        let file = open_lock_file(ledger_path)?;
        FileExt::lock_exclusive(&file)?;
        Ok(Self { file })
    }

    fn shared(ledger_path: &Path) -> Result<Self, LedgerError> {
        let file = open_lock_file(ledger_path)?;
        FileExt::lock_shared(&file)?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %err, "failed to release ledger lock");
        }
    }
}

fn open_lock_file(ledger_path: &Path) -> Result<File, LedgerError> {
    ensure_parent(ledger_path)?;
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(sibling(ledger_path, ".lock"))?)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn ensure_parent(path: &Path) -> Result<(), LedgerError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn write_state(path: &Path, state: &LedgerState) -> Result<(), LedgerError> {
    ensure_parent(path)?;
    let tmp_path = sibling(path, ".tmp");

    let payload = serde_json::to_vec_pretty(state)?;
    let mut file = File::create(&tmp_path)?;
    file.write_all(&payload)?;
    file.sync_all()?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
