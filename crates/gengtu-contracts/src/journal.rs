use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::models::GenerationJob;

/// Job lifecycle events recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Created,
    Failed,
    Completed,
}

impl JobEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "job_created",
            Self::Failed => "job_failed",
            Self::Completed => "job_completed",
        }
    }
}

/// Append-only `jobs.jsonl` writer.
///
/// - every line carries `type`, `ts`, `job_id`, `account_id`, `status`
/// - `extra` is merged last
/// - one compact JSON object per line
#[derive(Debug, Clone)]
pub struct JobJournal {
    inner: Arc<JournalInner>,
}

#[derive(Debug)]
struct JournalInner {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JobJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(JournalInner {
                path: path.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn record(
        &self,
        event: JobEvent,
        job: &GenerationJob,
        extra: Map<String, Value>,
    ) -> anyhow::Result<Value> {
        let mut line = Map::new();
        line.insert("type".to_string(), Value::String(event.as_str().to_string()));
        line.insert("ts".to_string(), Value::String(now_utc_iso()));
        line.insert("job_id".to_string(), Value::String(job.job_id.clone()));
        line.insert(
            "account_id".to_string(),
            Value::String(job.account_id.clone()),
        );
        line.insert(
            "status".to_string(),
            Value::String(job.status.as_str().to_string()),
        );
        for (key, value) in extra {
            line.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let encoded = serde_json::to_string(&line)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("job journal lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(encoded.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(line))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
