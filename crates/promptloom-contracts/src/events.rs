use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

/// Lifecycle events recorded while a batch runs. The snake_case `type` tag
/// keeps the log greppable by event kind.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    BatchStarted {
        provider: String,
        jobs: usize,
    },
    JobStarted {
        job_id: String,
        index: usize,
        prompt: String,
    },
    JobSucceeded {
        job_id: String,
        model: String,
        bytes: usize,
        elapsed_ms: u64,
    },
    JobFailed {
        job_id: String,
        error: String,
        elapsed_ms: u64,
    },
    BatchCompleted {
        succeeded: usize,
        failed: usize,
    },
}

/// Append-only JSONL log of batch lifecycle events. Each line is one
/// serialized [`BatchEvent`] enveloped with `batch_id` and a `ts` timestamp.
/// Batches run single-threaded, so the log needs no locking.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    batch_id: String,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, batch_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            batch_id: batch_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn record(&self, event: &BatchEvent) -> Result<()> {
        let mut envelope = serde_json::to_value(event).context("failed encoding batch event")?;
        let Value::Object(fields) = &mut envelope else {
            bail!("batch event did not serialize to an object");
        };
        fields.insert(
            "batch_id".to_string(),
            Value::String(self.batch_id.clone()),
        );
        fields.insert("ts".to_string(), Value::String(now_utc_iso()));
        let line = serde_json::to_string(&envelope)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed opening {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
