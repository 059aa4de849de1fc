use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Lifecycle of a single prompt. Transitions are monotonic:
/// `Pending -> InProgress -> {Succeeded, Failed}` and nothing after that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    /// File extension inferred from the upstream response, without the dot.
    pub extension: String,
}

/// One entry per non-empty input line. `image` is set exactly when the job
/// succeeded, `error` exactly when it failed.
#[derive(Debug, Clone)]
pub struct PromptJob {
    pub id: String,
    pub index: usize,
    pub prompt: String,
    pub status: JobStatus,
    pub image: Option<ImageData>,
    pub error: Option<String>,
}

impl PromptJob {
    pub(crate) fn new(index: usize, prompt: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            index,
            prompt,
            status: JobStatus::Pending,
            image: None,
            error: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.status != JobStatus::Pending {
            bail!(
                "job {} cannot start from state '{}'",
                self.id,
                self.status.as_str()
            );
        }
        self.status = JobStatus::InProgress;
        Ok(())
    }

    pub fn succeed(&mut self, image: ImageData) -> Result<()> {
        if self.status != JobStatus::InProgress {
            bail!(
                "job {} cannot succeed from state '{}'",
                self.id,
                self.status.as_str()
            );
        }
        self.status = JobStatus::Succeeded;
        self.image = Some(image);
        self.error = None;
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        if self.status != JobStatus::InProgress {
            bail!(
                "job {} cannot fail from state '{}'",
                self.id,
                self.status.as_str()
            );
        }
        self.status = JobStatus::Failed;
        self.error = Some(message.into());
        self.image = None;
        Ok(())
    }
}

/// Splits raw multi-line input into trimmed, non-empty prompts in input order.
pub fn parse_prompts(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
