use anyhow::{bail, Result};
use uuid::Uuid;

use crate::jobs::{parse_prompts, ImageData, PromptJob};

/// Immutable view of the batch handed to subscribers after every transition.
#[derive(Debug, Clone)]
pub struct BatchSnapshot {
    pub batch_id: String,
    pub jobs: Vec<PromptJob>,
    pub done: bool,
}

/// Owns the job list for one submission. Each submission builds a fresh
/// `BatchState`; batches are never merged. All mutation goes through the
/// transition methods so the presentation layer only ever sees snapshots.
#[derive(Debug)]
pub struct BatchState {
    batch_id: String,
    jobs: Vec<PromptJob>,
}

impl BatchState {
    pub fn from_raw_text(raw: &str) -> Self {
        Self::from_prompts(parse_prompts(raw))
    }

    pub fn from_prompts(prompts: Vec<String>) -> Self {
        let jobs = prompts
            .into_iter()
            .enumerate()
            .map(|(index, prompt)| PromptJob::new(index, prompt))
            .collect();
        Self {
            batch_id: Uuid::new_v4().to_string(),
            jobs,
        }
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn jobs(&self) -> &[PromptJob] {
        &self.jobs
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.iter().map(|job| job.id.clone()).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.jobs.iter().all(|job| job.status.is_terminal())
    }

    pub fn start_job(&mut self, id: &str) -> Result<BatchSnapshot> {
        self.job_mut(id)?.start()?;
        Ok(self.snapshot())
    }

    pub fn complete_job(&mut self, id: &str, image: ImageData) -> Result<BatchSnapshot> {
        self.job_mut(id)?.succeed(image)?;
        Ok(self.snapshot())
    }

    pub fn fail_job(&mut self, id: &str, message: impl Into<String>) -> Result<BatchSnapshot> {
        self.job_mut(id)?.fail(message)?;
        Ok(self.snapshot())
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        BatchSnapshot {
            batch_id: self.batch_id.clone(),
            jobs: self.jobs.clone(),
            done: self.is_complete(),
        }
    }

    fn job_mut(&mut self, id: &str) -> Result<&mut PromptJob> {
        let Some(job) = self.jobs.iter_mut().find(|job| job.id == id) else {
            bail!("no job with id {id} in this batch");
        };
        Ok(job)
    }
}
