//! Job management commands.

use serde::Deserialize;
use tracing::info;

use flowjob_core::{EngineError, EngineResult, EntityKind, JobId, Persistent};

use super::{Command, CommandContext, require};
use crate::jobs::{JobRecord, JobStore};
use crate::scope::ScopeStore;

/// Full failure detail of an active or dead-lettered job.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetJobExceptionDetail {
    pub job_id: Option<JobId>,
}

impl GetJobExceptionDetail {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id: Some(job_id),
        }
    }
}

impl Command for GetJobExceptionDetail {
    type Output = Option<String>;

    const NAME: &'static str = "get_job_exception_detail";

    fn validate(&self) -> EngineResult<()> {
        require(&self.job_id, "jobId").map(|_| ())
    }

    fn execute<J: JobStore, T: ScopeStore>(
        &self,
        ctx: &CommandContext<'_, J, T>,
    ) -> EngineResult<Self::Output> {
        let job_id = *require(&self.job_id, "jobId")?;
        if let Some(job) = ctx.find_job(job_id)? {
            return ctx.exception_detail(&job);
        }
        match ctx.find_dead_letter(job_id)? {
            Some(entry) => ctx.exception_detail(&entry.job),
            None => Err(EngineError::not_found(EntityKind::Job, job_id)),
        }
    }
}

/// Put a dead-lettered job back into the active table with a new retry budget.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveDeadLetterJobToExecutable {
    pub job_id: Option<JobId>,
    /// Defaults to the configured retry budget.
    pub retries: Option<u32>,
}

impl MoveDeadLetterJobToExecutable {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id: Some(job_id),
            retries: None,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

impl Command for MoveDeadLetterJobToExecutable {
    type Output = JobRecord;

    const NAME: &'static str = "move_dead_letter_job_to_executable";

    fn validate(&self) -> EngineResult<()> {
        require(&self.job_id, "jobId").map(|_| ())
    }

    fn execute<J: JobStore, T: ScopeStore>(
        &self,
        ctx: &CommandContext<'_, J, T>,
    ) -> EngineResult<Self::Output> {
        let job_id = *require(&self.job_id, "jobId")?;
        let retries = self.retries.unwrap_or(ctx.config().default_retries);
        let job = ctx.restore_dead_letter(job_id, retries)?;
        info!(job_id = %job_id, retries, "dead-letter job moved back to executable");
        Ok(job)
    }
}

/// Overwrite the remaining retry budget of an active job.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetJobRetries {
    pub job_id: Option<JobId>,
    pub retries: u32,
}

impl SetJobRetries {
    pub fn new(job_id: JobId, retries: u32) -> Self {
        Self {
            job_id: Some(job_id),
            retries,
        }
    }
}

impl Command for SetJobRetries {
    type Output = ();

    const NAME: &'static str = "set_job_retries";

    fn validate(&self) -> EngineResult<()> {
        require(&self.job_id, "jobId").map(|_| ())
    }

    fn execute<J: JobStore, T: ScopeStore>(
        &self,
        ctx: &CommandContext<'_, J, T>,
    ) -> EngineResult<Self::Output> {
        let job_id = *require(&self.job_id, "jobId")?;
        let mut job = ctx.job(job_id)?;
        let baseline = job.persistent_state();
        job.set_retries(self.retries);
        ctx.save_job(&mut job, &baseline)
    }
}
