//! Unit-of-work command execution.
//!
//! Every externally triggered operation runs as a `Command`:
//!
//! ```text
//! Command
//!   ↓
//! 1. validate(): required identifiers present, no store access
//!   ↓
//! 2. execute(&CommandContext): task lookup, variable resolution, at most one write
//!   ↓
//! 3. version conflict? reload and re-run execute (bounded)
//! ```
//!
//! A command performs at most one store write, so its effects are either fully
//! applied or not at all. The surrounding transaction boundary is owned by the
//! caller.

pub mod jobs;
pub mod tasks;

use tracing::{debug, info_span};

use flowjob_core::{
    EngineError, EngineResult, EntityKind, JobId, PersistentState, ScopeId, TaskId,
};

use crate::config::JobServiceConfig;
use crate::jobs::{DeadLetterJob, JobRecord, JobStore};
use crate::scope::{ScopeResolver, ScopeStore, TaskHandle, ValueFetch, VariableInstance};

pub use jobs::{GetJobExceptionDetail, MoveDeadLetterJobToExecutable, SetJobRetries};
pub use tasks::GetTaskVariable;

/// One engine operation.
pub trait Command {
    type Output;

    /// Name used in logs and spans.
    const NAME: &'static str;

    /// Check required arguments. Must not touch any store.
    fn validate(&self) -> EngineResult<()> {
        Ok(())
    }

    fn execute<J: JobStore, T: ScopeStore>(
        &self,
        ctx: &CommandContext<'_, J, T>,
    ) -> EngineResult<Self::Output>;
}

/// The services a command may use.
pub struct CommandContext<'a, J, T> {
    jobs: &'a J,
    scopes: &'a ScopeResolver<T>,
    config: &'a JobServiceConfig,
}

impl<J: JobStore, T: ScopeStore> CommandContext<'_, J, T> {
    pub fn config(&self) -> &JobServiceConfig {
        self.config
    }

    /// Task by id, or `NotFound` naming the task.
    pub fn task(&self, id: TaskId) -> EngineResult<TaskHandle> {
        self.scopes
            .store()
            .get_task(id)?
            .ok_or_else(|| EngineError::not_found(EntityKind::Task, id))
    }

    pub fn resolve_variable(
        &self,
        scope_id: ScopeId,
        name: &str,
        is_local: bool,
        fetch: ValueFetch,
    ) -> EngineResult<Option<VariableInstance>> {
        self.scopes.resolve(scope_id, name, is_local, fetch)
    }

    pub fn find_job(&self, id: JobId) -> EngineResult<Option<JobRecord>> {
        Ok(self.jobs.load_job(id)?)
    }

    /// Active job by id, or `NotFound` naming the job.
    pub fn job(&self, id: JobId) -> EngineResult<JobRecord> {
        self.find_job(id)?
            .ok_or_else(|| EngineError::not_found(EntityKind::Job, id))
    }

    pub fn find_dead_letter(&self, id: JobId) -> EngineResult<Option<DeadLetterJob>> {
        Ok(self.jobs.load_dead_letter(id)?)
    }

    pub fn exception_detail(&self, job: &JobRecord) -> EngineResult<Option<String>> {
        job.exception_detail(self.jobs)
    }

    /// Persist the fields changed since `baseline` was taken.
    pub fn save_job(&self, job: &mut JobRecord, baseline: &PersistentState) -> EngineResult<()> {
        self.jobs.update_job(job, baseline)?;
        Ok(())
    }

    pub fn restore_dead_letter(&self, id: JobId, retries: u32) -> EngineResult<JobRecord> {
        Ok(self.jobs.restore_dead_letter(id, retries)?)
    }
}

/// Runs commands against a job store and a scope store.
pub struct CommandExecutor<J, T> {
    jobs: J,
    scopes: ScopeResolver<T>,
    config: JobServiceConfig,
}

impl<J: JobStore, T: ScopeStore> CommandExecutor<J, T> {
    pub fn new(jobs: J, scopes: T, config: JobServiceConfig) -> Self {
        Self {
            jobs,
            scopes: ScopeResolver::new(scopes),
            config,
        }
    }

    pub fn jobs(&self) -> &J {
        &self.jobs
    }

    pub fn scopes(&self) -> &T {
        self.scopes.store()
    }

    /// Validate, then execute, re-running on version conflicts.
    pub fn execute<C: Command>(&self, command: &C) -> EngineResult<C::Output> {
        let span = info_span!("command", name = C::NAME);
        let _enter = span.enter();

        command.validate()?;

        let ctx = CommandContext {
            jobs: &self.jobs,
            scopes: &self.scopes,
            config: &self.config,
        };
        let mut attempt = 0;
        loop {
            match command.execute(&ctx) {
                Err(e) if e.is_retryable() && attempt < self.config.max_conflict_retries => {
                    attempt += 1;
                    debug!(attempt, error = %e, "command hit a version conflict, retrying");
                }
                other => return other,
            }
        }
    }
}

/// `InvalidArgument` when a required argument is missing.
pub(crate) fn require<'a, T>(value: &'a Option<T>, name: &str) -> EngineResult<&'a T> {
    value
        .as_ref()
        .ok_or_else(|| EngineError::invalid_argument(format!("{name} is null")))
}
