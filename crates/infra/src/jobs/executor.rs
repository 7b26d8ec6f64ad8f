//! Polling job executor.
//!
//! Each poll acquires a batch of due jobs through the lease manager and runs them
//! on a bounded pool of scoped worker threads. Every claimed job is handled by
//! exactly one worker. Handler errors and panics are converted into
//! `record_failure` calls, so one job's failure never stops the loop.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use flowjob_core::{EngineResult, Entity, LockOwner};

use super::lease::{
    CompleteOutcome, FailureOutcome, HandlerError, LeaseManager, RenewOutcome,
};
use super::record::JobRecord;
use super::store::JobStore;

/// Job handler function type.
pub type JobHandler<S> =
    Box<dyn Fn(&JobExecution<'_, S>) -> Result<(), HandlerError> + Send + Sync>;

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often to poll for new jobs
    pub poll_interval: Duration,
    /// Maximum concurrent jobs
    pub max_concurrent: usize,
    /// Jobs acquired per poll
    pub batch_size: usize,
    /// Name for logging
    pub name: String,
    /// Lease owner; defaults to the service's configured owner.
    pub lock_owner: Option<LockOwner>,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_concurrent: 4,
            batch_size: 8,
            name: "job-executor".to_string(),
            lock_owner: None,
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lock_owner(mut self, owner: LockOwner) -> Self {
        self.lock_owner = Some(owner);
        self
    }
}

/// What happened to one executed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRunOutcome {
    Completed,
    Retrying { remaining: u32 },
    DeadLettered,
    /// The lease was taken over before the result could be recorded.
    LostOwnership,
}

impl From<FailureOutcome> for JobRunOutcome {
    fn from(outcome: FailureOutcome) -> Self {
        match outcome {
            FailureOutcome::Retrying { remaining } => JobRunOutcome::Retrying { remaining },
            FailureOutcome::DeadLettered => JobRunOutcome::DeadLettered,
            FailureOutcome::LostOwnership => JobRunOutcome::LostOwnership,
        }
    }
}

/// Context handed to a handler for one claimed job.
pub struct JobExecution<'a, S: JobStore> {
    job: &'a JobRecord,
    manager: &'a LeaseManager<S>,
    owner: &'a LockOwner,
}

impl<S: JobStore> JobExecution<'_, S> {
    pub fn job(&self) -> &JobRecord {
        self.job
    }

    pub fn owner(&self) -> &LockOwner {
        self.owner
    }

    /// Offloaded handler configuration, fetched on first use.
    pub fn advanced_configuration(&self) -> EngineResult<Option<String>> {
        self.job.advanced_configuration(self.manager.store())
    }

    /// Extend the lease by the configured duration.
    ///
    /// Long-running handlers call this periodically and must stop on
    /// `RenewOutcome::LostOwnership`.
    pub fn renew(&self) -> EngineResult<RenewOutcome> {
        self.manager
            .renew(*self.job.id(), self.owner, self.manager.config().lease_duration)
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for the current batch to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub leases_lost: u64,
    pub uptime_secs: u64,
}

impl ExecutorStats {
    fn record(&mut self, outcome: JobRunOutcome) {
        self.jobs_processed += 1;
        match outcome {
            JobRunOutcome::Completed => self.jobs_succeeded += 1,
            JobRunOutcome::Retrying { .. } => self.jobs_failed += 1,
            JobRunOutcome::DeadLettered => {
                self.jobs_failed += 1;
                self.jobs_dead_lettered += 1;
            }
            JobRunOutcome::LostOwnership => self.leases_lost += 1,
        }
    }
}

/// Background job executor.
///
/// Polls for due jobs, executes them with registered handlers, and records
/// completion or failure through the lease manager.
pub struct JobExecutor<S: JobStore> {
    manager: LeaseManager<S>,
    handlers: HashMap<String, JobHandler<S>>,
}

impl<S: JobStore> JobExecutor<S> {
    pub fn new(manager: LeaseManager<S>) -> Self {
        Self {
            manager,
            handlers: HashMap::new(),
        }
    }

    pub fn manager(&self) -> &LeaseManager<S> {
        &self.manager
    }

    /// Register a handler for a handler type (`"timer"`, `"ai.*"`, or `"*"`).
    pub fn register_handler<F>(&mut self, type_pattern: impl Into<String>, handler: F)
    where
        F: Fn(&JobExecution<'_, S>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handlers.insert(type_pattern.into(), Box::new(handler));
    }

    fn get_handler(&self, handler_type: &str) -> Option<&JobHandler<S>> {
        if let Some(h) = self.handlers.get(handler_type) {
            return Some(h);
        }

        // Category match: "ai.*" matches "ai.inventory_anomaly".
        for (pattern, handler) in &self.handlers {
            if let Some(prefix) = pattern.strip_suffix(".*") {
                if handler_type.starts_with(prefix) {
                    return Some(handler);
                }
            }
        }

        self.handlers.get("*")
    }

    /// Run one claimed job and record the result.
    pub fn execute_one(&self, job: &JobRecord, owner: &LockOwner) -> EngineResult<JobRunOutcome> {
        let job_id = *job.id();
        let Some(handler) = self.get_handler(job.handler_type()) else {
            let error = HandlerError::new(format!(
                "no handler registered for job type '{}'",
                job.handler_type()
            ));
            warn!(job_id = %job_id, handler_type = job.handler_type(), "no handler for job");
            return Ok(self.manager.record_failure(job_id, owner, &error)?.into());
        };

        let execution = JobExecution {
            job,
            manager: &self.manager,
            owner,
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler(&execution)))
            .unwrap_or_else(|payload| Err(HandlerError::from_panic(payload)));

        match result {
            Ok(()) => match self.manager.complete(job_id, owner)? {
                CompleteOutcome::Completed => Ok(JobRunOutcome::Completed),
                CompleteOutcome::LostOwnership => Ok(JobRunOutcome::LostOwnership),
            },
            Err(error) => {
                debug!(job_id = %job_id, error = %error, "job handler failed");
                Ok(self.manager.record_failure(job_id, owner, &error)?.into())
            }
        }
    }

    /// Acquire one batch of due jobs and run it on up to `max_concurrent` workers.
    pub fn run_once(&self, config: &JobExecutorConfig) -> EngineResult<Vec<JobRunOutcome>> {
        let owner = config
            .lock_owner
            .as_ref()
            .unwrap_or(&self.manager.config().lock_owner);
        let jobs = self.manager.acquire_due(
            owner,
            self.manager.config().lease_duration,
            config.batch_size,
        )?;
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let workers = config.max_concurrent.clamp(1, jobs.len());
        let queue = Mutex::new(jobs.into_iter().collect::<VecDeque<_>>());
        let outcomes = Mutex::new(Vec::new());

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let next = queue
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .pop_front();
                        let Some(job) = next else { break };
                        match self.execute_one(&job, owner) {
                            Ok(outcome) => outcomes
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .push(outcome),
                            Err(e) => {
                                error!(executor = %config.name, job_id = %job.id(), error = %e, "failed to record job result");
                            }
                        }
                    }
                });
            }
        });

        Ok(outcomes.into_inner().unwrap_or_else(PoisonError::into_inner))
    }

    /// Spawn the executor in a background thread.
    pub fn spawn(self, config: JobExecutorConfig) -> std::io::Result<JobExecutorHandle>
    where
        S: 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || {
                executor_loop(self, config, shutdown_rx, stats_clone);
            })?;

        Ok(JobExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn executor_loop<S: JobStore>(
    executor: JobExecutor<S>,
    config: JobExecutorConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    info!(executor = %config.name, "job executor started");
    let start_time = Instant::now();

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        stats.lock().unwrap_or_else(PoisonError::into_inner).uptime_secs =
            start_time.elapsed().as_secs();

        match executor.run_once(&config) {
            Ok(outcomes) if outcomes.is_empty() => {
                thread::sleep(config.poll_interval);
            }
            Ok(outcomes) => {
                let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
                for outcome in outcomes {
                    s.record(outcome);
                }
                debug!(executor = %config.name, processed = s.jobs_processed, "batch finished");
            }
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to acquire jobs");
                thread::sleep(config.poll_interval);
            }
        }
    }

    info!(executor = %config.name, "job executor stopped");
}
