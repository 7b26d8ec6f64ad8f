//! The job-locking protocol.
//!
//! A lease is the time-bounded exclusive right to process one job. All
//! coordination between engine instances happens through conditional writes in
//! the `JobStore`; the lease manager keeps no lock state of its own, so it stays
//! correct when every instance is a separate, unsynchronized process.
//!
//! Losing a race is normal. `claim`, `renew`, `release` and `record_failure`
//! report those outcomes as enum variants and reserve `EngineError` for genuine
//! failures (missing jobs, storage faults, exhausted conflict retries).

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use flowjob_core::clock::checked_add;
use flowjob_core::{
    Clock, EngineError, EngineResult, EntityKind, JobId, LockOwner, Persistent, SystemClock,
};

use super::record::JobRecord;
use super::store::{JobStore, StoreError};
use crate::config::JobServiceConfig;

/// Reason stored on records moved to the dead-letter table.
pub const RETRIES_EXHAUSTED: &str = "retries exhausted";

/// Result of `LeaseManager::claim`.
#[must_use]
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The caller now holds the lease; the record is as stored after the claim.
    Claimed(JobRecord),
    /// Another owner holds an unexpired lease.
    AlreadyClaimed,
}

impl ClaimOutcome {
    pub fn into_job(self) -> Option<JobRecord> {
        match self {
            ClaimOutcome::Claimed(job) => Some(job),
            ClaimOutcome::AlreadyClaimed => None,
        }
    }
}

/// Result of `LeaseManager::renew`.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed { expires_at: DateTime<Utc> },
    /// The store shows another owner or no lock; abandon the work in progress.
    LostOwnership,
}

/// Result of `LeaseManager::release`.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The caller did not hold the lock (already released or taken over).
    NotHeld,
}

/// Result of `LeaseManager::record_failure`.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// One attempt consumed and the lock released; the job can be claimed again.
    Retrying { remaining: u32 },
    /// The budget was already exhausted; the job moved to the dead-letter table.
    DeadLettered,
    LostOwnership,
}

/// Result of `LeaseManager::complete`.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    Completed,
    LostOwnership,
}

/// Failure raised by a job's own work.
///
/// `message` is the short text written (bounded) to the record, `detail` the full
/// diagnostic written to the exception blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub message: String,
    pub detail: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            detail: message.clone(),
            message,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    /// Message from the error itself, detail from the whole source chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut detail = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            detail.push_str("\nCaused by: ");
            detail.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            detail,
        }
    }

    /// Convert a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let text = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::new(format!("handler panicked: {text}"))
    }
}

impl core::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error + 'static> From<E> for HandlerError {
    fn from(err: E) -> Self {
        Self::from_error(&err)
    }
}

/// Lease manager over a job store.
pub struct LeaseManager<S: JobStore> {
    store: S,
    clock: Arc<dyn Clock>,
    config: JobServiceConfig,
}

impl<S: JobStore> LeaseManager<S> {
    pub fn new(store: S, config: JobServiceConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Use another time source (tests drive lease expiry with `ManualClock`).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &JobServiceConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// New job with the configured default tenant and retries, stamped by this manager's clock.
    pub fn new_job(&self, handler_type: impl Into<String>) -> JobRecord {
        JobRecord::created_by(
            self.clock.as_ref(),
            handler_type,
            self.config.default_tenant.clone(),
            self.config.default_retries,
        )
    }

    /// Take the lease on `job_id` for `lease`.
    pub fn claim(
        &self,
        job_id: JobId,
        owner: &LockOwner,
        lease: Duration,
    ) -> EngineResult<ClaimOutcome> {
        let now = self.clock.now();
        let expires_at = lease_expiry(now, lease)?;

        if !self.store.conditional_claim(job_id, owner, expires_at, now)? {
            debug!(job_id = %job_id, owner = %owner, "job already claimed");
            return Ok(ClaimOutcome::AlreadyClaimed);
        }

        // Deleted between the claim and the read.
        let job = self
            .store
            .load_job(job_id)?
            .ok_or_else(|| EngineError::not_found(EntityKind::Job, job_id))?;
        info!(job_id = %job_id, owner = %owner, expires_at = %expires_at, "claimed job");
        Ok(ClaimOutcome::Claimed(job))
    }

    /// Extend the lease the caller believes it holds to `now + extension`.
    pub fn renew(
        &self,
        job_id: JobId,
        owner: &LockOwner,
        extension: Duration,
    ) -> EngineResult<RenewOutcome> {
        let expires_at = lease_expiry(self.clock.now(), extension)?;
        if self.store.conditional_renew(job_id, owner, expires_at)? {
            debug!(job_id = %job_id, owner = %owner, expires_at = %expires_at, "renewed lease");
            Ok(RenewOutcome::Renewed { expires_at })
        } else {
            warn!(job_id = %job_id, owner = %owner, "lease lost");
            Ok(RenewOutcome::LostOwnership)
        }
    }

    /// Clear the lock. Releasing a lock that is no longer held is a no-op.
    pub fn release(&self, job_id: JobId, owner: &LockOwner) -> EngineResult<ReleaseOutcome> {
        if self.store.conditional_release(job_id, owner)? {
            debug!(job_id = %job_id, owner = %owner, "released lease");
            Ok(ReleaseOutcome::Released)
        } else {
            debug!(job_id = %job_id, owner = %owner, "release skipped, lock not held");
            Ok(ReleaseOutcome::NotHeld)
        }
    }

    /// Capture a handler failure and consume one attempt.
    ///
    /// With budget left the retries drop by one, the failure is recorded and the
    /// lock released in a single update. With the budget already at zero the record
    /// (failure included) moves to the dead-letter table instead.
    pub fn record_failure(
        &self,
        job_id: JobId,
        owner: &LockOwner,
        error: &HandlerError,
    ) -> EngineResult<FailureOutcome> {
        self.retry_on_conflict("record_failure", job_id, || {
            let Some(mut job) = self.store.load_job(job_id)? else {
                return Err(StoreError::job_not_found(job_id));
            };
            if job.lock_owner() != Some(owner) {
                return Ok(FailureOutcome::LostOwnership);
            }

            let baseline = job.persistent_state();
            job.set_exception_message(&error.message, &self.config.exception_message_limit);
            job.set_exception_detail(&error.detail);

            match job.decrement_retries() {
                Some(remaining) => {
                    job.clear_lock();
                    self.store.update_job(&mut job, &baseline)?;
                    Ok(FailureOutcome::Retrying { remaining })
                }
                None => {
                    self.store
                        .dead_letter(&mut job, RETRIES_EXHAUSTED, self.clock.now())?;
                    Ok(FailureOutcome::DeadLettered)
                }
            }
        })
        .inspect(|outcome| match outcome {
            FailureOutcome::Retrying { remaining } => {
                info!(job_id = %job_id, owner = %owner, remaining, error = %error, "job failed, will retry")
            }
            FailureOutcome::DeadLettered => {
                warn!(job_id = %job_id, owner = %owner, error = %error, "job dead-lettered")
            }
            FailureOutcome::LostOwnership => {
                warn!(job_id = %job_id, owner = %owner, "failure not recorded, lease lost")
            }
        })
    }

    /// Remove a finished job and its blobs.
    ///
    /// Ownership is confirmed with a renewing conditional write right before the
    /// delete, so a job reclaimed elsewhere is never deleted.
    pub fn complete(&self, job_id: JobId, owner: &LockOwner) -> EngineResult<CompleteOutcome> {
        let expires_at = lease_expiry(self.clock.now(), self.config.lease_duration)?;
        if !self.store.conditional_renew(job_id, owner, expires_at)? {
            warn!(job_id = %job_id, owner = %owner, "completion skipped, lease lost");
            return Ok(CompleteOutcome::LostOwnership);
        }
        self.store.delete_job(job_id)?;
        info!(job_id = %job_id, owner = %owner, "job completed");
        Ok(CompleteOutcome::Completed)
    }

    /// Claim up to `limit` due jobs, skipping those another owner wins first.
    pub fn acquire_due(
        &self,
        owner: &LockOwner,
        lease: Duration,
        limit: usize,
    ) -> EngineResult<Vec<JobRecord>> {
        let candidates = self.store.find_due_jobs(self.clock.now(), limit)?;
        let mut claimed = Vec::with_capacity(candidates.len());
        for job_id in candidates {
            match self.claim(job_id, owner, lease) {
                Ok(ClaimOutcome::Claimed(job)) => claimed.push(job),
                Ok(ClaimOutcome::AlreadyClaimed) => {}
                Err(EngineError::NotFound { .. }) => {
                    debug!(job_id = %job_id, "due job vanished before claim");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(claimed)
    }

    /// Re-run `op` after a version conflict, up to `max_conflict_retries` times.
    fn retry_on_conflict<T>(
        &self,
        operation: &str,
        job_id: JobId,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> EngineResult<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(StoreError::VersionConflict { expected, actual, .. })
                    if attempt < self.config.max_conflict_retries =>
                {
                    attempt += 1;
                    debug!(
                        job_id = %job_id,
                        operation,
                        attempt,
                        expected,
                        actual,
                        "version conflict, retrying"
                    );
                }
                other => return other.map_err(EngineError::from),
            }
        }
    }
}

/// End of a lease of length `lease` starting at `now`.
fn lease_expiry(now: DateTime<Utc>, lease: Duration) -> EngineResult<DateTime<Utc>> {
    checked_add(now, lease).ok_or_else(|| {
        EngineError::invalid_argument(format!("lease duration {lease:?} is out of range"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use flowjob_core::{Entity, ManualClock, TenantId};

    const LEASE: Duration = Duration::from_secs(60);

    fn setup(retries: u32) -> (LeaseManager<Arc<InMemoryJobStore>>, Arc<ManualClock>, JobId) {
        let store = InMemoryJobStore::arc();
        let clock = Arc::new(ManualClock::deterministic());
        let mut job = JobRecord::created_by(clock.as_ref(), "test", TenantId::new(""), retries);
        store.insert_job(&mut job).unwrap();
        let manager = LeaseManager::new(store, JobServiceConfig::default()).with_clock(clock.clone());
        (manager, clock, *job.id())
    }

    fn owner(name: &str) -> LockOwner {
        LockOwner::new(name).unwrap()
    }

    #[test]
    fn second_claim_is_already_claimed() {
        let (manager, _, id) = setup(3);
        let job = manager.claim(id, &owner("a"), LEASE).unwrap().into_job().unwrap();
        assert_eq!(job.lock_owner(), Some(&owner("a")));
        assert!(matches!(
            manager.claim(id, &owner("b"), LEASE).unwrap(),
            ClaimOutcome::AlreadyClaimed
        ));
    }

    #[test]
    fn claim_of_missing_job_is_not_found() {
        let (manager, _, _) = setup(3);
        let err = manager.claim(JobId::new(), &owner("a"), LEASE).unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: EntityKind::Job, .. }));
    }

    #[test]
    fn expired_lease_can_be_reclaimed_and_old_owner_loses_renew() {
        let (manager, clock, id) = setup(3);
        let _ = manager.claim(id, &owner("a"), LEASE).unwrap();

        clock.advance(LEASE + Duration::from_secs(1));
        assert!(matches!(
            manager.claim(id, &owner("b"), LEASE).unwrap(),
            ClaimOutcome::Claimed(_)
        ));
        assert_eq!(
            manager.renew(id, &owner("a"), LEASE).unwrap(),
            RenewOutcome::LostOwnership
        );
    }

    #[test]
    fn owner_can_renew_expired_but_unreclaimed_lease() {
        let (manager, clock, id) = setup(3);
        let _ = manager.claim(id, &owner("a"), LEASE).unwrap();
        clock.advance(LEASE * 2);

        let outcome = manager.renew(id, &owner("a"), LEASE).unwrap();
        assert_eq!(
            outcome,
            RenewOutcome::Renewed {
                expires_at: clock.now() + chrono::Duration::seconds(60)
            }
        );
    }

    #[test]
    fn unrepresentable_lease_is_rejected_without_claiming() {
        let (manager, _, id) = setup(3);
        let too_long = Duration::from_secs(u64::MAX);

        let err = manager.claim(id, &owner("a"), too_long).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
        assert!(manager.store().load_job(id).unwrap().unwrap().lock().is_none());

        let _ = manager.claim(id, &owner("a"), LEASE).unwrap();
        let err = manager.renew(id, &owner("a"), too_long).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn release_is_idempotent() {
        let (manager, _, id) = setup(3);
        let _ = manager.claim(id, &owner("a"), LEASE).unwrap();
        assert_eq!(manager.release(id, &owner("a")).unwrap(), ReleaseOutcome::Released);
        assert_eq!(manager.release(id, &owner("a")).unwrap(), ReleaseOutcome::NotHeld);
        assert_eq!(manager.release(JobId::new(), &owner("a")).unwrap(), ReleaseOutcome::NotHeld);
    }

    #[test]
    fn failure_with_budget_releases_lock() {
        let (manager, _, id) = setup(2);
        let _ = manager.claim(id, &owner("a"), LEASE).unwrap();

        let outcome = manager
            .record_failure(id, &owner("a"), &HandlerError::new("boom"))
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Retrying { remaining: 1 });

        let job = manager.store().load_job(id).unwrap().unwrap();
        assert_eq!(job.retries(), 1);
        assert!(job.lock().is_none());
        assert_eq!(job.exception_message(), Some("boom"));
    }

    #[test]
    fn failure_at_zero_dead_letters() {
        let (manager, _, id) = setup(0);
        let _ = manager.claim(id, &owner("a"), LEASE).unwrap();

        let outcome = manager
            .record_failure(id, &owner("a"), &HandlerError::new("boom").with_detail("trace"))
            .unwrap();
        assert_eq!(outcome, FailureOutcome::DeadLettered);
        assert!(manager.store().load_job(id).unwrap().is_none());

        let dl = manager.store().load_dead_letter(id).unwrap().unwrap();
        assert_eq!(dl.job.retries(), 0);
        assert_eq!(dl.reason, RETRIES_EXHAUSTED);
        assert_eq!(
            dl.job.exception_detail(manager.store()).unwrap().as_deref(),
            Some("trace")
        );
    }

    #[test]
    fn failure_by_non_owner_is_lost_ownership() {
        let (manager, _, id) = setup(3);
        let _ = manager.claim(id, &owner("a"), LEASE).unwrap();
        let outcome = manager
            .record_failure(id, &owner("b"), &HandlerError::new("boom"))
            .unwrap();
        assert_eq!(outcome, FailureOutcome::LostOwnership);
        assert_eq!(manager.store().load_job(id).unwrap().unwrap().retries(), 3);
    }

    #[test]
    fn complete_deletes_only_for_owner() {
        let (manager, _, id) = setup(3);
        let _ = manager.claim(id, &owner("a"), LEASE).unwrap();
        assert_eq!(manager.complete(id, &owner("b")).unwrap(), CompleteOutcome::LostOwnership);
        assert_eq!(manager.complete(id, &owner("a")).unwrap(), CompleteOutcome::Completed);
        assert!(manager.store().load_job(id).unwrap().is_none());
    }

    #[test]
    fn new_job_is_stamped_by_the_manager_clock() {
        let (manager, clock, _) = setup(3);
        clock.advance(Duration::from_secs(3600));
        let job = manager.new_job("timer");
        assert_eq!(job.create_time(), clock.now());
        assert_eq!(job.retries(), manager.config().default_retries);
    }

    #[test]
    fn acquire_due_skips_claimed_jobs() {
        let (manager, clock, first) = setup(3);
        let mut second = manager.new_job("test");
        manager.store().insert_job(&mut second).unwrap();
        let _ = manager.claim(first, &owner("b"), LEASE).unwrap();

        let acquired = manager.acquire_due(&owner("a"), LEASE, 10).unwrap();
        assert_eq!(acquired.len(), 1);
        assert_eq!(acquired[0].id(), second.id());
    }

    #[test]
    fn handler_error_collects_source_chain() {
        #[derive(Debug, thiserror::Error)]
        #[error("outer")]
        struct Outer(#[source] std::io::Error);

        let err = HandlerError::from(Outer(std::io::Error::other("inner")));
        assert_eq!(err.message, "outer");
        assert_eq!(err.detail, "outer\nCaused by: inner");
    }

    #[test]
    fn panic_payload_becomes_message() {
        let payload = std::panic::catch_unwind(|| {
            if true {
                panic!("kaboom");
            }
        }).unwrap_err();
        assert_eq!(HandlerError::from_panic(payload).message, "handler panicked: kaboom");
    }
}
