//! Job storage boundary and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use flowjob_core::{
    BlobId, EngineError, Entity, EntityKind, JobId, LockOwner, Persistent, PersistentState,
    StateDiff, TenantId,
};

use super::blob::BlobStore;
use super::record::{DeadLetterJob, JobRecord};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("version conflict on job {id}: expected revision {expected}, found {actual}")]
    VersionConflict { id: JobId, expected: u64, actual: u64 },
    #[error("storage error: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn job_not_found(id: JobId) -> Self {
        Self::NotFound {
            kind: EntityKind::Job,
            id: id.to_string(),
        }
    }

    pub fn dead_letter_not_found(id: JobId) -> Self {
        Self::NotFound {
            kind: EntityKind::DeadLetterJob,
            id: id.to_string(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => EngineError::NotFound { kind, id },
            StoreError::VersionConflict { .. } => EngineError::conflict(err.to_string()),
            StoreError::AlreadyExists(_) => EngineError::invalid_argument(err.to_string()),
            StoreError::Unavailable(msg) => EngineError::storage(msg),
        }
    }
}

fn poisoned<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Unavailable("lock poisoned".to_string())
}

/// Job store abstraction.
///
/// Every lock-field transition is a single conditional write: implementations must
/// test the condition and apply the change atomically, so concurrent callers in
/// separate processes can never both succeed for the same job. Each successful
/// write bumps the job revision.
pub trait JobStore: BlobStore {
    /// Persist a new job (flushing its blobs first).
    fn insert_job(&self, job: &mut JobRecord) -> Result<(), StoreError>;

    /// Load a job by id.
    fn load_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Take the lease when the job is unlocked or its lease expired before `now`.
    ///
    /// Returns `false` when another owner holds an unexpired lease, and
    /// `StoreError::NotFound` when the job does not exist.
    fn conditional_claim(
        &self,
        id: JobId,
        owner: &LockOwner,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Move the lease expiry when `owner` is still the recorded lock owner.
    fn conditional_renew(
        &self,
        id: JobId,
        owner: &LockOwner,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Clear lock fields when `owner` is still the recorded lock owner.
    /// A missing job counts as "not released", not as an error.
    fn conditional_release(&self, id: JobId, owner: &LockOwner) -> Result<bool, StoreError>;

    /// Write the fields that changed since `baseline`, checking the revision.
    ///
    /// Buffered blob content is flushed first so new blob ids are part of the diff.
    /// Returns the diff that was applied (empty means nothing was written).
    fn update_job(
        &self,
        job: &mut JobRecord,
        baseline: &PersistentState,
    ) -> Result<StateDiff, StoreError>;

    /// Delete a job and every blob it owns.
    fn delete_job(&self, id: JobId) -> Result<(), StoreError>;

    /// Ids of jobs that are due and claimable at `now`, oldest first.
    fn find_due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, StoreError>;

    /// Move a job out of the active table into the dead-letter table.
    ///
    /// The job's current state (failure fields included) is what gets kept; the
    /// lock is cleared and blob ownership moves with the record.
    fn dead_letter(
        &self,
        job: &mut JobRecord,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn load_dead_letter(&self, id: JobId) -> Result<Option<DeadLetterJob>, StoreError>;

    fn list_dead_letters(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterJob>, StoreError>;

    /// Move a dead-lettered job back to the active table with a new retry budget.
    fn restore_dead_letter(&self, id: JobId, retries: u32) -> Result<JobRecord, StoreError>;

    /// Delete a dead-lettered job and its blobs.
    fn delete_dead_letter(&self, id: JobId) -> Result<(), StoreError>;
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn insert_job(&self, job: &mut JobRecord) -> Result<(), StoreError> {
        (**self).insert_job(job)
    }

    fn load_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        (**self).load_job(id)
    }

    fn conditional_claim(
        &self,
        id: JobId,
        owner: &LockOwner,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).conditional_claim(id, owner, expires_at, now)
    }

    fn conditional_renew(
        &self,
        id: JobId,
        owner: &LockOwner,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).conditional_renew(id, owner, expires_at)
    }

    fn conditional_release(&self, id: JobId, owner: &LockOwner) -> Result<bool, StoreError> {
        (**self).conditional_release(id, owner)
    }

    fn update_job(
        &self,
        job: &mut JobRecord,
        baseline: &PersistentState,
    ) -> Result<StateDiff, StoreError> {
        (**self).update_job(job, baseline)
    }

    fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        (**self).delete_job(id)
    }

    fn find_due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, StoreError> {
        (**self).find_due_jobs(now, limit)
    }

    fn dead_letter(
        &self,
        job: &mut JobRecord,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self).dead_letter(job, reason, at)
    }

    fn load_dead_letter(&self, id: JobId) -> Result<Option<DeadLetterJob>, StoreError> {
        (**self).load_dead_letter(id)
    }

    fn list_dead_letters(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterJob>, StoreError> {
        (**self).list_dead_letters(tenant_id, limit)
    }

    fn restore_dead_letter(&self, id: JobId, retries: u32) -> Result<JobRecord, StoreError> {
        (**self).restore_dead_letter(id, retries)
    }

    fn delete_dead_letter(&self, id: JobId) -> Result<(), StoreError> {
        (**self).delete_dead_letter(id)
    }
}

#[derive(Debug, Clone)]
struct StoredBlob {
    #[allow(dead_code)]
    name: String,
    bytes: Vec<u8>,
}

/// In-memory job store for tests/dev.
///
/// Lock order is jobs → dead letters → blobs.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterJob>>,
    blobs: RwLock<HashMap<BlobId, StoredBlob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored blobs (used to check for orphaned payloads).
    pub fn blob_count(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    fn bump(job: &mut JobRecord) {
        let next = job.revision() + 1;
        job.set_revision(next);
    }
}

impl BlobStore for InMemoryJobStore {
    fn get_blob(&self, id: BlobId) -> Result<Option<Vec<u8>>, StoreError> {
        let blobs = self.blobs.read().map_err(poisoned)?;
        Ok(blobs.get(&id).map(|b| b.bytes.clone()))
    }

    fn put_blob(&self, name: &str, bytes: &[u8]) -> Result<BlobId, StoreError> {
        let id = BlobId::new();
        let mut blobs = self.blobs.write().map_err(poisoned)?;
        blobs.insert(
            id,
            StoredBlob {
                name: name.to_string(),
                bytes: bytes.to_vec(),
            },
        );
        Ok(id)
    }

    fn delete_blob(&self, id: BlobId) -> Result<(), StoreError> {
        let mut blobs = self.blobs.write().map_err(poisoned)?;
        blobs.remove(&id);
        Ok(())
    }
}

impl JobStore for InMemoryJobStore {
    fn insert_job(&self, job: &mut JobRecord) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let id = *job.id();
        if jobs.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        job.flush_blobs(self)?;
        job.purge_retired_blobs(self)?;
        jobs.insert(id, job.detached());
        Ok(())
    }

    fn load_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(&id).map(JobRecord::detached))
    }

    fn conditional_claim(
        &self,
        id: JobId,
        owner: &LockOwner,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let job = jobs.get_mut(&id).ok_or_else(|| StoreError::job_not_found(id))?;
        if !job.lock_state(now).is_claimable() {
            return Ok(false);
        }
        job.set_lock(owner.clone(), expires_at);
        Self::bump(job);
        Ok(true)
    }

    fn conditional_renew(
        &self,
        id: JobId,
        owner: &LockOwner,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        match jobs.get_mut(&id) {
            Some(job) if job.lock_owner() == Some(owner) => {
                job.set_lock(owner.clone(), expires_at);
                Self::bump(job);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn conditional_release(&self, id: JobId, owner: &LockOwner) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        match jobs.get_mut(&id) {
            Some(job) if job.lock_owner() == Some(owner) => {
                job.clear_lock();
                Self::bump(job);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn update_job(
        &self,
        job: &mut JobRecord,
        baseline: &PersistentState,
    ) -> Result<StateDiff, StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let id = *job.id();
        let stored = jobs.get_mut(&id).ok_or_else(|| StoreError::job_not_found(id))?;
        if !job.expected_version().matches(stored.revision()) {
            return Err(StoreError::VersionConflict {
                id,
                expected: job.revision(),
                actual: stored.revision(),
            });
        }

        job.flush_blobs(self)?;
        let diff = baseline.diff(&job.persistent_state());
        if !diff.is_empty() {
            stored.apply_changes(job, &diff);
            Self::bump(stored);
            job.set_revision(stored.revision());
        }
        job.purge_retired_blobs(self)?;
        Ok(diff)
    }

    fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        let mut removed = {
            let mut jobs = self.jobs.write().map_err(poisoned)?;
            jobs.remove(&id).ok_or_else(|| StoreError::job_not_found(id))?
        };
        removed.delete_blobs(self)
    }

    fn find_due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut candidates: Vec<_> = jobs
            .values()
            .filter(|j| j.is_due(now) && j.lock_state(now).is_claimable())
            .collect();

        candidates.sort_by_key(|j| (j.due_at().unwrap_or(j.create_time()), j.create_time()));
        Ok(candidates.into_iter().take(limit).map(|j| *j.id()).collect())
    }

    fn dead_letter(
        &self,
        job: &mut JobRecord,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let mut dls = self.dead_letters.write().map_err(poisoned)?;
        let id = *job.id();
        let stored = jobs.get(&id).ok_or_else(|| StoreError::job_not_found(id))?;
        if !job.expected_version().matches(stored.revision()) {
            return Err(StoreError::VersionConflict {
                id,
                expected: job.revision(),
                actual: stored.revision(),
            });
        }

        job.flush_blobs(self)?;
        job.purge_retired_blobs(self)?;
        job.clear_lock();
        Self::bump(job);

        jobs.remove(&id);
        dls.insert(id, DeadLetterJob::new(job.detached(), reason.to_string(), at));
        Ok(())
    }

    fn load_dead_letter(&self, id: JobId) -> Result<Option<DeadLetterJob>, StoreError> {
        let dls = self.dead_letters.read().map_err(poisoned)?;
        Ok(dls.get(&id).cloned())
    }

    fn list_dead_letters(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterJob>, StoreError> {
        let dls = self.dead_letters.read().map_err(poisoned)?;
        let mut result: Vec<_> = dls
            .values()
            .filter(|e| e.job.tenant_id() == tenant_id)
            .cloned()
            .collect();

        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    fn restore_dead_letter(&self, id: JobId, retries: u32) -> Result<JobRecord, StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let mut dls = self.dead_letters.write().map_err(poisoned)?;

        let entry = dls.remove(&id).ok_or_else(|| StoreError::dead_letter_not_found(id))?;
        let mut job = entry.job;
        job.set_retries(retries);
        job.clear_lock();
        Self::bump(&mut job);

        jobs.insert(id, job.clone());
        Ok(job)
    }

    fn delete_dead_letter(&self, id: JobId) -> Result<(), StoreError> {
        let entry = {
            let mut dls = self.dead_letters.write().map_err(poisoned)?;
            dls.remove(&id).ok_or_else(|| StoreError::dead_letter_not_found(id))?
        };
        let mut job = entry.job;
        job.delete_blobs(self)
    }
}
