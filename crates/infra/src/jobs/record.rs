//! The persisted unit of deferred work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use flowjob_core::{
    BlobId, Clock, EngineResult, Entity, ExpectedVersion, JobId, LockOwner, Persistent,
    PersistentState, StateDiff, SystemClock, TenantId,
};

use super::blob::{BlobRef, BlobStore};
use super::store::StoreError;
use crate::config::{JobServiceConfig, MessageLimit};

/// Blob slot name for offloaded handler configuration.
pub const CONFIGURATION_SLOT: &str = "cfg";
/// Blob slot name for captured failure detail.
pub const EXCEPTION_SLOT: &str = "stacktrace";

/// Field names used in the persistent-state snapshot (and as store column names).
pub mod fields {
    pub const RETRIES: &str = "retries";
    pub const EXCEPTION_MESSAGE: &str = "exception_message";
    pub const HANDLER_TYPE: &str = "handler_type";
    pub const HANDLER_CONFIGURATION: &str = "handler_configuration";
    pub const EXCEPTION_BLOB_ID: &str = "exception_blob_id";
    pub const ADVANCED_CONFIGURATION_BLOB_ID: &str = "advanced_configuration_blob_id";
    pub const LOCK_OWNER: &str = "lock_owner";
    pub const LOCK_EXPIRATION_TIME: &str = "lock_expiration_time";
    pub const TENANT_ID: &str = "tenant_id";
    pub const DUE_AT: &str = "due_at";

    pub const ALL: [&str; 10] = [
        RETRIES,
        EXCEPTION_MESSAGE,
        HANDLER_TYPE,
        HANDLER_CONFIGURATION,
        EXCEPTION_BLOB_ID,
        ADVANCED_CONFIGURATION_BLOB_ID,
        LOCK_OWNER,
        LOCK_EXPIRATION_TIME,
        TENANT_ID,
        DUE_AT,
    ];
}

/// A held lease: owner and expiry are always set together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLock {
    pub owner: LockOwner,
    pub expires_at: DateTime<Utc>,
}

/// Lock state as observed at a given instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Unclaimed,
    Claimed {
        owner: LockOwner,
        expires_at: DateTime<Utc>,
    },
    /// Owner still recorded but the lease ran out; claimable like `Unclaimed`.
    Expired {
        owner: LockOwner,
        expired_at: DateTime<Utc>,
    },
}

impl LockState {
    pub fn is_claimable(&self) -> bool {
        !matches!(self, LockState::Claimed { .. })
    }
}

/// A job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    id: JobId,
    handler_type: String,
    handler_configuration: Option<String>,
    advanced_configuration: Option<BlobRef>,
    retries: u32,
    exception_message: Option<String>,
    exception: Option<BlobRef>,
    tenant_id: TenantId,
    lock: Option<JobLock>,
    due_at: Option<DateTime<Utc>>,
    create_time: DateTime<Utc>,
    revision: u64,
    /// Blobs detached from this record that must be deleted on the next persist.
    #[serde(skip)]
    retired_blobs: Vec<BlobId>,
}

impl JobRecord {
    /// Create a new, unclaimed job stamped with the system clock.
    pub fn new(handler_type: impl Into<String>, tenant_id: TenantId, retries: u32) -> Self {
        Self::created_by(&SystemClock, handler_type, tenant_id, retries)
    }

    /// Create a new, unclaimed job whose creation time is read from `clock`.
    pub fn created_by<C: Clock + ?Sized>(
        clock: &C,
        handler_type: impl Into<String>,
        tenant_id: TenantId,
        retries: u32,
    ) -> Self {
        Self {
            id: JobId::new(),
            handler_type: handler_type.into(),
            handler_configuration: None,
            advanced_configuration: None,
            retries,
            exception_message: None,
            exception: None,
            tenant_id,
            lock: None,
            due_at: None,
            create_time: clock.now(),
            revision: 1,
            retired_blobs: Vec::new(),
        }
    }

    /// Create a job using the configured default tenant and retry budget.
    pub fn from_config(config: &JobServiceConfig, handler_type: impl Into<String>) -> Self {
        Self::new(handler_type, config.default_tenant.clone(), config.default_retries)
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn with_due_at(mut self, at: DateTime<Utc>) -> Self {
        self.due_at = Some(at);
        self
    }

    pub fn handler_type(&self) -> &str {
        &self.handler_type
    }

    pub fn set_handler_type(&mut self, handler_type: impl Into<String>) {
        self.handler_type = handler_type.into();
    }

    pub fn handler_configuration(&self) -> Option<&str> {
        self.handler_configuration.as_deref()
    }

    /// Set the inline configuration. A `Some` value retires any offloaded one.
    pub fn set_handler_configuration(&mut self, configuration: Option<String>) {
        if configuration.is_some() {
            if let Some(blob) = self.advanced_configuration.take() {
                self.retire(blob);
            }
        }
        self.handler_configuration = configuration;
    }

    /// Store configuration inline or offloaded, never both.
    ///
    /// Text longer than `inline_threshold` bytes goes to the `cfg` blob and clears
    /// the inline slot; shorter text goes inline and retires any existing blob.
    pub fn set_configuration(&mut self, text: &str, inline_threshold: usize) {
        if text.len() > inline_threshold {
            self.set_advanced_configuration(text);
        } else {
            self.set_handler_configuration(Some(text.to_string()));
        }
    }

    pub fn advanced_configuration_ref(&self) -> Option<&BlobRef> {
        self.advanced_configuration.as_ref()
    }

    /// Decoded offloaded configuration; `None` when unset.
    pub fn advanced_configuration<S: BlobStore + ?Sized>(
        &self,
        blobs: &S,
    ) -> EngineResult<Option<String>> {
        match &self.advanced_configuration {
            Some(blob) => blob.decode_text(blobs),
            None => Ok(None),
        }
    }

    /// Offload configuration to the `cfg` blob and clear the inline slot.
    pub fn set_advanced_configuration(&mut self, text: &str) {
        self.handler_configuration = None;
        self.advanced_configuration
            .get_or_insert_with(BlobRef::new)
            .encode_text(CONFIGURATION_SLOT, text);
    }

    pub fn set_advanced_configuration_bytes(&mut self, bytes: Vec<u8>) {
        self.handler_configuration = None;
        self.advanced_configuration
            .get_or_insert_with(BlobRef::new)
            .set(CONFIGURATION_SLOT, bytes);
    }

    pub fn exception_ref(&self) -> Option<&BlobRef> {
        self.exception.as_ref()
    }

    /// Full captured failure detail; `None` when no failure was recorded.
    pub fn exception_detail<S: BlobStore + ?Sized>(&self, blobs: &S) -> EngineResult<Option<String>> {
        match &self.exception {
            Some(blob) => blob.decode_text(blobs),
            None => Ok(None),
        }
    }

    pub fn set_exception_detail(&mut self, detail: &str) {
        self.exception
            .get_or_insert_with(BlobRef::new)
            .encode_text(EXCEPTION_SLOT, detail);
    }

    pub fn exception_message(&self) -> Option<&str> {
        self.exception_message.as_deref()
    }

    /// Store a copy of `message` bounded by `limit`.
    pub fn set_exception_message(&mut self, message: &str, limit: &MessageLimit) {
        self.exception_message = Some(limit.apply(message).into_owned());
    }

    /// Forget the last failure (used when a job is restored for another attempt).
    pub fn clear_exception(&mut self) {
        self.exception_message = None;
        if let Some(blob) = self.exception.take() {
            self.retire(blob);
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn set_retries(&mut self, retries: u32) {
        self.retries = retries;
    }

    /// Consume one attempt. Returns `None` (leaving the budget untouched) when the
    /// budget is already exhausted.
    pub fn decrement_retries(&mut self) -> Option<u32> {
        let remaining = self.retries.checked_sub(1)?;
        self.retries = remaining;
        Some(remaining)
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn lock(&self) -> Option<&JobLock> {
        self.lock.as_ref()
    }

    pub fn lock_owner(&self) -> Option<&LockOwner> {
        self.lock.as_ref().map(|l| &l.owner)
    }

    pub fn lock_expiration_time(&self) -> Option<DateTime<Utc>> {
        self.lock.as_ref().map(|l| l.expires_at)
    }

    pub fn lock_state(&self, now: DateTime<Utc>) -> LockState {
        match &self.lock {
            None => LockState::Unclaimed,
            Some(lock) if lock.expires_at < now => LockState::Expired {
                owner: lock.owner.clone(),
                expired_at: lock.expires_at,
            },
            Some(lock) => LockState::Claimed {
                owner: lock.owner.clone(),
                expires_at: lock.expires_at,
            },
        }
    }

    /// Whether `owner` holds an unexpired lease at `now`.
    pub fn is_locked_by(&self, owner: &LockOwner, now: DateTime<Utc>) -> bool {
        matches!(self.lock_state(now), LockState::Claimed { owner: ref o, .. } if o == owner)
    }

    pub(crate) fn set_lock(&mut self, owner: LockOwner, expires_at: DateTime<Utc>) {
        self.lock = Some(JobLock { owner, expires_at });
    }

    pub(crate) fn clear_lock(&mut self) {
        self.lock = None;
    }

    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        self.due_at
    }

    pub fn set_due_at(&mut self, at: Option<DateTime<Utc>>) {
        self.due_at = at;
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at.is_none_or(|at| at <= now)
    }

    pub fn create_time(&self) -> DateTime<Utc> {
        self.create_time
    }

    /// Revision a write of this instance must find in the store.
    pub fn expected_version(&self) -> ExpectedVersion {
        ExpectedVersion::Exact(self.revision)
    }

    pub(crate) fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    fn retire(&mut self, blob: BlobRef) {
        if let Some(id) = blob.id() {
            self.retired_blobs.push(id);
        }
    }

    /// Write buffered blob content, returning the ids of blobs created by this flush.
    ///
    /// Must run before the persistent state is diffed so new blob ids are included.
    /// Rewritten blobs get a new id; the superseded ones are retired and, like every
    /// retired blob, left alone until the update is known to have succeeded. After
    /// a failed write the caller deletes the returned ids and reloads the record.
    pub fn flush_blobs<S: BlobStore + ?Sized>(&mut self, blobs: &S) -> Result<Vec<BlobId>, StoreError> {
        let mut created = Vec::new();
        let mut superseded = Vec::new();
        for blob in [self.advanced_configuration.as_mut(), self.exception.as_mut()]
            .into_iter()
            .flatten()
        {
            match blob.flush(blobs) {
                Ok(Some(flushed)) => {
                    created.push(flushed.written);
                    superseded.extend(flushed.superseded);
                }
                Ok(None) => {}
                Err(err) => {
                    for id in created {
                        if let Err(cleanup) = blobs.delete_blob(id) {
                            warn!(blob_id = %id, error = %cleanup, "orphaned blob after failed flush");
                        }
                    }
                    return Err(err);
                }
            }
        }
        self.retired_blobs.extend(superseded);
        Ok(created)
    }

    /// Delete blobs detached from this record since it was last persisted.
    pub fn purge_retired_blobs<S: BlobStore + ?Sized>(&mut self, blobs: &S) -> Result<(), StoreError> {
        for id in self.retired_blobs.drain(..) {
            blobs.delete_blob(id)?;
        }
        Ok(())
    }

    /// Delete every blob owned by this record.
    pub fn delete_blobs<S: BlobStore + ?Sized>(&mut self, blobs: &S) -> Result<(), StoreError> {
        if let Some(blob) = self.advanced_configuration.as_mut() {
            blob.delete(blobs)?;
        }
        if let Some(blob) = self.exception.as_mut() {
            blob.delete(blobs)?;
        }
        for id in self.retired_blobs.drain(..) {
            blobs.delete_blob(id)?;
        }
        Ok(())
    }

    /// Copy without buffered blob content or caches, as a store keeps it.
    pub(crate) fn detached(&self) -> Self {
        Self {
            advanced_configuration: self.advanced_configuration.as_ref().map(BlobRef::detached),
            exception: self.exception.as_ref().map(BlobRef::detached),
            retired_blobs: Vec::new(),
            ..self.clone()
        }
    }

    /// Copy the fields named in `diff` from `source` (partial update).
    pub(crate) fn apply_changes(&mut self, source: &JobRecord, diff: &StateDiff) {
        for field in diff.fields() {
            match field {
                fields::RETRIES => self.retries = source.retries,
                fields::EXCEPTION_MESSAGE => {
                    self.exception_message = source.exception_message.clone()
                }
                fields::HANDLER_TYPE => self.handler_type = source.handler_type.clone(),
                fields::HANDLER_CONFIGURATION => {
                    self.handler_configuration = source.handler_configuration.clone()
                }
                fields::EXCEPTION_BLOB_ID => {
                    self.exception = source.exception.as_ref().map(BlobRef::detached)
                }
                fields::ADVANCED_CONFIGURATION_BLOB_ID => {
                    self.advanced_configuration =
                        source.advanced_configuration.as_ref().map(BlobRef::detached)
                }
                fields::LOCK_OWNER | fields::LOCK_EXPIRATION_TIME => {
                    self.lock = source.lock.clone()
                }
                fields::TENANT_ID => self.tenant_id = source.tenant_id.clone(),
                fields::DUE_AT => self.due_at = source.due_at,
                _ => {}
            }
        }
    }
}

/// Column values of a persisted job, as read back by a durable store.
#[derive(Debug)]
pub(crate) struct StoredJob {
    pub id: JobId,
    pub revision: u64,
    pub handler_type: String,
    pub handler_configuration: Option<String>,
    pub advanced_configuration_blob_id: Option<BlobId>,
    pub retries: u32,
    pub exception_message: Option<String>,
    pub exception_blob_id: Option<BlobId>,
    pub tenant_id: TenantId,
    pub lock: Option<JobLock>,
    pub due_at: Option<DateTime<Utc>>,
    pub create_time: DateTime<Utc>,
}

impl From<StoredJob> for JobRecord {
    fn from(row: StoredJob) -> Self {
        Self {
            id: row.id,
            handler_type: row.handler_type,
            handler_configuration: row.handler_configuration,
            advanced_configuration: row
                .advanced_configuration_blob_id
                .map(|id| BlobRef::stored(id, CONFIGURATION_SLOT)),
            retries: row.retries,
            exception_message: row.exception_message,
            exception: row
                .exception_blob_id
                .map(|id| BlobRef::stored(id, EXCEPTION_SLOT)),
            tenant_id: row.tenant_id,
            lock: row.lock,
            due_at: row.due_at,
            create_time: row.create_time,
            revision: row.revision,
            retired_blobs: Vec::new(),
        }
    }
}

impl Entity for JobRecord {
    type Id = JobId;

    fn id(&self) -> &JobId {
        &self.id
    }
}

impl Persistent for JobRecord {
    fn persistent_state(&self) -> PersistentState {
        PersistentState::new()
            .with(fields::RETRIES, self.retries)
            .with(fields::EXCEPTION_MESSAGE, self.exception_message.as_deref())
            .with(fields::HANDLER_TYPE, self.handler_type.as_str())
            .with(fields::HANDLER_CONFIGURATION, self.handler_configuration.as_deref())
            .with_optional(
                fields::EXCEPTION_BLOB_ID,
                self.exception.as_ref().and_then(BlobRef::id).map(uuid::Uuid::from),
            )
            .with_optional(
                fields::ADVANCED_CONFIGURATION_BLOB_ID,
                self.advanced_configuration
                    .as_ref()
                    .and_then(BlobRef::id)
                    .map(uuid::Uuid::from),
            )
            .with(fields::LOCK_OWNER, self.lock_owner().map(LockOwner::as_str))
            .with(fields::LOCK_EXPIRATION_TIME, self.lock_expiration_time())
            .with(fields::TENANT_ID, self.tenant_id.as_str())
            .with(fields::DUE_AT, self.due_at)
    }

    fn revision(&self) -> u64 {
        self.revision
    }
}

impl core::fmt::Display for JobRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "JobRecord [id={}]", self.id)
    }
}

/// A job whose retry budget ran out, kept for inspection and manual restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterJob {
    pub job: JobRecord,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterJob {
    pub fn new(job: JobRecord, reason: String, at: DateTime<Utc>) -> Self {
        Self {
            job,
            dead_lettered_at: at,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job() -> JobRecord {
        JobRecord::new("async-continuation", TenantId::new(""), 3)
    }

    #[test]
    fn new_job_is_unclaimed_and_due() {
        let job = job();
        let now = Utc::now();
        assert_eq!(job.lock_state(now), LockState::Unclaimed);
        assert!(job.is_due(now));
        assert_eq!(job.revision(), 1);
    }

    #[test]
    fn from_config_uses_configured_defaults() {
        let config = JobServiceConfig::default()
            .with_default_retries(7)
            .with_default_tenant(TenantId::new("acme"));
        let job = JobRecord::from_config(&config, "timer");
        assert_eq!(job.retries(), 7);
        assert_eq!(job.tenant_id().as_str(), "acme");
    }

    #[test]
    fn lock_state_distinguishes_expired() {
        let mut job = job();
        let now = Utc::now();
        let owner = LockOwner::new("node-a").unwrap();
        job.set_lock(owner.clone(), now + Duration::seconds(10));

        assert!(job.is_locked_by(&owner, now));
        let later = now + Duration::seconds(11);
        assert!(matches!(job.lock_state(later), LockState::Expired { .. }));
        assert!(job.lock_state(later).is_claimable());
        assert!(!job.is_locked_by(&owner, later));
    }

    #[test]
    fn decrement_never_goes_negative() {
        let mut job = JobRecord::new("t", TenantId::new(""), 1);
        assert_eq!(job.decrement_retries(), Some(0));
        assert_eq!(job.decrement_retries(), None);
        assert_eq!(job.retries(), 0);
    }

    #[test]
    fn exception_message_is_truncated_on_write() {
        let mut job = job();
        let long = "x".repeat(1000);
        job.set_exception_message(&long, &MessageLimit::default());
        let stored = job.exception_message().unwrap();
        assert_eq!(stored.chars().count(), 255);
        assert!(stored.ends_with("..."));
    }

    #[test]
    fn snapshot_is_stable_without_mutation() {
        let job = job();
        assert_eq!(job.persistent_state(), job.persistent_state());
    }

    #[test]
    fn snapshot_changes_exactly_the_mutated_field() {
        let mut job = job();
        let before = job.persistent_state();
        job.set_retries(1);
        let diff = before.diff(&job.persistent_state());
        assert_eq!(diff.fields().collect::<Vec<_>>(), vec![fields::RETRIES]);
    }

    #[test]
    fn snapshot_tracks_blob_identity_not_content() {
        let mut job = job();
        job.set_exception_detail("trace");
        let state = job.persistent_state();
        // Not flushed yet: no identity, so no entry.
        assert_eq!(state.get(fields::EXCEPTION_BLOB_ID), &flowjob_core::StateValue::Null);
        assert!(!state.iter().any(|(_, v)| v == &flowjob_core::StateValue::from("trace")));
    }

    #[test]
    fn configuration_is_routed_to_exactly_one_slot() {
        let mut job = job();
        job.set_configuration("small", 10);
        assert_eq!(job.handler_configuration(), Some("small"));
        assert!(job.advanced_configuration_ref().is_none());

        job.set_configuration("much longer than ten", 10);
        assert_eq!(job.handler_configuration(), None);
        assert!(job.advanced_configuration_ref().is_some_and(BlobRef::has_pending));
    }

    #[test]
    fn direct_setters_keep_a_single_configuration_slot() {
        let blobs = crate::jobs::InMemoryJobStore::new();
        let mut job = job();

        job.set_handler_configuration(Some("inline".into()));
        job.set_advanced_configuration("offloaded");
        assert_eq!(job.handler_configuration(), None);
        job.flush_blobs(&blobs).unwrap();
        assert_eq!(blobs.blob_count(), 1);

        job.set_handler_configuration(Some("inline again".into()));
        assert!(job.advanced_configuration_ref().is_none());
        job.purge_retired_blobs(&blobs).unwrap();
        assert_eq!(blobs.blob_count(), 0);

        job.set_advanced_configuration_bytes(b"raw".to_vec());
        assert_eq!(job.handler_configuration(), None);
        assert!(job.advanced_configuration_ref().is_some());
    }

    /// Accepts one blob, then refuses further writes.
    struct OnePutThenDown {
        inner: crate::jobs::InMemoryJobStore,
        puts: std::sync::atomic::AtomicUsize,
    }

    impl BlobStore for OnePutThenDown {
        fn get_blob(&self, id: BlobId) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get_blob(id)
        }

        fn put_blob(&self, name: &str, bytes: &[u8]) -> Result<BlobId, StoreError> {
            if self.puts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) > 0 {
                return Err(StoreError::Unavailable("disk full".to_string()));
            }
            self.inner.put_blob(name, bytes)
        }

        fn delete_blob(&self, id: BlobId) -> Result<(), StoreError> {
            self.inner.delete_blob(id)
        }
    }

    #[test]
    fn partial_flush_deletes_the_blobs_it_created() {
        let blobs = OnePutThenDown {
            inner: crate::jobs::InMemoryJobStore::new(),
            puts: Default::default(),
        };
        let mut job = job();
        job.set_advanced_configuration("offloaded");
        job.set_exception_detail("trace");

        assert!(job.flush_blobs(&blobs).is_err());
        assert_eq!(blobs.inner.blob_count(), 0);
    }

    #[test]
    fn clearing_inline_configuration_keeps_offloaded_one() {
        let mut job = job();
        job.set_advanced_configuration("offloaded");
        job.set_handler_configuration(None);
        assert!(job.advanced_configuration_ref().is_some());
    }

    #[test]
    fn create_time_comes_from_the_given_clock() {
        let clock = flowjob_core::ManualClock::deterministic();
        clock.advance(std::time::Duration::from_secs(90));
        let job = JobRecord::created_by(&clock, "timer", TenantId::new(""), 3);
        assert_eq!(job.create_time(), clock.now());
        assert!(job.is_due(clock.now()));
    }
}
