//! Deferred job scheduling with leases, retries and dead-lettering.
//!
//! ## Design
//!
//! - Jobs are tenant-scoped records keyed by `handler_type`
//! - A lease (lock owner + expiry) grants one engine instance the right to run a job
//! - Every lock transition is one conditional write in the store
//! - Retry budget per job; an exhausted budget moves the job to the dead-letter table
//! - Large payloads (configuration, failure detail) are offloaded to blobs
//!
//! ## Components
//!
//! - `JobRecord`: the persisted unit of work, with its diffable snapshot
//! - `BlobRef`: lazily fetched, buffered blob reference
//! - `JobStore`: persistence boundary (in-memory or Postgres)
//! - `LeaseManager`: claim / renew / release / record_failure
//! - `JobExecutor`: polling loop that runs handlers on claimed jobs

pub mod blob;
pub mod executor;
pub mod lease;
pub mod postgres;
pub mod record;
pub mod store;

pub use blob::{BlobRef, BlobStore, Flushed};
pub use executor::{
    ExecutorStats, JobExecution, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobRunOutcome,
};
pub use lease::{
    ClaimOutcome, CompleteOutcome, FailureOutcome, HandlerError, LeaseManager, ReleaseOutcome,
    RenewOutcome,
};
pub use postgres::PostgresJobStore;
pub use record::{DeadLetterJob, JobLock, JobRecord, LockState};
pub use store::{InMemoryJobStore, JobStore, StoreError};
