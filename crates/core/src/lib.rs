//! `flowjob-core`: domain building blocks of the job engine.
//!
//! This crate contains **pure** primitives (no store access, no IO).

pub mod clock;
pub mod entity;
pub mod error;
pub mod id;
pub mod state;
pub mod version;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::{Entity, Persistent};
pub use error::{EngineError, EngineResult, EntityKind};
pub use id::{BlobId, JobId, LockOwner, ScopeId, TaskId, TenantId};
pub use state::{PersistentState, StateDiff, StateValue};
pub use version::ExpectedVersion;
