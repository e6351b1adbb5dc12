//! `taskdrain-core`: job model building blocks.
//!
//! This crate contains the storage-agnostic primitives shared by every layer:
//! identifiers, the serializable job, its lease record and the clock.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod lease;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use id::{JobId, TriggerId};
pub use job::{DEFAULT_QUEUE, Job, JobPayload};
pub use lease::{JobRecord, Lease};
