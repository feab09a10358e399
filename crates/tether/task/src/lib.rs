//! # Tether Task - status records for long-running operations
//!
//! A long operation (applying a generation, removing an app) is represented
//! by a stable task id. While the operation runs, its record carries a
//! message, a `running` tag and a liveness timestamp that advances once per
//! second. On success the record is cleared; on failure it is left with a
//! terminal message and the `failed` tag.
//!
//! Readers detect a stalled operation by comparing the timestamp's age with a
//! threshold while the tag is not terminal, see [`TaskRecord::is_stalled`].
//!
//! ## Key Components
//!
//! - [`TaskStatusTracker`]: starts tasks and owns the tick interval
//! - [`ActiveTask`]: handle of a running task; finishing it stops the tick
//! - [`TaskStore`]: persistence seam, with [`InMemoryTaskStore`]
//! - [`ActionableError`]: error whose message is safe to show an operator

#![deny(unsafe_code)]

pub mod error;
pub mod store;
pub mod tracker;

pub use error::{failure_message, ActionableError, TaskError, TaskResult};
pub use store::{InMemoryTaskStore, TaskRecord, TaskStore, STATUS_FAILED, STATUS_RUNNING};
pub use tracker::{ActiveTask, TaskStatusTracker};
