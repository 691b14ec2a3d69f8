//! Task tracker: synthesizes `task` events from upstream background jobs
//!
//! The upstream runs copies, upload finalization and offline-download
//! transfers asynchronously, so their completion is invisible to the request
//! path. The tracker polls the job lists on a fixed interval and emits one
//! event per job that reaches `done`.

mod names;
mod snapshot;
mod tracker;

pub use names::task_event;
pub use snapshot::{Completion, JobState, TaskSnapshot, TrackedJob, Transition};
pub use tracker::{PollReport, TaskTracker, TrackerCommand, TrackerHandle};
