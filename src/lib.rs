//! fsrelay - filesystem event capture and resumable distribution
//!
//! Classifies completed operations seen by a cloud-storage reverse proxy
//! into filesystem events, tracks asynchronous upstream jobs, fans events out
//! to webhooks and an append-only backend log, and serves resumable pull
//! sessions over that log.

pub mod classify;
pub mod dispatch;
pub mod error;
pub mod realtime;
pub mod storage;
pub mod tasks;
pub mod types;
pub mod upstream;

pub use classify::{classify, Classifier, OperationDescriptor, Surface};
pub use dispatch::{Dispatcher, Hook};
pub use error::{RelayError, Result};
pub use storage::{open_log, EventLog, LogDescriptor};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
