//! Event log trait abstracting the storage engines
//!
//! This module defines the `EventLog` trait that every engine implements:
//! relational (SQLite), document (MongoDB), stream (Redis Streams) and the
//! in-memory log. Callers depend only on the trait; cursors stay opaque
//! strings end-to-end and are only decoded by the engine that issued them.
//!
//! # Design Principles
//!
//! 1. **Append-only**: `append` is the only write path. Events are never
//!    mutated or removed by normal operation.
//!
//! 2. **Ordered**: appends are serialized inside each engine, so ids strictly
//!    increase in arrival order within one log instance.
//!
//! 3. **Opaque cursors**: an id is only comparable to ids from the same log.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{RelayError, Result};
use crate::types::{Event, LogEntry};

/// Storage engine identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    /// No log; events go to the `collect` callback only
    Console,
    Memory,
    Relational,
    Document,
    Stream,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Console => "console",
            Engine::Memory => "memory",
            Engine::Relational => "relational",
            Engine::Document => "document",
            Engine::Stream => "stream",
        }
    }

    /// Resolve an engine name or one of its aliases
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "console" => Some(Engine::Console),
            "memory" => Some(Engine::Memory),
            "relational" | "sqlite" => Some(Engine::Relational),
            "document" | "mongodb" | "mongo" => Some(Engine::Document),
            "stream" | "redis" => Some(Engine::Stream),
            _ => None,
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consumer-group read (stream engine only)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRead {
    pub group: String,
    /// Member name used for delivery accounting
    pub consumer: String,
}

/// Parameters of a single read
#[derive(Debug, Clone, Default)]
pub struct ReadRequest {
    /// Exclusive lower bound; `None` reads from the beginning, or, for group
    /// reads, delivers entries never delivered to the group
    pub after: Option<String>,
    pub group: Option<GroupRead>,
    /// Only entries stamped at or after this instant
    pub from_datetime: Option<DateTime<Utc>>,
    /// Maximum entries to return
    pub limit: usize,
    /// Server-side wait for new entries; honored by engines with blocking reads
    pub block: Option<Duration>,
}

impl ReadRequest {
    /// Read everything after `after` (or from the beginning), up to `limit`
    pub fn after(after: Option<String>, limit: usize) -> Self {
        Self {
            after,
            limit,
            ..Default::default()
        }
    }
}

/// Health status of the log
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub latency_ms: f64,
    pub error: Option<String>,
    pub details: HashMap<String, String>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            healthy: true,
            latency_ms: 0.0,
            error: None,
            details: HashMap::new(),
        }
    }
}

/// The backend log interface
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Engine identity, used for cursor decoding and session latency policy
    fn engine(&self) -> Engine;

    /// Durably store an event and return its engine-local id
    async fn append(&self, event: &Event) -> Result<String>;

    /// Entries after `request.after`, in arrival order
    async fn read(&self, request: &ReadRequest) -> Result<Vec<LogEntry>>;

    /// Id of the newest entry, or the beginning-of-log cursor when empty.
    ///
    /// Reading after the tail is how "start from now" is implemented.
    async fn tail(&self) -> Result<String>;

    /// Whether `read` can wait server-side for new entries
    fn blocking_reads(&self) -> bool {
        false
    }

    /// Whether consumer groups are supported
    fn supports_groups(&self) -> bool {
        false
    }

    /// Create `group` at the current tail if it does not exist yet
    async fn ensure_group(&self, group: &str) -> Result<()> {
        Err(unsupported_groups(self.engine(), group))
    }

    /// Acknowledge delivered entries for `group`
    async fn ack(&self, group: &str, _ids: &[String]) -> Result<()> {
        Err(unsupported_groups(self.engine(), group))
    }

    /// Perform a health check
    async fn health_check(&self) -> Result<HealthStatus>;

    /// Flush and release the underlying resources
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn unsupported_groups(engine: Engine, group: &str) -> RelayError {
    RelayError::InvalidInput(format!(
        "consumer group '{}' requested, but the {} engine has no consumer groups",
        group, engine
    ))
}

/// Beginning-of-log marker accepted by every engine
pub const BEGINNING: &str = "0";

/// Whether a client cursor means "from the beginning"
pub fn is_beginning(cursor: &str) -> bool {
    cursor == BEGINNING || cursor == "0-0"
}
