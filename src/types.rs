//! Core types for fsrelay

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Event payload: string keys mapped to scalar/string (or nested, for `result`) values
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Top-level origin of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Web,
    Dav,
    Task,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Web => "web",
            Category::Dav => "dav",
            Category::Task => "task",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filesystem operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Upload,
    Rename,
    Move,
    Remove,
    Copy,
    Mkdir,
    Find,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Upload => "upload",
            EventType::Rename => "rename",
            EventType::Move => "move",
            EventType::Remove => "remove",
            EventType::Copy => "copy",
            EventType::Mkdir => "mkdir",
            EventType::Find => "find",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical record of one classified or synthesized filesystem operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub category: Category,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Concrete operation: proxy route name, HTTP verb or task kind
    pub method: String,
    pub payload: Payload,
    /// Assigned by the dispatcher at ingestion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Upstream response data, when the operation returned any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl Event {
    /// Create an event with no timestamp and no result
    pub fn new(
        category: Category,
        event_type: EventType,
        method: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            category,
            event_type,
            method: method.into(),
            payload,
            timestamp: None,
            result: None,
        }
    }

    /// Attach upstream result data
    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        if !result.is_null() {
            self.result = Some(result);
        }
        self
    }
}

/// An event as stored in a backend log, paired with its engine-local cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Opaque, engine-specific position (integer key, ObjectId hex, or stream entry id)
    pub id: String,
    #[serde(rename = "data")]
    pub event: Event,
}

/// Kind of upstream background job tracked by the task tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Copy,
    Upload,
    Transfer,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [TaskKind::Copy, TaskKind::Upload, TaskKind::Transfer];

    /// Route segment of the upstream admin task API
    pub fn route(&self) -> &'static str {
        match self {
            TaskKind::Copy => "copy",
            TaskKind::Upload => "upload",
            TaskKind::Transfer => "offline_download_transfer",
        }
    }

    /// Value used as the event `method`
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Copy => "copy",
            TaskKind::Upload => "upload",
            TaskKind::Transfer => "transfer",
        }
    }
}

impl FromStr for TaskKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "copy" => Ok(TaskKind::Copy),
            "upload" => Ok(TaskKind::Upload),
            "transfer" | "offline_download_transfer" => Ok(TaskKind::Transfer),
            _ => Err(RelayError::InvalidInput(format!("unknown task kind: {}", s))),
        }
    }
}

/// Configuration for the task tracker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Upstream base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Upstream admin token; `None` disables the tracker
    pub token: Option<String>,
    /// Fixed poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Delete emitted jobs from the upstream done list, so a restart does not
    /// replay finished jobs
    #[serde(default = "default_remove_done")]
    pub remove_done: bool,
    /// Job kinds to poll
    #[serde(default = "default_task_kinds")]
    pub kinds: Vec<TaskKind>,
}

fn default_base_url() -> String {
    "http://localhost:5244".to_string()
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_remove_done() -> bool {
    true
}

fn default_task_kinds() -> Vec<TaskKind> {
    TaskKind::ALL.to_vec()
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            poll_interval_ms: default_poll_interval(),
            remove_done: default_remove_done(),
            kinds: default_task_kinds(),
        }
    }
}

impl TrackerConfig {
    /// The tracker is inert without a token
    pub fn enabled(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Configuration for the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Webhook URLs; every surviving event is POSTed to each
    #[serde(default)]
    pub webhooks: Vec<String>,
    /// Worker threads for blocking project/collect hooks
    #[serde(default = "default_blocking_workers")]
    pub blocking_workers: usize,
    /// Capacity of the ingestion queue in front of the log
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Per-request webhook timeout in milliseconds
    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_ms: u64,
    /// Webhook deliveries allowed in flight at once; the rest queue
    #[serde(default = "default_max_webhook_deliveries")]
    pub max_webhook_deliveries: usize,
}

fn default_blocking_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_webhook_timeout() -> u64 {
    10_000
}

fn default_max_webhook_deliveries() -> usize {
    crate::dispatch::MAX_IN_FLIGHT
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            webhooks: Vec::new(),
            blocking_workers: default_blocking_workers(),
            queue_capacity: default_queue_capacity(),
            webhook_timeout_ms: default_webhook_timeout(),
            max_webhook_deliveries: default_max_webhook_deliveries(),
        }
    }
}

/// Configuration for pull sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullConfig {
    /// Poll interval for engines without blocking reads, in milliseconds
    #[serde(default = "default_pull_poll")]
    pub poll_interval_ms: u64,
    /// Maximum entries returned per read
    #[serde(default = "default_batch")]
    pub batch_size: usize,
    /// Server-side block time for stream-engine reads, in milliseconds
    #[serde(default = "default_block")]
    pub block_ms: u64,
}

fn default_pull_poll() -> u64 {
    500
}

fn default_batch() -> usize {
    100
}

fn default_block() -> u64 {
    5000
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_pull_poll(),
            batch_size: default_batch(),
            block_ms: default_block(),
        }
    }
}

/// Top-level relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Backend log descriptor (`{engine}://{host}:{port}/{path}`); empty means ephemeral
    #[serde(default)]
    pub db_uri: String,
    /// Stream key / collection / table name for the log
    #[serde(default)]
    pub log_name: Option<String>,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub pull: PullConfig,
}
