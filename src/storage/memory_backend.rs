//! In-process event log
//!
//! Same cursor semantics as the relational engine (1-based integer ids), but
//! nothing survives the process.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{RelayError, Result};
use crate::types::{Event, LogEntry};

use super::backend::{is_beginning, Engine, EventLog, HealthStatus, ReadRequest, BEGINNING};

/// Append-only vector of events
#[derive(Default)]
pub struct MemoryBackend {
    events: RwLock<Vec<Event>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

fn parse_cursor(cursor: Option<&str>) -> Result<usize> {
    match cursor {
        None => Ok(0),
        Some(c) if is_beginning(c) => Ok(0),
        Some(c) => c.parse::<usize>().map_err(|_| RelayError::InvalidCursor {
            engine: Engine::Memory.as_str(),
            cursor: c.to_string(),
        }),
    }
}

#[async_trait]
impl EventLog for MemoryBackend {
    fn engine(&self) -> Engine {
        Engine::Memory
    }

    async fn append(&self, event: &Event) -> Result<String> {
        let mut events = self.events.write();
        events.push(event.clone());
        Ok(events.len().to_string())
    }

    async fn read(&self, request: &ReadRequest) -> Result<Vec<LogEntry>> {
        if request.group.is_some() {
            return Err(RelayError::InvalidInput(
                "the memory engine has no consumer groups".to_string(),
            ));
        }
        let after = parse_cursor(request.after.as_deref())?;
        let events = self.events.read();

        Ok(events
            .iter()
            .enumerate()
            .skip(after)
            .filter(|(_, event)| match (request.from_datetime, event.timestamp) {
                (Some(since), Some(ts)) => ts >= since,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .take(request.limit.max(1))
            .map(|(idx, event)| LogEntry {
                id: (idx + 1).to_string(),
                event: event.clone(),
            })
            .collect())
    }

    async fn tail(&self) -> Result<String> {
        let len = self.events.read().len();
        Ok(if len == 0 {
            BEGINNING.to_string()
        } else {
            len.to_string()
        })
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        Ok(HealthStatus {
            details: HashMap::from([("events".to_string(), self.len().to_string())]),
            ..Default::default()
        })
    }
}
