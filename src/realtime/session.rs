//! Pull session: streams log entries to one client from a fixed start
//!
//! The cursor only moves forward. Group sessions acknowledge each entry
//! after it has been handed to the sink; a disconnect never rolls an
//! acknowledgment back, so clients must tolerate redelivery.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt};

use super::protocol::{PullMessage, PullRequest};
use crate::error::{RelayError, Result};
use crate::storage::{EventLog, GroupRead, ReadRequest};
use crate::types::PullConfig;

/// How a session ended without a backend failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The sink refused a message
    Disconnected,
}

/// One client's resumable read loop
pub struct PullSession {
    log: Arc<dyn EventLog>,
    config: PullConfig,
    lastid: Option<String>,
    group: Option<GroupRead>,
    from_datetime: Option<DateTime<Utc>>,
}

impl PullSession {
    /// Validate `request` against the log's capabilities.
    ///
    /// `default_name` is the group member name used when the request has none.
    pub fn new(
        log: Arc<dyn EventLog>,
        config: PullConfig,
        request: &PullRequest,
        default_name: &str,
    ) -> Result<Self> {
        let group = match request.group() {
            Some(group) if !log.supports_groups() => {
                return Err(RelayError::InvalidInput(format!(
                    "consumer group '{}' requested, but the {} engine has no consumer groups",
                    group,
                    log.engine()
                )));
            }
            Some(group) => Some(GroupRead {
                group: group.to_string(),
                consumer: request.name().unwrap_or(default_name).to_string(),
            }),
            None => None,
        };

        Ok(Self {
            from_datetime: request.from_datetime()?,
            lastid: request.lastid().map(str::to_string),
            log,
            config,
            group,
        })
    }

    pub fn group(&self) -> Option<&GroupRead> {
        self.group.as_ref()
    }

    /// Resolve the starting cursor; `None` for a group means "undelivered"
    async fn start_cursor(&self) -> Result<Option<String>> {
        if let Some(group) = &self.group {
            self.log.ensure_group(&group.group).await?;
            return Ok(self.lastid.clone());
        }
        match &self.lastid {
            Some(lastid) => Ok(Some(lastid.clone())),
            // a time filter without a cursor scans from the beginning
            None if self.from_datetime.is_some() => Ok(None),
            None => Ok(Some(self.log.tail().await?)),
        }
    }

    /// Run until the sink disconnects or the log fails.
    ///
    /// A log failure is reported to the sink as a terminal error frame and
    /// returned; the caller closes the transport.
    pub async fn run<S>(self, sink: &mut S) -> Result<SessionEnd>
    where
        S: Sink<PullMessage> + Unpin,
    {
        match self.stream(sink).await {
            Ok(end) => Ok(end),
            Err(e) => {
                tracing::warn!(engine = %self.log.engine(), error = %e, "pull session failed");
                let _ = sink.send(PullMessage::error(&e)).await;
                Err(e)
            }
        }
    }

    async fn stream<S>(&self, sink: &mut S) -> Result<SessionEnd>
    where
        S: Sink<PullMessage> + Unpin,
    {
        let mut cursor = self.start_cursor().await?;
        // group sessions resuming from a cursor first replay their pending entries
        let mut replaying = self.group.is_some() && cursor.is_some();
        let blocking = self.log.blocking_reads();
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));

        loop {
            let request = ReadRequest {
                after: cursor.clone(),
                group: self.group.clone(),
                from_datetime: self.from_datetime,
                limit: self.config.batch_size.max(1),
                block: blocking.then(|| Duration::from_millis(self.config.block_ms)),
            };
            let entries = self.log.read(&request).await?;

            if entries.is_empty() {
                if replaying {
                    replaying = false;
                    cursor = None;
                    continue;
                }
                if !blocking {
                    tokio::time::sleep(poll).await;
                }
                continue;
            }

            for entry in entries {
                let id = entry.id.clone();
                if sink.send(PullMessage::Entry(entry)).await.is_err() {
                    return Ok(SessionEnd::Disconnected);
                }
                if let Some(group) = &self.group {
                    self.log.ack(&group.group, std::slice::from_ref(&id)).await?;
                    if replaying {
                        cursor = Some(id);
                    }
                } else {
                    cursor = Some(id);
                }
            }
        }
    }
}
