//! Redis Streams implementation of the `EventLog` trait
//!
//! Cursors are native stream entry ids (`{ms}-{seq}`). Each entry stores the
//! event JSON in a single `data` field. This is the only engine with blocking
//! reads and consumer groups.
//!
//! A blocking `XREAD`/`XREADGROUP` stalls every command pipelined behind it
//! on the same connection, so blocking reads check out a dedicated
//! connection from a small idle pool while appends use the shared one.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};

use crate::error::{RelayError, Result};
use crate::types::{Event, LogEntry};

use super::backend::{is_beginning, Engine, EventLog, GroupRead, HealthStatus, ReadRequest};
use super::descriptor::LogDescriptor;

/// Field holding the event JSON
const DATA_FIELD: &str = "data";

/// Idle dedicated connections kept for blocking reads
const MAX_IDLE_READERS: usize = 16;

/// Stream-engine beginning marker
const STREAM_BEGINNING: &str = "0-0";

/// `XREADGROUP` id for entries never delivered to the group
const UNDELIVERED: &str = ">";

/// Redis stream event log
pub struct StreamBackend {
    client: Client,
    conn: MultiplexedConnection,
    readers: Mutex<Vec<MultiplexedConnection>>,
    key: String,
}

impl StreamBackend {
    /// Connect to the server named by `descriptor` and use stream `key`
    pub async fn connect(descriptor: &LogDescriptor, key: &str) -> Result<Self> {
        let client = Client::open(descriptor.connection_uri())?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::info!(uri = %descriptor.connection_uri(), key, "connected stream event log");
        Ok(Self {
            client,
            conn,
            readers: Mutex::new(Vec::new()),
            key: key.to_string(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    async fn checkout(&self) -> Result<MultiplexedConnection> {
        let idle = self.readers.lock().pop();
        match idle {
            Some(conn) => Ok(conn),
            None => Ok(self.client.get_multiplexed_async_connection().await?),
        }
    }

    fn checkin(&self, conn: MultiplexedConnection) {
        let mut readers = self.readers.lock();
        if readers.len() < MAX_IDLE_READERS {
            readers.push(conn);
        }
    }

    /// Start id for a plain read: the later of the cursor and the time filter
    fn start_id(request: &ReadRequest) -> Result<String> {
        let cursor = match request.after.as_deref() {
            None => None,
            Some(c) if is_beginning(c) => None,
            Some(c) => Some(parse_stream_id(c).ok_or_else(|| RelayError::InvalidCursor {
                engine: Engine::Stream.as_str(),
                cursor: c.to_string(),
            })?),
        };
        let since = request.from_datetime.map(id_before);

        Ok(match (cursor, since) {
            (Some(c), Some(s)) => format_id(c.max(s)),
            (Some(c), None) => format_id(c),
            (None, Some(s)) => format_id(s),
            (None, None) => STREAM_BEGINNING.to_string(),
        })
    }

    /// One raw `XREAD`/`XREADGROUP` round trip
    async fn xread(
        &self,
        request: &ReadRequest,
        group: Option<&GroupRead>,
        start: &str,
    ) -> Result<Vec<StreamId>> {
        let mut options = StreamReadOptions::default().count(request.limit.max(1));
        if let Some(group) = group {
            options = options.group(&group.group, &group.consumer);
        }

        let reply: Option<StreamReadReply> = match request.block {
            Some(block) => {
                options = options.block(block.as_millis() as usize);
                let mut conn = self.checkout().await?;
                let reply = conn
                    .xread_options(&[&self.key], &[start], &options)
                    .await?;
                self.checkin(conn);
                reply
            }
            None => {
                let mut conn = self.conn.clone();
                conn.xread_options(&[&self.key], &[start], &options)
                    .await?
            }
        };

        Ok(reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default())
    }
}

/// A raw stream batch split into deliverable entries and skipped ids
#[derive(Debug, Default)]
struct Batch {
    entries: Vec<LogEntry>,
    /// Entries without a data field or stamped before the time filter
    skipped: Vec<String>,
    /// Last id of the raw batch, delivered or not
    last_id: Option<String>,
}

fn split_batch(key: &str, raw: Vec<StreamId>, since: Option<DateTime<Utc>>) -> Result<Batch> {
    let mut batch = Batch {
        entries: Vec::with_capacity(raw.len()),
        last_id: raw.last().map(|entry| entry.id.clone()),
        ..Default::default()
    };
    for entry in raw {
        // trimmed entries still listed in a group's pending list have no fields
        let Some(data) = entry.get::<String>(DATA_FIELD) else {
            tracing::warn!(key, id = %entry.id, "stream entry without data field");
            batch.skipped.push(entry.id);
            continue;
        };
        let event: Event = serde_json::from_str(&data)?;
        if let (Some(since), Some(ts)) = (since, event.timestamp) {
            if ts < since {
                batch.skipped.push(entry.id);
                continue;
            }
        }
        batch.entries.push(LogEntry {
            id: entry.id,
            event,
        });
    }
    Ok(batch)
}

/// Parse `{ms}-{seq}` or a bare `{ms}`
fn parse_stream_id(id: &str) -> Option<(u64, u64)> {
    match id.split_once('-') {
        Some((ms, seq)) => Some((ms.parse().ok()?, seq.parse().ok()?)),
        None => Some((id.parse().ok()?, 0)),
    }
}

fn format_id((ms, seq): (u64, u64)) -> String {
    format!("{}-{}", ms, seq)
}

/// Largest id strictly before any entry created at `since`
fn id_before(since: DateTime<Utc>) -> (u64, u64) {
    let ms = u64::try_from(since.timestamp_millis()).unwrap_or(0);
    if ms == 0 {
        (0, 0)
    } else {
        (ms - 1, u64::MAX)
    }
}

#[async_trait]
impl EventLog for StreamBackend {
    fn engine(&self) -> Engine {
        Engine::Stream
    }

    async fn append(&self, event: &Event) -> Result<String> {
        // XADD with `*` ids is ordered server-side
        let data = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(&self.key, "*", &[(DATA_FIELD, data.as_str())])
            .await?;
        Ok(id)
    }

    async fn read(&self, request: &ReadRequest) -> Result<Vec<LogEntry>> {
        let group = request.group.as_ref();
        let mut start = match group {
            // the time filter of a plain read is folded into the start id
            None => Self::start_id(request)?,
            Some(_) => match request.after.as_deref() {
                // entries never delivered to the group
                None => UNDELIVERED.to_string(),
                // replay this consumer's pending entries after the cursor
                Some(c) if is_beginning(c) => STREAM_BEGINNING.to_string(),
                Some(c) => format_id(parse_stream_id(c).ok_or_else(|| {
                    RelayError::InvalidCursor {
                        engine: Engine::Stream.as_str(),
                        cursor: c.to_string(),
                    }
                })?),
            },
        };
        let since = group.and(request.from_datetime);

        // An empty result means the raw read was empty. Batches with nothing
        // deliverable are read past, and for groups their ids are acked so
        // they do not stay pending.
        loop {
            let raw = self.xread(request, group, &start).await?;
            if raw.is_empty() {
                return Ok(Vec::new());
            }
            let batch = split_batch(&self.key, raw, since)?;
            if let Some(group) = group {
                if !batch.skipped.is_empty() {
                    tracing::debug!(
                        key = %self.key,
                        group = %group.group,
                        skipped = batch.skipped.len(),
                        "acking filtered stream entries"
                    );
                    self.ack(&group.group, &batch.skipped).await?;
                }
            }
            if !batch.entries.is_empty() {
                return Ok(batch.entries);
            }
            if start != UNDELIVERED {
                if let Some(last) = batch.last_id {
                    start = last;
                }
            }
        }
    }

    async fn tail(&self) -> Result<String> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn.xrevrange_count(&self.key, "+", "-", 1).await?;
        Ok(reply
            .ids
            .into_iter()
            .next()
            .map_or_else(|| STREAM_BEGINNING.to_string(), |entry| entry.id))
    }

    fn blocking_reads(&self) -> bool {
        true
    }

    fn supports_groups(&self) -> bool {
        true
    }

    async fn ensure_group(&self, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(&self.key, group, "$").await;
        match created {
            Ok(()) => {
                tracing::info!(key = %self.key, group, "created consumer group at stream tail");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ack(&self, group: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(&self.key, group, ids).await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        let start = Instant::now();
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        let details = HashMap::from([
            ("key".to_string(), self.key.clone()),
            (
                "idle_readers".to_string(),
                self.readers.lock().len().to_string(),
            ),
        ]);

        Ok(match result {
            Ok(_) => HealthStatus {
                healthy: true,
                latency_ms,
                error: None,
                details,
            },
            Err(e) => HealthStatus {
                healthy: false,
                latency_ms,
                error: Some(e.to_string()),
                details,
            },
        })
    }

    async fn close(&self) -> Result<()> {
        self.readers.lock().clear();
        Ok(())
    }
}
