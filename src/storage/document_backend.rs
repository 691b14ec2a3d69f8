//! MongoDB implementation of the `EventLog` trait
//!
//! Cursors are ObjectId hex strings. ObjectIds are generated client-side and
//! inserts are serialized, so `_id` order equals append order for this
//! process. Each document also carries a native `created_at` date and a
//! microsecond `created_key` string; the `from_datetime` filter runs on the
//! key because BSON dates stop at milliseconds.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, doc, oid::ObjectId, Document};
use mongodb::options::{FindOneOptions, FindOptions, IndexOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RelayError, Result};
use crate::types::{Category, Event, EventType, LogEntry, Payload};

use super::backend::{is_beginning, Engine, EventLog, HealthStatus, ReadRequest, BEGINNING};
use super::descriptor::LogDescriptor;
use super::timestamp_key;

/// Database used when the descriptor has no path
pub const DEFAULT_DATABASE: &str = "fsrelay";

/// Stored shape of an event
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventDocument {
    #[serde(rename = "_id")]
    id: ObjectId,
    category: Category,
    #[serde(rename = "type")]
    event_type: EventType,
    method: String,
    payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<DateTime<Utc>>,
    created_at: bson::DateTime,
    /// Sortable microsecond form of the creation instant
    created_key: String,
}

impl EventDocument {
    fn new(event: &Event) -> Self {
        let created = event.timestamp.unwrap_or_else(Utc::now);
        Self {
            id: ObjectId::new(),
            category: event.category,
            event_type: event.event_type,
            method: event.method.clone(),
            payload: event.payload.clone(),
            result: event.result.clone(),
            timestamp: event.timestamp,
            created_at: bson::DateTime::from_millis(created.timestamp_millis()),
            created_key: timestamp_key(Some(created)),
        }
    }

    fn into_entry(self) -> LogEntry {
        LogEntry {
            id: self.id.to_hex(),
            event: Event {
                category: self.category,
                event_type: self.event_type,
                method: self.method,
                payload: self.payload,
                timestamp: self.timestamp,
                result: self.result,
            },
        }
    }
}

/// Entries created at or after `since`, at microsecond precision
fn since_filter(since: DateTime<Utc>) -> Document {
    doc! { "created_key": { "$gte": timestamp_key(Some(since)) } }
}

/// Document-store event log
pub struct DocumentBackend {
    database: Database,
    events: Collection<EventDocument>,
    /// Serializes inserts so ObjectId order matches commit order
    append_lock: tokio::sync::Mutex<()>,
}

impl DocumentBackend {
    /// Connect and prepare the `collection` in the descriptor's database
    pub async fn connect(descriptor: &LogDescriptor, collection: &str) -> Result<Self> {
        let client = Client::with_uri_str(descriptor.connection_uri()).await?;
        let database = client.database(descriptor.path.as_deref().unwrap_or(DEFAULT_DATABASE));
        let events = database.collection::<EventDocument>(collection);

        let index = IndexModel::builder()
            .keys(doc! { "created_key": 1 })
            .options(
                IndexOptions::builder()
                    .name(format!("{}_created_key", collection))
                    .build(),
            )
            .build();
        events.create_index(index, None).await?;

        tracing::info!(
            database = %database.name(),
            collection,
            "connected document event log"
        );
        Ok(Self {
            database,
            events,
            append_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn parse_cursor(cursor: Option<&str>) -> Result<Option<ObjectId>> {
        match cursor {
            None => Ok(None),
            Some(c) if is_beginning(c) => Ok(None),
            Some(c) => ObjectId::parse_str(c)
                .map(Some)
                .map_err(|_| RelayError::InvalidCursor {
                    engine: Engine::Document.as_str(),
                    cursor: c.to_string(),
                }),
        }
    }
}

#[async_trait]
impl EventLog for DocumentBackend {
    fn engine(&self) -> Engine {
        Engine::Document
    }

    async fn append(&self, event: &Event) -> Result<String> {
        let _guard = self.append_lock.lock().await;
        let document = EventDocument::new(event);
        let id = document.id;
        self.events.insert_one(document, None).await?;
        Ok(id.to_hex())
    }

    async fn read(&self, request: &ReadRequest) -> Result<Vec<LogEntry>> {
        if request.group.is_some() {
            return Err(RelayError::InvalidInput(
                "the document engine has no consumer groups".to_string(),
            ));
        }

        let mut filter = Document::new();
        if let Some(after) = Self::parse_cursor(request.after.as_deref())? {
            filter.insert("_id", doc! { "$gt": after });
        }
        if let Some(since) = request.from_datetime {
            for (key, bound) in since_filter(since) {
                filter.insert(key, bound);
            }
        }

        let options = FindOptions::builder()
            .sort(doc! { "_id": 1 })
            .limit(request.limit.max(1) as i64)
            .build();
        let cursor = self.events.find(filter, options).await?;
        let documents: Vec<EventDocument> = cursor.try_collect().await?;
        Ok(documents.into_iter().map(EventDocument::into_entry).collect())
    }

    async fn tail(&self) -> Result<String> {
        let options = FindOneOptions::builder()
            .sort(doc! { "_id": -1 })
            .projection(doc! { "_id": 1 })
            .build();
        let newest = self
            .events
            .clone_with_type::<Document>()
            .find_one(None, options)
            .await?;

        match newest {
            Some(document) => document
                .get_object_id("_id")
                .map(|id| id.to_hex())
                .map_err(|e| RelayError::Storage(format!("malformed event document: {}", e))),
            None => Ok(BEGINNING.to_string()),
        }
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        let start = Instant::now();
        let result = self.database.run_command(doc! { "ping": 1 }, None).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        let details = HashMap::from([
            ("database".to_string(), self.database.name().to_string()),
            ("collection".to_string(), self.events.name().to_string()),
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
}
