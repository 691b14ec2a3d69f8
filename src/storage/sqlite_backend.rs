//! SQLite implementation of the `EventLog` trait
//!
//! Cursors are the table's integer primary key. rusqlite is synchronous, so
//! every call hops onto the blocking pool; the connection mutex serializes
//! appends.

use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};

use crate::error::{RelayError, Result};
use crate::types::{Event, LogEntry};

use super::backend::{is_beginning, Engine, EventLog, HealthStatus, ReadRequest, BEGINNING};
use super::connection::Storage;
use super::timestamp_key;

/// Relational event log
pub struct SqliteBackend {
    storage: Storage,
}

impl SqliteBackend {
    /// Open the log stored in `table` of the database at `path`
    pub fn open(path: impl AsRef<Path>, table: &str) -> Result<Self> {
        Ok(Self {
            storage: Storage::open(path, table)?,
        })
    }

    /// Open a log in a temporary directory that disappears with the backend
    pub fn ephemeral(table: &str) -> Result<Self> {
        Ok(Self {
            storage: Storage::open_ephemeral(table)?,
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Storage) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || f(&storage))
            .await
            .map_err(|e| RelayError::Internal(format!("blocking task failed: {}", e)))?
    }
}

fn parse_cursor(cursor: Option<&str>) -> Result<i64> {
    match cursor {
        None => Ok(0),
        Some(c) if is_beginning(c) => Ok(0),
        Some(c) => c
            .parse::<i64>()
            .ok()
            .filter(|id| *id >= 0)
            .ok_or_else(|| RelayError::InvalidCursor {
                engine: Engine::Relational.as_str(),
                cursor: c.to_string(),
            }),
    }
}

#[async_trait]
impl EventLog for SqliteBackend {
    fn engine(&self) -> Engine {
        Engine::Relational
    }

    async fn append(&self, event: &Event) -> Result<String> {
        let data = serde_json::to_string(event)?;
        let timestamp = timestamp_key(event.timestamp);
        let (category, event_type, method) = (
            event.category.as_str(),
            event.event_type.as_str(),
            event.method.clone(),
        );

        let id = self
            .blocking(move |storage| {
                let sql = format!(
                    "INSERT INTO {} (category, type, method, timestamp, data) VALUES (?1, ?2, ?3, ?4, ?5)",
                    storage.table()
                );
                storage.with_transaction(|conn| {
                    conn.execute(&sql, params![category, event_type, method, timestamp, data])?;
                    Ok(conn.last_insert_rowid())
                })
            })
            .await?;
        Ok(id.to_string())
    }

    async fn read(&self, request: &ReadRequest) -> Result<Vec<LogEntry>> {
        if let Some(group) = &request.group {
            return Err(RelayError::InvalidInput(format!(
                "consumer group '{}' requested, but the relational engine has no consumer groups",
                group.group
            )));
        }
        let after = parse_cursor(request.after.as_deref())?;
        let since = request.from_datetime.map(|dt| timestamp_key(Some(dt)));
        let limit = request.limit.max(1) as i64;

        self.blocking(move |storage| {
            storage.with_connection(|conn| {
                let sql = format!(
                    "SELECT id, data FROM {} WHERE id > ?1 AND (?2 IS NULL OR timestamp >= ?2) ORDER BY id ASC LIMIT ?3",
                    storage.table()
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt.query_map(params![after, since, limit], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?;

                let mut entries = Vec::new();
                for row in rows {
                    let (id, data) = row?;
                    entries.push(LogEntry {
                        id: id.to_string(),
                        event: serde_json::from_str(&data)?,
                    });
                }
                Ok(entries)
            })
        })
        .await
    }

    async fn tail(&self) -> Result<String> {
        let max: Option<i64> = self
            .blocking(|storage| {
                storage.with_connection(|conn| {
                    let sql = format!("SELECT MAX(id) FROM {}", storage.table());
                    Ok(conn
                        .query_row(&sql, [], |row| row.get::<_, Option<i64>>(0))
                        .optional()?
                        .flatten())
                })
            })
            .await?;
        Ok(max.map_or_else(|| BEGINNING.to_string(), |id| id.to_string()))
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        let start = Instant::now();
        let result = self
            .blocking(|storage| {
                storage.with_connection(|conn| {
                    conn.query_row("SELECT 1", [], |_| Ok(()))?;
                    Ok(())
                })
            })
            .await;

        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        let details = HashMap::from([
            (
                "db_path".to_string(),
                self.storage.db_path().display().to_string(),
            ),
            ("table".to_string(), self.storage.table().to_string()),
            (
                "ephemeral".to_string(),
                self.storage.is_ephemeral().to_string(),
            ),
        ]);

        Ok(match result {
            Ok(()) => HealthStatus {
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
        self.blocking(|storage| storage.checkpoint()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::GroupRead;
    use crate::types::{Category, EventType, Payload};
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn event(path: &str) -> Event {
        let mut payload = Payload::new();
        payload.insert("path".into(), json!(path));
        let mut event = Event::new(Category::Dav, EventType::Upload, "PUT", payload);
        event.timestamp = Some(Utc::now());
        event
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_ids() {
        let log = SqliteBackend::ephemeral("events").unwrap();
        let a: i64 = log.append(&event("/a")).await.unwrap().parse().unwrap();
        let b: i64 = log.append(&event("/b")).await.unwrap().parse().unwrap();
        assert!(b > a);
        assert_eq!(log.tail().await.unwrap(), b.to_string());
    }

    #[tokio::test]
    async fn test_read_after_cursor() {
        let log = SqliteBackend::ephemeral("events").unwrap();
        let first = log.append(&event("/a")).await.unwrap();
        log.append(&event("/b")).await.unwrap();

        let all = log
            .read(&ReadRequest::after(Some("0".into()), 100))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event.payload["path"], json!("/a"));

        let rest = log
            .read(&ReadRequest::after(Some(first), 100))
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].event.payload["path"], json!("/b"));
    }

    #[tokio::test]
    async fn test_empty_tail_is_beginning() {
        let log = SqliteBackend::ephemeral("events").unwrap();
        assert_eq!(log.tail().await.unwrap(), BEGINNING);
    }

    #[tokio::test]
    async fn test_from_datetime_filter() {
        let log = SqliteBackend::ephemeral("events").unwrap();
        let mut old = event("/old");
        old.timestamp = Some(Utc::now() - Duration::hours(2));
        log.append(&old).await.unwrap();
        log.append(&event("/new")).await.unwrap();

        let request = ReadRequest {
            from_datetime: Some(Utc::now() - Duration::hours(1)),
            ..ReadRequest::after(None, 100)
        };
        let entries = log.read(&request).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event.payload["path"], json!("/new"));
    }

    #[tokio::test]
    async fn test_rejects_foreign_cursor_and_groups() {
        let log = SqliteBackend::ephemeral("events").unwrap();
        let err = log
            .read(&ReadRequest::after(Some("1700000000000-0".into()), 10))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidCursor { .. }));

        let request = ReadRequest {
            group: Some(GroupRead {
                group: "g".into(),
                consumer: "c".into(),
            }),
            ..Default::default()
        };
        assert!(log.read(&request).await.is_err());
        assert!(log.ensure_group("g").await.is_err());
    }

    #[tokio::test]
    async fn test_reopen_keeps_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        {
            let log = SqliteBackend::open(&path, "events").unwrap();
            log.append(&event("/persisted")).await.unwrap();
            log.close().await.unwrap();
        }
        let log = SqliteBackend::open(&path, "events").unwrap();
        let entries = log.read(&ReadRequest::after(None, 10)).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "1");
    }
}
