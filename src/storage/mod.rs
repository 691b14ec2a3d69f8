//! Backend log for fsrelay
//!
//! One append-only event log behind the [`EventLog`] trait, with relational
//! (SQLite), document (MongoDB), stream (Redis Streams) and in-memory
//! engines. [`open_log`] turns a [`LogDescriptor`] into a shared handle.

mod backend;
mod connection;
mod descriptor;
#[cfg(feature = "document")]
mod document_backend;
mod memory_backend;
mod migrations;
mod sqlite_backend;
#[cfg(feature = "stream")]
mod stream_backend;

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{RelayError, Result};

pub use backend::{is_beginning, Engine, EventLog, GroupRead, HealthStatus, ReadRequest, BEGINNING};
pub use connection::Storage;
pub use descriptor::LogDescriptor;
#[cfg(feature = "document")]
pub use document_backend::DocumentBackend;
pub use memory_backend::MemoryBackend;
pub use sqlite_backend::SqliteBackend;
#[cfg(feature = "stream")]
pub use stream_backend::StreamBackend;

/// Table / collection name when none is configured
pub const DEFAULT_LOG_NAME: &str = "events";

/// Stream key when none is configured
pub const DEFAULT_STREAM_KEY: &str = "fsrelay:fs";

/// Open the log named by `descriptor`.
///
/// `log_name` is the stream key for the stream engine and the table or
/// collection name for the others. Fails for the console engine, which has
/// no log.
pub async fn open_log(
    descriptor: &LogDescriptor,
    log_name: Option<&str>,
) -> Result<Arc<dyn EventLog>> {
    let log: Arc<dyn EventLog> = match descriptor.engine {
        Engine::Console => {
            return Err(RelayError::Config(
                "the console engine has no backend log".to_string(),
            ))
        }
        Engine::Memory => Arc::new(MemoryBackend::new()),
        Engine::Relational => {
            let table = log_name.unwrap_or(DEFAULT_LOG_NAME);
            let backend = match &descriptor.path {
                Some(path) => SqliteBackend::open(path, table)?,
                None => SqliteBackend::ephemeral(table)?,
            };
            Arc::new(backend)
        }
        Engine::Document => open_document(descriptor, log_name.unwrap_or(DEFAULT_LOG_NAME)).await?,
        Engine::Stream => open_stream(descriptor, log_name.unwrap_or(DEFAULT_STREAM_KEY)).await?,
    };

    tracing::info!(engine = %descriptor.engine, descriptor = %descriptor, "opened backend log");
    Ok(log)
}

#[cfg(feature = "document")]
async fn open_document(descriptor: &LogDescriptor, name: &str) -> Result<Arc<dyn EventLog>> {
    Ok(Arc::new(DocumentBackend::connect(descriptor, name).await?))
}

#[cfg(not(feature = "document"))]
async fn open_document(_descriptor: &LogDescriptor, _name: &str) -> Result<Arc<dyn EventLog>> {
    Err(RelayError::Config(
        "document engine support was not compiled in (enable the `document` feature)".to_string(),
    ))
}

#[cfg(feature = "stream")]
async fn open_stream(descriptor: &LogDescriptor, key: &str) -> Result<Arc<dyn EventLog>> {
    Ok(Arc::new(StreamBackend::connect(descriptor, key).await?))
}

#[cfg(not(feature = "stream"))]
async fn open_stream(_descriptor: &LogDescriptor, _key: &str) -> Result<Arc<dyn EventLog>> {
    Err(RelayError::Config(
        "stream engine support was not compiled in (enable the `stream` feature)".to_string(),
    ))
}

/// Sortable text form of an event timestamp; missing timestamps use now
pub(crate) fn timestamp_key(timestamp: Option<DateTime<Utc>>) -> String {
    timestamp
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}
