//! Behavioral parity across storage engines
//!
//! The memory and relational engines always run. The document and stream
//! engines run only when a server is available:
//!
//!   FSRELAY_TEST_MONGODB=mongodb://localhost:27017/fsrelay_test
//!   FSRELAY_TEST_REDIS=redis://localhost:6379/0
//!
//! Run with: cargo test --test engine_parity

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use fsrelay::storage::{open_log, EventLog, LogDescriptor, ReadRequest, BEGINNING};
use fsrelay::types::{Category, Event, EventType, Payload};

fn event(path: &str) -> Event {
    let mut payload = Payload::new();
    payload.insert("path".into(), json!(path));
    payload.insert("is_dir".into(), json!(false));
    let mut event = Event::new(Category::Dav, EventType::Upload, "PUT", payload);
    event.timestamp = Some(Utc::now());
    event
}

fn unique_name() -> String {
    format!("parity_{}", uuid::Uuid::new_v4().simple())
}

/// The shared contract every engine must honor
async fn check_contract(log: Arc<dyn EventLog>) {
    let engine = log.engine();

    // empty log: the tail is the beginning, and nothing is readable
    let tail = log.tail().await.unwrap();
    assert!(
        tail == BEGINNING || tail == "0-0",
        "{}: empty tail was {}",
        engine,
        tail
    );
    assert!(log
        .read(&ReadRequest::after(Some(tail.clone()), 10))
        .await
        .unwrap()
        .is_empty());

    let mut ids = Vec::new();
    for p in ["/a", "/b", "/c", "/d"] {
        ids.push(log.append(&event(p)).await.unwrap());
    }

    // reading from the beginning returns every entry in append order
    let all = log.read(&ReadRequest::after(None, 100)).await.unwrap();
    assert_eq!(all.len(), 4, "{}", engine);
    let read_ids: Vec<_> = all.iter().map(|e| e.id.clone()).collect();
    assert_eq!(read_ids, ids, "{}", engine);
    assert_eq!(all[2].event.payload["path"], json!("/c"), "{}", engine);
    assert_eq!(all[0].event.method, "PUT");

    // the explicit beginning cursor is the same as no cursor
    let from_zero = log
        .read(&ReadRequest::after(Some(BEGINNING.to_string()), 100))
        .await
        .unwrap();
    assert_eq!(from_zero.len(), 4, "{}", engine);

    // a cursor is exclusive
    let after_second = log
        .read(&ReadRequest::after(Some(ids[1].clone()), 100))
        .await
        .unwrap();
    let paths: Vec<_> = after_second
        .iter()
        .map(|e| e.event.payload["path"].clone())
        .collect();
    assert_eq!(paths, vec![json!("/c"), json!("/d")], "{}", engine);

    // limit is honored
    let limited = log.read(&ReadRequest::after(None, 2)).await.unwrap();
    assert_eq!(limited.len(), 2, "{}", engine);

    // tail is the newest id; nothing is after it
    let tail = log.tail().await.unwrap();
    assert_eq!(&tail, ids.last().unwrap(), "{}", engine);
    assert!(log
        .read(&ReadRequest::after(Some(tail), 10))
        .await
        .unwrap()
        .is_empty());

    // a time filter in the future excludes everything
    let future = ReadRequest {
        from_datetime: Some(Utc::now() + ChronoDuration::hours(1)),
        limit: 10,
        ..Default::default()
    };
    assert!(log.read(&future).await.unwrap().is_empty(), "{}", engine);

    // a time filter in the past excludes nothing
    let past = ReadRequest {
        from_datetime: Some(Utc::now() - ChronoDuration::hours(1)),
        limit: 10,
        ..Default::default()
    };
    assert_eq!(log.read(&past).await.unwrap().len(), 4, "{}", engine);

    assert!(log.health_check().await.unwrap().healthy, "{}", engine);
    log.close().await.unwrap();
}

#[tokio::test]
async fn test_memory_engine_contract() {
    let log = open_log(&LogDescriptor::parse("memory").unwrap(), None)
        .await
        .unwrap();
    check_contract(log).await;
}

#[tokio::test]
async fn test_relational_engine_contract() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("parity.db");
    let descriptor = LogDescriptor::parse(&format!("sqlite://{}", path.display())).unwrap();
    let log = open_log(&descriptor, Some("events")).await.unwrap();
    check_contract(log).await;
}

#[tokio::test]
async fn test_relational_engine_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reopen.db");
    let descriptor = LogDescriptor::parse(path.to_str().unwrap()).unwrap();

    let first_id = {
        let log = open_log(&descriptor, None).await.unwrap();
        let id = log.append(&event("/kept")).await.unwrap();
        log.close().await.unwrap();
        id
    };

    let log = open_log(&descriptor, None).await.unwrap();
    let second_id = log.append(&event("/later")).await.unwrap();
    let entries = log.read(&ReadRequest::after(None, 10)).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].id, first_id);
    assert_eq!(entries[1].id, second_id);
}

#[tokio::test]
async fn test_document_engine_contract() {
    let Ok(uri) = std::env::var("FSRELAY_TEST_MONGODB") else {
        eprintln!("FSRELAY_TEST_MONGODB not set, skipping");
        return;
    };
    let descriptor = LogDescriptor::parse(&uri).unwrap();
    let log = open_log(&descriptor, Some(&unique_name())).await.unwrap();
    check_contract(log).await;
}

#[tokio::test]
async fn test_stream_engine_contract() {
    let Ok(uri) = std::env::var("FSRELAY_TEST_REDIS") else {
        eprintln!("FSRELAY_TEST_REDIS not set, skipping");
        return;
    };
    let descriptor = LogDescriptor::parse(&uri).unwrap();
    let log = open_log(&descriptor, Some(&unique_name())).await.unwrap();
    check_contract(log).await;
}

#[tokio::test]
async fn test_stream_engine_group_delivery() {
    use fsrelay::storage::GroupRead;

    let Ok(uri) = std::env::var("FSRELAY_TEST_REDIS") else {
        eprintln!("FSRELAY_TEST_REDIS not set, skipping");
        return;
    };
    let descriptor = LogDescriptor::parse(&uri).unwrap();
    let log = open_log(&descriptor, Some(&unique_name())).await.unwrap();
    assert!(log.supports_groups());

    log.ensure_group("workers").await.unwrap();
    // creating it twice is fine
    log.ensure_group("workers").await.unwrap();

    for p in ["/a", "/b", "/c"] {
        log.append(&event(p)).await.unwrap();
    }

    let read = |consumer: &str| ReadRequest {
        group: Some(GroupRead {
            group: "workers".into(),
            consumer: consumer.into(),
        }),
        limit: 2,
        ..Default::default()
    };

    // each entry goes to exactly one member
    let first = log.read(&read("w1")).await.unwrap();
    let second = log.read(&read("w2")).await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].event.payload["path"], json!("/c"));

    // unacked entries are pending for their member and replay from "0"
    let pending = log
        .read(&ReadRequest {
            after: Some(BEGINNING.to_string()),
            ..read("w1")
        })
        .await
        .unwrap();
    assert_eq!(pending.len(), 2);

    let ids: Vec<_> = first.iter().map(|e| e.id.clone()).collect();
    log.ack("workers", &ids).await.unwrap();
    let pending = log
        .read(&ReadRequest {
            after: Some(BEGINNING.to_string()),
            ..read("w1")
        })
        .await
        .unwrap();
    assert!(pending.is_empty());

    log.close().await.unwrap();
}

#[tokio::test]
async fn test_groups_rejected_without_stream_engine() {
    use fsrelay::storage::GroupRead;

    let log = open_log(&LogDescriptor::parse("memory").unwrap(), None)
        .await
        .unwrap();
    assert!(!log.supports_groups());
    assert!(log.ensure_group("workers").await.is_err());

    let request = ReadRequest {
        group: Some(GroupRead {
            group: "workers".into(),
            consumer: "c".into(),
        }),
        limit: 10,
        ..Default::default()
    };
    assert!(log.read(&request).await.is_err());
}
