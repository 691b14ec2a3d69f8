//! Decoding of upstream job names into task events
//!
//! The upstream only exposes what a job did through its human-readable name,
//! e.g. `copy [/115](/media/a) to [/local](/backup)`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::types::{Category, Event, EventType, Payload, TaskKind};
use crate::upstream::UpstreamTask;

static COPY_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^copy \[(.*?)\]\(/(.*?)\) to \[(.*?)\]\(/(.*)\)$").expect("valid regex")
});

static UPLOAD_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^upload (.*?) to \[(.*?)\]\(/(.*)\)$").expect("valid regex")
});

static TRANSFER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^transfer (.*?) to \[(.*)\]$").expect("valid regex"));

/// Status text the upstream reports while it is still looking up a copy source
const SOURCE_LOOKUP_STATUS: &str = "getting src object";

/// Build the event for a finished job; `None` if the name does not decode
pub fn task_event(kind: TaskKind, task: &UpstreamTask) -> Option<Event> {
    match kind {
        TaskKind::Copy => copy_event(task),
        TaskKind::Upload => upload_event(task),
        TaskKind::Transfer => transfer_event(task),
    }
}

fn copy_event(task: &UpstreamTask) -> Option<Event> {
    let caps = COPY_NAME.captures(&task.name)?;
    let (src_storage, src_path, dst_storage, dst_dir) = (&caps[1], &caps[2], &caps[3], &caps[4]);
    let (src_dir, name) = split_path(src_path);

    let mut payload = Payload::new();
    insert(&mut payload, "src_path", join(&[src_storage, src_dir, name]));
    insert(&mut payload, "dst_path", join(&[dst_storage, dst_dir, name]));
    insert(&mut payload, "src_storage", src_storage.to_string());
    insert(&mut payload, "dst_storage", dst_storage.to_string());
    insert(&mut payload, "src_dir", join(&[src_storage, src_dir]));
    insert(&mut payload, "dst_dir", join(&[dst_storage, dst_dir]));
    insert(&mut payload, "name", name.to_string());
    payload.insert(
        "is_dir".into(),
        Value::Bool(task.status != SOURCE_LOOKUP_STATUS),
    );

    Some(Event::new(
        Category::Task,
        EventType::Copy,
        TaskKind::Copy.as_str(),
        payload,
    ))
}

fn upload_event(task: &UpstreamTask) -> Option<Event> {
    let caps = UPLOAD_NAME.captures(&task.name)?;
    let (name, dst_storage, dst_dir) = (&caps[1], &caps[2], &caps[3]);

    let mut payload = Payload::new();
    insert(&mut payload, "path", join(&[dst_storage, dst_dir, name]));
    insert(&mut payload, "dst_storage", dst_storage.to_string());
    insert(&mut payload, "dst_dir", join(&[dst_storage, dst_dir]));
    insert(&mut payload, "name", name.to_string());
    payload.insert("is_dir".into(), Value::Bool(false));

    Some(Event::new(
        Category::Task,
        EventType::Upload,
        TaskKind::Upload.as_str(),
        payload,
    ))
}

fn transfer_event(task: &UpstreamTask) -> Option<Event> {
    let caps = TRANSFER_NAME.captures(&task.name)?;
    let (local_path, dst_dir) = (&caps[1], &caps[2]);
    // local paths may come from a Windows host
    let name = local_path.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(local_path);

    let mut payload = Payload::new();
    insert(&mut payload, "path", join(&[dst_dir, name]));
    insert(&mut payload, "dst_dir", dst_dir.to_string());
    insert(&mut payload, "name", name.to_string());
    payload.insert("is_dir".into(), Value::Bool(false));

    Some(Event::new(
        Category::Task,
        EventType::Upload,
        TaskKind::Transfer.as_str(),
        payload,
    ))
}

fn insert(payload: &mut Payload, key: &str, value: String) {
    payload.insert(key.to_string(), Value::String(value));
}

/// Split into (dir, name) the way POSIX `dirname`/`basename` pair up
fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => {
            let dir = path[..idx].trim_end_matches('/');
            let dir = if dir.is_empty() && idx > 0 { "/" } else { dir };
            (dir, &path[idx + 1..])
        }
        None => ("", path),
    }
}

/// POSIX path join: an absolute component restarts the path, empty ones are skipped
fn join(parts: &[&str]) -> String {
    let mut out = String::new();
    for part in parts {
        if part.starts_with('/') {
            out = part.to_string();
        } else if out.is_empty() || out.ends_with('/') {
            out.push_str(part);
        } else if !part.is_empty() {
            out.push('/');
            out.push_str(part);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn task(name: &str, status: &str) -> UpstreamTask {
        UpstreamTask {
            id: "T1".into(),
            name: name.into(),
            state: 2,
            status: status.into(),
            progress: 100.0,
            error: String::new(),
        }
    }

    #[test]
    fn test_copy_event() {
        let event = task_event(
            TaskKind::Copy,
            &task("copy [/115](/media/movie) to [/local](/backup)", "done"),
        )
        .unwrap();
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "category": "task",
                "type": "copy",
                "method": "copy",
                "payload": {
                    "src_path": "/115/media/movie",
                    "dst_path": "/local/backup/movie",
                    "src_storage": "/115",
                    "dst_storage": "/local",
                    "src_dir": "/115/media",
                    "dst_dir": "/local/backup",
                    "name": "movie",
                    "is_dir": true
                }
            })
        );
    }

    #[test]
    fn test_copy_of_single_file() {
        let event = task_event(
            TaskKind::Copy,
            &task("copy [/115](/a.txt) to [/local](/)", SOURCE_LOOKUP_STATUS),
        )
        .unwrap();
        assert_eq!(event.payload["is_dir"], json!(false));
        assert_eq!(event.payload["src_dir"], json!("/115"));
        assert_eq!(event.payload["dst_path"], json!("/local/a.txt"));
    }

    #[test]
    fn test_upload_event() {
        let event = task_event(
            TaskKind::Upload,
            &task("upload clip.mp4 to [/115](/videos)", ""),
        )
        .unwrap();
        assert_eq!(event.event_type, EventType::Upload);
        assert_eq!(event.method, "upload");
        assert_eq!(event.payload["path"], json!("/115/videos/clip.mp4"));
        assert_eq!(event.payload["dst_dir"], json!("/115/videos"));
        assert_eq!(event.payload["is_dir"], json!(false));
    }

    #[test]
    fn test_transfer_event() {
        let event = task_event(
            TaskKind::Transfer,
            &task("transfer /tmp/aria2/ubuntu.iso to [/115/iso]", ""),
        )
        .unwrap();
        assert_eq!(event.event_type, EventType::Upload);
        assert_eq!(event.method, "transfer");
        assert_eq!(event.payload["path"], json!("/115/iso/ubuntu.iso"));
        assert_eq!(event.payload["name"], json!("ubuntu.iso"));
    }

    #[test]
    fn test_undecodable_name() {
        assert!(task_event(TaskKind::Copy, &task("something else", "")).is_none());
    }

    #[test]
    fn test_join() {
        assert_eq!(join(&["115", "", "a"]), "115/a");
        assert_eq!(join(&["/115", "/abs", "a"]), "/abs/a");
        assert_eq!(join(&["/local", ""]), "/local");
    }
}
