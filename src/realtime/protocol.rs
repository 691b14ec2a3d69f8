//! Pull endpoint wire types

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::types::LogEntry;

/// Query parameters of a pull request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Cursor to resume after; empty means "from now" (or the group position)
    #[serde(default)]
    pub lastid: Option<String>,
    /// Consumer group (stream engine only)
    #[serde(default)]
    pub group: Option<String>,
    /// Member name within the group
    #[serde(default)]
    pub name: Option<String>,
    /// ISO-8601 lower bound on event timestamps
    #[serde(default)]
    pub from_datetime: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl PullRequest {
    pub fn lastid(&self) -> Option<&str> {
        non_empty(&self.lastid)
    }

    pub fn group(&self) -> Option<&str> {
        non_empty(&self.group)
    }

    pub fn name(&self) -> Option<&str> {
        non_empty(&self.name)
    }

    /// Parsed `from_datetime`; naive values are taken as UTC
    pub fn from_datetime(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = non_empty(&self.from_datetime) else {
            return Ok(None);
        };
        parse_datetime(raw)
            .map(Some)
            .ok_or_else(|| RelayError::InvalidInput(format!("invalid from_datetime: {}", raw)))
    }
}

fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// One message on a pull session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PullMessage {
    /// `{"id": cursor, "data": event}`
    Entry(LogEntry),
    /// Terminal failure; the session closes right after
    Error { error: String, kind: String },
}

impl PullMessage {
    pub fn error(err: &RelayError) -> Self {
        PullMessage::Error {
            error: err.to_string(),
            kind: err.kind().to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, PullMessage::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Category, Event, EventType, Payload};
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_blank_params_are_absent() {
        let request = PullRequest {
            lastid: Some("".into()),
            group: Some("  ".into()),
            name: None,
            from_datetime: Some("".into()),
        };
        assert_eq!(request.lastid(), None);
        assert_eq!(request.group(), None);
        assert_eq!(request.from_datetime().unwrap(), None);
    }

    #[test]
    fn test_from_datetime_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        for raw in [
            "2024-05-01T12:30:00Z",
            "2024-05-01T14:30:00+02:00",
            "2024-05-01T12:30:00",
            "2024-05-01 12:30:00",
        ] {
            let request = PullRequest {
                from_datetime: Some(raw.into()),
                ..Default::default()
            };
            assert_eq!(request.from_datetime().unwrap(), Some(expected), "{}", raw);
        }

        let request = PullRequest {
            from_datetime: Some("yesterday".into()),
            ..Default::default()
        };
        assert!(request.from_datetime().is_err());
    }

    #[test]
    fn test_entry_frame_shape() {
        let event = Event::new(Category::Web, EventType::Remove, "remove", Payload::new());
        let frame = PullMessage::Entry(LogEntry {
            id: "7".into(),
            event,
        });
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"id": "7", "data": {"category": "web", "type": "remove", "method": "remove", "payload": {}}})
        );
    }

    #[test]
    fn test_error_frame_shape() {
        let frame = PullMessage::error(&RelayError::Storage("disk full".into()));
        assert!(frame.is_error());
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["kind"], json!("storage"));
        assert!(value["error"].as_str().unwrap().contains("disk full"));
    }
}
