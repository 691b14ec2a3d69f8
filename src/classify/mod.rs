//! Event classification
//!
//! Turns a completed proxied operation into zero or more canonical [`Event`]s.
//! Classification is a pure function of the [`OperationDescriptor`]: failed
//! operations and unknown routes produce nothing, never an error.

mod tables;

use std::collections::BTreeMap;

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Category, Event, Payload};

pub use tables::{dav_type, web_type};

/// Protocol surface an operation arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Surface {
    Web,
    Dav,
}

/// Completed proxied operation, as reported by the forwarding layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    /// Surface; when absent it is inferred from the path
    #[serde(default)]
    pub surface: Option<Surface>,
    /// HTTP method (or WebDAV verb)
    pub method: String,
    /// Request path, possibly percent-encoded
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// Request headers; keys are matched case-insensitively
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Response status code
    pub status: u16,
    /// Destination for COPY/MOVE; falls back to the `Destination` header
    #[serde(default)]
    pub destination: Option<String>,
    /// Request JSON body, if any
    #[serde(default)]
    pub body: Option<Value>,
    /// Response JSON body, if any
    #[serde(default)]
    pub response: Option<Value>,
    /// Directory flag from a prior stat, overriding the trailing-slash rule
    #[serde(default)]
    pub is_dir: Option<bool>,
    /// Parsed PROPFIND entries, attached to `find` events as `result`
    #[serde(default)]
    pub entries: Option<Value>,
}

impl OperationDescriptor {
    /// Look up a request header case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn succeeded(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Route-table classifier for the web and dav surfaces
#[derive(Debug, Clone)]
pub struct Classifier {
    dav_prefix: String,
    web_prefix: String,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            dav_prefix: "/dav".to_string(),
            web_prefix: "/api/fs".to_string(),
        }
    }
}

impl Classifier {
    /// Create a classifier with custom mount prefixes
    pub fn new(dav_prefix: impl Into<String>, web_prefix: impl Into<String>) -> Self {
        Self {
            dav_prefix: dav_prefix.into(),
            web_prefix: web_prefix.into(),
        }
    }

    /// Infer the surface from a decoded request path
    pub fn detect_surface(&self, path: &str) -> Option<Surface> {
        if has_prefix(path, &self.dav_prefix) {
            Some(Surface::Dav)
        } else if has_prefix(path, &self.web_prefix) {
            Some(Surface::Web)
        } else {
            None
        }
    }

    /// Classify a completed operation
    pub fn classify(&self, op: &OperationDescriptor) -> Vec<Event> {
        if !op.succeeded() {
            return Vec::new();
        }
        let path = decode(&op.path);
        let surface = match op.surface.or_else(|| self.detect_surface(&path)) {
            Some(surface) => surface,
            None => return Vec::new(),
        };
        let event = match surface {
            Surface::Web => self.classify_web(op, &path),
            Surface::Dav => self.classify_dav(op, &path),
        };
        event.into_iter().collect()
    }

    fn classify_web(&self, op: &OperationDescriptor, path: &str) -> Option<Event> {
        if !has_prefix(path, &self.web_prefix) {
            return None;
        }
        // The upstream wraps every reply in {code, message, data}
        if let Some(code) = op.response.as_ref().and_then(|r| r.get("code")) {
            match code.as_i64() {
                Some(code) if (200..300).contains(&code) => {}
                _ => return None,
            }
        }

        let method = path.trim_end_matches('/').rsplit('/').next()?.to_string();
        let event_type = web_type(&method)?;

        let payload = match method.as_str() {
            "form" | "put" => {
                let file_path = op.header("file-path")?;
                let mut payload = Payload::new();
                payload.insert("path".into(), Value::String(decode(file_path)));
                payload
            }
            _ => match &op.body {
                Some(Value::Object(map)) => map.clone(),
                _ => op
                    .query
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            },
        };

        let mut event = Event::new(Category::Web, event_type, method, payload);
        if let Some(data) = op.response.as_ref().and_then(|r| r.get("data")) {
            event = event.with_result(data.clone());
        }
        Some(event)
    }

    fn classify_dav(&self, op: &OperationDescriptor, path: &str) -> Option<Event> {
        let method = op.method.to_ascii_uppercase();
        let event_type = dav_type(&method)?;
        let relative = self.strip_dav(path)?;

        let is_dir = op.is_dir.unwrap_or_else(|| relative.ends_with('/'));
        let mut payload = Payload::new();
        payload.insert("path".into(), Value::String(normalize(relative)));
        payload.insert("is_dir".into(), Value::Bool(is_dir));

        if matches!(method.as_str(), "COPY" | "MOVE") {
            let destination = op
                .destination
                .as_deref()
                .or_else(|| op.header("destination"))?;
            let to_path = self.strip_dav(&destination_path(destination))?.to_string();
            payload.insert("to_path".into(), Value::String(normalize(&to_path)));
        }

        let mut event = Event::new(Category::Dav, event_type, method.clone(), payload);
        if method == "PROPFIND" {
            if let Some(entries) = &op.entries {
                event = event.with_result(entries.clone());
            }
        }
        Some(event)
    }

    fn strip_dav<'a>(&self, path: &'a str) -> Option<&'a str> {
        if !has_prefix(path, &self.dav_prefix) {
            return None;
        }
        let rest = &path[self.dav_prefix.len()..];
        Some(if rest.is_empty() { "/" } else { rest })
    }
}

/// Classify with the default `/dav` and `/api/fs` mounts
pub fn classify(op: &OperationDescriptor) -> Vec<Event> {
    Classifier::default().classify(op)
}

/// Prefix match on a path-segment boundary
fn has_prefix(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// Drop the trailing slash, keeping the root as "/"
fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Destination headers are absolute URLs; keep only the decoded path
fn destination_path(destination: &str) -> String {
    match url::Url::parse(destination) {
        Ok(url) => decode(url.path()),
        Err(_) => decode(destination),
    }
}
