//! HTTP response types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{body, Disposition, Headers, RequestId};

/// HTTP response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Request this response answers
    pub request_id: RequestId,

    /// HTTP version
    pub http_version: String,

    /// HTTP status code
    pub status_code: u16,

    /// Reason phrase (e.g., "OK", "Not Found")
    pub reason: String,

    /// Response headers
    pub headers: Headers,

    /// Response body
    #[serde(with = "body")]
    pub content: Vec<u8>,

    pub timestamp_start: DateTime<Utc>,

    pub timestamp_end: Option<DateTime<Utc>>,

    /// Interception acknowledgement
    pub acked: Option<Disposition>,

    /// Whether this response was served from a recording
    pub is_replay: bool,
}

/// A cookie set by a `Set-Cookie` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    /// Attributes in header order; flags like `HttpOnly` have no value
    pub attributes: Vec<(String, Option<String>)>,
}

impl SetCookie {
    /// Look up an attribute by case-insensitive name
    pub fn attribute(&self, name: &str) -> Option<Option<&str>> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }
}

impl Response {
    /// Create a new response for a request
    pub fn new(request_id: RequestId, status_code: u16, reason: &str) -> Self {
        Self {
            request_id,
            http_version: "HTTP/1.1".to_string(),
            status_code,
            reason: reason.to_string(),
            headers: Headers::new(),
            content: Vec::new(),
            timestamp_start: Utc::now(),
            timestamp_end: None,
            acked: None,
            is_replay: false,
        }
    }

    /// Set the body, returning self
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.content = body.into();
        self
    }

    /// Acknowledge the response with a delivery decision
    pub fn ack(&mut self, disposition: Disposition) {
        self.acked = Some(disposition);
    }

    pub fn is_acked(&self) -> bool {
        self.acked.is_some()
    }

    /// Body as lossy UTF-8
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.content).to_string()
    }

    /// Check if response is successful (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Parse every `Set-Cookie` header. Unparseable headers are skipped.
    pub fn cookies(&self) -> Vec<SetCookie> {
        self.headers
            .get_all("set-cookie")
            .into_iter()
            .filter_map(parse_set_cookie)
            .collect()
    }

    /// Copy of a recorded response re-bound to a live request
    pub fn replay_for(&self, request_id: RequestId) -> Self {
        Self {
            request_id,
            timestamp_start: Utc::now(),
            timestamp_end: None,
            acked: None,
            is_replay: true,
            ..self.clone()
        }
    }
}

fn parse_set_cookie(header: &str) -> Option<SetCookie> {
    let mut parts = header.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let attributes = parts
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), Some(v.trim().to_string())),
            None => (p.to_string(), None),
        })
        .collect();

    Some(SetCookie {
        name: name.to_string(),
        value: value.trim().trim_matches('"').to_string(),
        attributes,
    })
}
