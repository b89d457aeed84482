//! HTTP request types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{body, Disposition, Headers};
use crate::proxy::ClientConnection;

/// Stable identity of a request, assigned when the transport first sees it.
///
/// Survives any mutation of the request itself, so it is the join key between
/// a request and the response or error that later terminates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// HTTP request as seen by the proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Request identity
    pub id: RequestId,

    /// Client connection the request arrived on
    pub client_conn: Option<ClientConnection>,

    /// URL scheme ("http" or "https")
    pub scheme: String,

    /// Target host
    pub host: String,

    /// Target port
    pub port: u16,

    /// HTTP method
    pub method: String,

    /// Path including query string
    pub path: String,

    /// HTTP version
    pub http_version: String,

    /// Request headers
    pub headers: Headers,

    /// Request body
    #[serde(with = "body")]
    pub content: Vec<u8>,

    pub timestamp_start: DateTime<Utc>,

    pub timestamp_end: Option<DateTime<Utc>>,

    /// Interception acknowledgement
    pub acked: Option<Disposition>,

    /// Whether this request is being re-issued from a recording
    pub is_replay: bool,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            id: RequestId::new(),
            client_conn: None,
            scheme: "http".to_string(),
            host: String::new(),
            port: 80,
            method: "GET".to_string(),
            path: "/".to_string(),
            http_version: "HTTP/1.1".to_string(),
            headers: Headers::new(),
            content: Vec::new(),
            timestamp_start: Utc::now(),
            timestamp_end: None,
            acked: None,
            is_replay: false,
        }
    }
}

impl Request {
    /// Create a new request
    pub fn new(method: &str, host: &str, path: &str) -> Self {
        Self {
            method: method.to_uppercase(),
            host: host.to_string(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    /// Create a builder for constructing requests
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    /// Full URL, omitting the port when it is the scheme default
    pub fn url(&self) -> String {
        let default_port = match self.scheme.as_str() {
            "https" => 443,
            _ => 80,
        };
        if self.port == default_port {
            format!("{}://{}{}", self.scheme, self.host, self.path)
        } else {
            format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
        }
    }

    /// Acknowledge the request with a delivery decision
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

    /// Copy of this request under a new identity, ready to be re-issued
    pub fn replay_copy(&self) -> Self {
        Self {
            id: RequestId::new(),
            client_conn: None,
            timestamp_start: Utc::now(),
            timestamp_end: None,
            acked: Some(Disposition::Forward),
            is_replay: true,
            ..self.clone()
        }
    }
}

/// Builder for constructing requests
#[derive(Debug, Default)]
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    /// Set the request method
    pub fn method(mut self, method: &str) -> Self {
        self.request.method = method.to_uppercase();
        self
    }

    /// Set scheme, host and port
    pub fn target(mut self, scheme: &str, host: &str, port: u16) -> Self {
        self.request.scheme = scheme.to_string();
        self.request.host = host.to_string();
        self.request.port = port;
        self
    }

    /// Set the request path
    pub fn path(mut self, path: &str) -> Self {
        self.request.path = path.to_string();
        self
    }

    /// Add a header
    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.request.headers.add(key, value);
        self
    }

    /// Set the request body
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.request.content = body.into();
        self
    }

    /// Attach the client connection
    pub fn client(mut self, conn: ClientConnection) -> Self {
        self.request.client_conn = Some(conn);
        self
    }

    /// Build the request
    pub fn build(self) -> Request {
        self.request
    }
}
