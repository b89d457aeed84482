//! HTTP message types
//!
//! Field containers for the requests, responses and errors that make up a
//! flow. Wire parsing lives in the transport layer, not here.

mod headers;
mod request;
mod response;

pub use headers::Headers;
pub use request::{Request, RequestBuilder, RequestId};
pub use response::{Response, SetCookie};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How an intercepted message was acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// Deliver normally
    Forward,
    /// Do not deliver; terminate the connection
    Kill,
}

/// A failure that terminated a request before a response arrived
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Request this error terminated
    pub request_id: RequestId,

    /// Human-readable message
    pub msg: String,

    pub timestamp: DateTime<Utc>,
}

impl ErrorInfo {
    pub fn new(request_id: RequestId, msg: &str) -> Self {
        Self {
            request_id,
            msg: msg.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Message bodies are stored as base64 text in snapshots
mod body {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(content: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(content))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
