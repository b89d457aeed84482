//! Recorded-traffic playback
//!
//! Server playback answers live requests from a recorded corpus, matching on
//! a content fingerprint. Client playback re-issues recorded requests.

use std::collections::{HashMap, VecDeque};

use sha2::{Digest, Sha256};
use url::Url;

use crate::flow::Flow;
use crate::http::Request;

/// Header-insensitive request key: method, normalized path and body
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the playback fingerprint of a request. Headers never participate.
pub fn fingerprint(request: &Request) -> Fingerprint {
    let method = request.method.to_uppercase();
    let path = normalize_path(&request.path);

    let mut hasher = Sha256::new();
    // Length-prefixed so field boundaries are unambiguous
    for part in [method.as_bytes(), path.as_bytes()] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hasher.update(&request.content);
    Fingerprint(format!("{:x}", hasher.finalize()))
}

/// Resolve dot segments and canonicalize percent-encoding. Paths that cannot
/// be parsed, or that would be read as an authority, are used verbatim.
fn normalize_path(path: &str) -> String {
    if path.starts_with("//") {
        return path.to_string();
    }
    match Url::parse("http://playback.invalid/").and_then(|base| base.join(path)) {
        Ok(url) => match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        },
        Err(_) => path.to_string(),
    }
}

/// Fingerprint-indexed FIFO queues of recorded flows
#[derive(Debug, Default)]
pub struct ServerPlaybackState {
    fmap: HashMap<Fingerprint, VecDeque<Flow>>,
    count: usize,
}

impl ServerPlaybackState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a corpus from recorded flows
    pub fn from_flows(flows: impl IntoIterator<Item = Flow>) -> Self {
        let mut state = Self::new();
        state.load(flows);
        state
    }

    /// Queue flows under their fingerprints, preserving order
    pub fn load(&mut self, flows: impl IntoIterator<Item = Flow>) {
        for flow in flows {
            let key = fingerprint(&flow.request);
            self.fmap.entry(key).or_default().push_back(flow);
            self.count += 1;
        }
        tracing::debug!(
            flows = self.count,
            fingerprints = self.fmap.len(),
            "Server playback corpus loaded"
        );
    }

    /// Pop the oldest recorded flow matching `request`. Single use.
    pub fn next_flow(&mut self, request: &Request) -> Option<Flow> {
        let key = fingerprint(request);
        let queue = self.fmap.get_mut(&key)?;
        let flow = queue.pop_front()?;
        if queue.is_empty() {
            self.fmap.remove(&key);
        }
        self.count -= 1;
        Some(flow)
    }

    /// Flows remaining across all fingerprints
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of distinct fingerprints with flows remaining
    pub fn fingerprints(&self) -> usize {
        self.fmap.len()
    }
}

/// Recorded flows whose requests are re-issued, in order
#[derive(Debug, Default)]
pub struct ClientPlaybackState {
    flows: VecDeque<Flow>,
}

impl ClientPlaybackState {
    pub fn new(flows: impl IntoIterator<Item = Flow>) -> Self {
        Self {
            flows: flows.into_iter().collect(),
        }
    }

    /// Fresh copy of the next recorded request
    pub fn next_request(&mut self) -> Option<Request> {
        self.flows.pop_front().map(|f| f.request.replay_copy())
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
