//! Interception policy and pending decisions
//!
//! The policy decides whether a message pauses. A paused flow's worker holds
//! an `InterceptTicket` and waits on it; whoever accepts or kills the flow
//! resolves the ticket through the manager.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::ProxyError;
use crate::filter::FlowFilter;
use crate::flow::{Flow, FlowId};
use crate::http::Disposition;

/// Which message of a flow is in transit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Request,
    Response,
}

/// Rule for automatic interception
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptRule {
    /// Rule name
    pub name: String,

    /// Whether the rule is enabled
    pub enabled: bool,

    /// Match on URL pattern (regex)
    pub url_pattern: Option<String>,

    /// Match on host
    pub host: Option<String>,

    /// Match on method
    pub method: Option<String>,

    /// Match on content type of the message in transit (substring)
    pub content_type: Option<String>,

    /// Whether to intercept requests
    pub intercept_requests: bool,

    /// Whether to intercept responses
    pub intercept_responses: bool,

    /// Action to take
    pub action: InterceptAction,
}

/// Action to take when a rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterceptAction {
    /// Pause for manual review
    Pause,

    /// Kill the message without review
    Kill,
}

impl Default for InterceptRule {
    fn default() -> Self {
        Self {
            name: "New Rule".to_string(),
            enabled: true,
            url_pattern: None,
            host: None,
            method: None,
            content_type: None,
            intercept_requests: true,
            intercept_responses: false,
            action: InterceptAction::Pause,
        }
    }
}

struct CompiledRule {
    rule: InterceptRule,
    url_regex: Option<Regex>,
}

impl CompiledRule {
    fn matches(&self, flow: &Flow, phase: Phase) -> bool {
        let rule = &self.rule;
        if !rule.enabled {
            return false;
        }
        match phase {
            Phase::Request if !rule.intercept_requests => return false,
            Phase::Response if !rule.intercept_responses => return false,
            _ => {}
        }

        let request = &flow.request;
        if let Some(regex) = &self.url_regex {
            if !regex.is_match(&request.url()) {
                return false;
            }
        }
        if let Some(host) = &rule.host {
            if !request.host.eq_ignore_ascii_case(host) {
                return false;
            }
        }
        if let Some(method) = &rule.method {
            if !request.method.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if let Some(wanted) = &rule.content_type {
            let headers = match phase {
                Phase::Request => Some(&request.headers),
                Phase::Response => flow.response().map(|r| &r.headers),
            };
            let actual = headers.and_then(|h| h.get("content-type")).unwrap_or("");
            if !actual.to_lowercase().contains(&wanted.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

/// A paused worker's handle on its pending decision
#[derive(Debug)]
pub struct InterceptTicket {
    flow_id: FlowId,
    rx: oneshot::Receiver<Disposition>,
}

impl InterceptTicket {
    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    /// Wait for the accept or kill decision
    pub async fn wait(self) -> Result<Disposition, ProxyError> {
        self.rx
            .await
            .map_err(|_| ProxyError::InterceptAbandoned(self.flow_id))
    }

    /// Blocking variant for workers on plain threads
    pub fn wait_blocking(self) -> Result<Disposition, ProxyError> {
        self.rx
            .blocking_recv()
            .map_err(|_| ProxyError::InterceptAbandoned(self.flow_id))
    }
}

/// Intercept manager
pub struct InterceptManager {
    /// Interception rules
    rules: Vec<CompiledRule>,

    /// Global intercept enabled
    enabled: bool,

    /// External predicate; matching flows pause in both phases
    filter: Option<Arc<dyn FlowFilter>>,

    /// Pending intercept decisions, keyed by flow.
    /// The worker awaits the receiver; accept/kill sends through the sender.
    pending_decisions: HashMap<FlowId, oneshot::Sender<Disposition>>,
}

impl InterceptManager {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            enabled: false,
            filter: None,
            pending_decisions: HashMap::new(),
        }
    }

    /// Enable/disable global interception
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Check if interception is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Add a rule, compiling its URL pattern
    pub fn add_rule(&mut self, rule: InterceptRule) -> Result<(), regex::Error> {
        let url_regex = rule.url_pattern.as_deref().map(Regex::new).transpose()?;
        self.rules.push(CompiledRule { rule, url_regex });
        Ok(())
    }

    /// Remove a rule by index
    pub fn remove_rule(&mut self, index: usize) -> Option<InterceptRule> {
        if index < self.rules.len() {
            Some(self.rules.remove(index).rule)
        } else {
            None
        }
    }

    pub fn rules(&self) -> impl Iterator<Item = &InterceptRule> {
        self.rules.iter().map(|r| &r.rule)
    }

    /// Set or clear the external intercept predicate
    pub fn set_filter(&mut self, filter: Option<Arc<dyn FlowFilter>>) {
        self.filter = filter;
    }

    /// Decide what happens to the message in transit
    pub fn evaluate(&self, flow: &Flow, phase: Phase) -> Option<InterceptAction> {
        if !self.enabled {
            return None;
        }
        if self.filter.as_ref().is_some_and(|f| f.matches(flow)) {
            return Some(InterceptAction::Pause);
        }
        self.rules
            .iter()
            .find(|r| r.matches(flow, phase))
            .map(|r| r.rule.action)
    }

    /// Register a pending decision for a paused flow.
    /// A flow paused again replaces its earlier registration.
    pub fn register(&mut self, flow_id: FlowId) -> InterceptTicket {
        let (tx, rx) = oneshot::channel();
        self.pending_decisions.insert(flow_id, tx);
        InterceptTicket { flow_id, rx }
    }

    /// Resolve an intercept by flow - sends the decision to the waiting worker.
    /// Returns true if a pending intercept was found.
    pub fn resolve(&mut self, flow_id: FlowId, decision: Disposition) -> bool {
        if let Some(tx) = self.pending_decisions.remove(&flow_id) {
            // The worker may have given up already
            let _ = tx.send(decision);
            true
        } else {
            false
        }
    }

    /// Check if there's a pending intercept for the given flow
    pub fn has_pending(&self, flow_id: FlowId) -> bool {
        self.pending_decisions.contains_key(&flow_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending_decisions.len()
    }

    /// Abandon all pending intercepts (e.g., on shutdown)
    pub fn cancel_all(&mut self) {
        self.pending_decisions.clear();
    }
}

impl Default for InterceptManager {
    fn default() -> Self {
        Self::new()
    }
}
