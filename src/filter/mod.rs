//! Flow filter predicates
//!
//! The textual filter language is parsed elsewhere; this module only defines
//! the predicate interface consumed by `State` and `Flow`, plus a handful of
//! structured filters for programmatic and CLI use.

use regex::Regex;

use crate::flow::Flow;

/// A predicate over flows
pub trait FlowFilter: Send + Sync {
    fn matches(&self, flow: &Flow) -> bool;
}

impl<F> FlowFilter for F
where
    F: Fn(&Flow) -> bool + Send + Sync,
{
    fn matches(&self, flow: &Flow) -> bool {
        self(flow)
    }
}

/// Flows that have a response (`~s`)
#[derive(Debug, Clone, Copy, Default)]
pub struct HasResponse;

impl FlowFilter for HasResponse {
    fn matches(&self, flow: &Flow) -> bool {
        flow.response().is_some()
    }
}

/// Flows still waiting on a response (`~q`)
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOnly;

impl FlowFilter for RequestOnly {
    fn matches(&self, flow: &Flow) -> bool {
        flow.response().is_none()
    }
}

/// Flows terminated by an error (`~e`)
#[derive(Debug, Clone, Copy, Default)]
pub struct HasError;

impl FlowFilter for HasError {
    fn matches(&self, flow: &Flow) -> bool {
        flow.error().is_some()
    }
}

/// Request or response body contains a byte sequence (`~b`)
#[derive(Debug, Clone)]
pub struct BodyContains {
    needle: Vec<u8>,
}

impl BodyContains {
    pub fn new(needle: impl Into<Vec<u8>>) -> Self {
        Self {
            needle: needle.into(),
        }
    }

    fn found_in(&self, haystack: &[u8]) -> bool {
        self.needle.is_empty()
            || haystack
                .windows(self.needle.len())
                .any(|w| w == self.needle.as_slice())
    }
}

impl FlowFilter for BodyContains {
    fn matches(&self, flow: &Flow) -> bool {
        self.found_in(&flow.request.content)
            || flow.response().is_some_and(|r| self.found_in(&r.content))
    }
}

/// Request URL matches a regular expression (`~u`)
#[derive(Debug, Clone)]
pub struct UrlMatches {
    regex: Regex,
}

impl UrlMatches {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
        })
    }
}

impl FlowFilter for UrlMatches {
    fn matches(&self, flow: &Flow) -> bool {
        self.regex.is_match(&flow.request.url())
    }
}

/// Request method, case-insensitive (`~m`)
#[derive(Debug, Clone)]
pub struct MethodIs(pub String);

impl FlowFilter for MethodIs {
    fn matches(&self, flow: &Flow) -> bool {
        flow.request.method.eq_ignore_ascii_case(&self.0)
    }
}

/// Request host, optionally including subdomains
#[derive(Debug, Clone)]
pub struct HostIs {
    pub host: String,
    pub include_subdomains: bool,
}

impl FlowFilter for HostIs {
    fn matches(&self, flow: &Flow) -> bool {
        let host = flow.request.host.to_lowercase();
        let target = self.host.to_lowercase();
        host == target || (self.include_subdomains && host.ends_with(&format!(".{}", target)))
    }
}

/// Every inner filter matches; empty matches everything
#[derive(Default)]
pub struct All(pub Vec<Box<dyn FlowFilter>>);

impl FlowFilter for All {
    fn matches(&self, flow: &Flow) -> bool {
        self.0.iter().all(|f| f.matches(flow))
    }
}

/// At least one inner filter matches; empty matches nothing
#[derive(Default)]
pub struct Any(pub Vec<Box<dyn FlowFilter>>);

impl FlowFilter for Any {
    fn matches(&self, flow: &Flow) -> bool {
        self.0.iter().any(|f| f.matches(flow))
    }
}

/// Inverts a filter
pub struct Not(pub Box<dyn FlowFilter>);

impl FlowFilter for Not {
    fn matches(&self, flow: &Flow) -> bool {
        !self.0.matches(flow)
    }
}
