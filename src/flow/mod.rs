//! Flow records
//!
//! A flow is one client request together with its eventual response or
//! error, plus the interception and modification bookkeeping around it.

mod state;

pub use state::State;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ProxyError, StateError};
use crate::filter::FlowFilter;
use crate::http::{Disposition, ErrorInfo, Request, RequestId, Response};
use crate::proxy::ClientConnection;

/// Snapshot format version written into every `FlowState`
pub const STATE_VERSION: u32 = 1;

/// Identity of a flow within a `State`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(Uuid);

impl FlowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FlowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which message an accept or kill acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckTarget {
    Request,
    Response,
}

/// Pristine copy of a flow's messages, kept for `revert`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowBackup {
    pub request: Request,
    pub response: Option<Response>,
    pub error: Option<ErrorInfo>,
}

/// Self-contained flow snapshot used for persistence and equality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowState {
    pub version: u32,
    pub id: FlowId,
    pub request: Request,
    pub response: Option<Response>,
    pub error: Option<ErrorInfo>,
    pub intercepting: bool,
    pub backup: Option<FlowBackup>,
}

/// One request and its outcome
#[derive(Debug, Clone)]
pub struct Flow {
    id: FlowId,

    /// The request; its `client_conn` is the flow's client
    pub request: Request,

    response: Option<Response>,

    error: Option<ErrorInfo>,

    /// Paused pending an accept or kill decision
    pub intercepting: bool,

    backup: Option<Box<FlowBackup>>,
}

impl Flow {
    /// Create a flow for a newly arrived request
    pub fn new(request: Request) -> Self {
        Self {
            id: FlowId::new(),
            request,
            response: None,
            error: None,
            intercepting: false,
            backup: None,
        }
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn request_id(&self) -> RequestId {
        self.request.id
    }

    pub fn client_conn(&self) -> Option<&ClientConnection> {
        self.request.client_conn.as_ref()
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut Response> {
        self.response.as_mut()
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.error.as_ref()
    }

    /// Neither a response nor an error has arrived
    pub fn is_pending(&self) -> bool {
        self.response.is_none() && self.error.is_none()
    }

    /// Attach the response. Refused once the flow has a response or error.
    pub fn set_response(&mut self, response: Response) -> Result<(), StateError> {
        if !self.is_pending() {
            return Err(StateError::AlreadyResolved(self.id));
        }
        self.response = Some(response);
        Ok(())
    }

    /// Attach the error. Refused once the flow has a response or error.
    pub fn set_error(&mut self, error: ErrorInfo) -> Result<(), StateError> {
        if !self.is_pending() {
            return Err(StateError::AlreadyResolved(self.id));
        }
        self.error = Some(error);
        Ok(())
    }

    /// Pause the flow; the caller must hold back the in-transit message
    pub fn intercept(&mut self) {
        self.intercepting = true;
    }

    /// Drop the in-transit message and terminate its connection
    pub fn kill(&mut self) -> Option<AckTarget> {
        self.acknowledge(Disposition::Kill)
    }

    /// Release the in-transit message for normal delivery
    pub fn accept_intercept(&mut self) -> Option<AckTarget> {
        self.acknowledge(Disposition::Forward)
    }

    fn acknowledge(&mut self, disposition: Disposition) -> Option<AckTarget> {
        let target = if !self.request.is_acked() {
            self.request.ack(disposition);
            Some(AckTarget::Request)
        } else {
            match self.response.as_mut() {
                Some(response) if !response.is_acked() => {
                    response.ack(disposition);
                    Some(AckTarget::Response)
                }
                _ => None,
            }
        };
        self.intercepting = false;
        target
    }

    /// Check whether the flow's current message may still be written out
    pub fn deliverable(&self) -> Result<(), ProxyError> {
        if self.client_conn().is_some_and(|c| !c.is_connected()) {
            return Err(ProxyError::ClientDisconnected(self.id));
        }
        let acked = match &self.response {
            Some(response) => response.acked,
            None => self.request.acked,
        };
        if acked == Some(Disposition::Kill) {
            return Err(ProxyError::Killed(self.id));
        }
        Ok(())
    }

    /// Snapshot the current messages unless a backup is already held
    pub fn backup(&mut self) {
        if self.backup.is_none() {
            self.backup = Some(Box::new(FlowBackup {
                request: self.request.clone(),
                response: self.response.clone(),
                error: self.error.clone(),
            }));
        }
    }

    /// True if a backup exists and the messages differ from it.
    /// Acknowledgement state is not content and is ignored.
    pub fn modified(&self) -> bool {
        let Some(backup) = &self.backup else {
            return false;
        };
        let mut request = backup.request.clone();
        request.acked = self.request.acked;
        if request != self.request || backup.error != self.error {
            return true;
        }
        match (&backup.response, &self.response) {
            (Some(saved), Some(live)) => {
                let mut saved = saved.clone();
                saved.acked = live.acked;
                saved != *live
            }
            (None, None) => false,
            _ => true,
        }
    }

    /// Restore the backed-up messages and drop the backup.
    /// Acknowledgements already given are kept.
    pub fn revert(&mut self) {
        let Some(backup) = self.backup.take() else {
            return;
        };
        let FlowBackup {
            mut request,
            mut response,
            error,
        } = *backup;

        request.acked = self.request.acked;
        if let (Some(restored), Some(live)) = (response.as_mut(), self.response.as_ref()) {
            restored.acked = live.acked;
        }
        self.request = request;
        self.response = response;
        self.error = error;
    }

    pub fn has_backup(&self) -> bool {
        self.backup.is_some()
    }

    /// Self-contained snapshot of the flow
    pub fn get_state(&self) -> FlowState {
        FlowState {
            version: STATE_VERSION,
            id: self.id,
            request: self.request.clone(),
            response: self.response.clone(),
            error: self.error.clone(),
            intercepting: self.intercepting,
            backup: self.backup.as_deref().cloned(),
        }
    }

    /// Overwrite this flow with a snapshot
    pub fn load_state(&mut self, state: FlowState) {
        self.id = state.id;
        self.request = state.request;
        self.response = state.response;
        self.error = state.error;
        self.intercepting = state.intercepting;
        self.backup = state.backup.map(Box::new);
    }

    /// Rebuild a flow from a snapshot
    pub fn from_state(state: FlowState) -> Self {
        Self {
            id: state.id,
            request: state.request,
            response: state.response,
            error: state.error,
            intercepting: state.intercepting,
            backup: state.backup.map(Box::new),
        }
    }

    /// Evaluate a filter against this flow. No filter matches nothing.
    pub fn matches(&self, filter: Option<&dyn FlowFilter>) -> bool {
        filter.is_some_and(|f| f.matches(self))
    }

    /// One-line description for listings
    pub fn summary(&self) -> String {
        let outcome = match (&self.response, &self.error) {
            (Some(r), _) => format!("{} {}", r.status_code, r.reason),
            (None, Some(e)) => format!("error: {}", e.msg),
            (None, None) => "pending".to_string(),
        };
        let marker = if self.intercepting { " [intercepted]" } else { "" };
        format!("{} {} -> {}{}", self.request.method, self.request.url(), outcome, marker)
    }

    /// Swap in messages produced outside the flow (scripts, hooks).
    /// The request identity and the response/error join keys are preserved.
    pub(crate) fn replace_messages(
        &mut self,
        mut request: Request,
        mut response: Option<Response>,
        mut error: Option<ErrorInfo>,
    ) {
        let request_id = self.request.id;
        request.id = request_id;
        if let Some(r) = response.as_mut() {
            r.request_id = request_id;
        }
        if let Some(e) = error.as_mut() {
            e.request_id = request_id;
        }
        if response.is_some() {
            error = None;
        }
        self.request = request;
        self.response = response;
        self.error = error;
    }

    /// Take the message edits made on a detached copy of this flow.
    ///
    /// The live flow keeps its client connection, acks and replay marks, and
    /// any response or error that arrived while the copy was out.
    pub(crate) fn apply_edits(&mut self, edited: Flow) {
        let Flow {
            mut request,
            response,
            error,
            ..
        } = edited;
        request.client_conn = self.request.client_conn.take();
        request.acked = self.request.acked;
        request.is_replay = self.request.is_replay;

        let response = match (response, self.response.take()) {
            (Some(mut edited), Some(live)) => {
                edited.acked = live.acked;
                edited.is_replay = live.is_replay;
                Some(edited)
            }
            (edited, live) => edited.or(live),
        };
        let error = error.or(self.error.take());
        self.replace_messages(request, response, error);
    }

    /// Forget the outcome so the request can be issued again
    pub(crate) fn clear_outcome(&mut self) {
        self.response = None;
        self.error = None;
    }

    /// Give the flow and its request fresh identities
    pub(crate) fn reassign_ids(&mut self) {
        let request_id = RequestId::new();
        self.id = FlowId::new();
        self.request.id = request_id;
        if let Some(r) = self.response.as_mut() {
            r.request_id = request_id;
        }
        if let Some(e) = self.error.as_mut() {
            e.request_id = request_id;
        }
        if let Some(backup) = self.backup.as_mut() {
            backup.request.id = request_id;
            if let Some(r) = backup.response.as_mut() {
                r.request_id = request_id;
            }
            if let Some(e) = backup.error.as_mut() {
                e.request_id = request_id;
            }
        }
    }
}

impl PartialEq for Flow {
    fn eq(&self, other: &Self) -> bool {
        self.get_state() == other.get_state()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub fn treq() -> Request {
        let conn = ClientConnection::new("127.0.0.1:22".parse().unwrap());
        Request::builder()
            .method("GET")
            .target("http", "address", 22)
            .path("/path")
            .header("header", "qvalue")
            .body("content")
            .client(conn)
            .build()
    }

    pub fn tresp(request: &Request) -> Response {
        let mut resp = Response::new(request.id, 200, "message").with_body("message");
        resp.headers.add("header_response", "svalue");
        resp
    }

    pub fn tflow() -> Flow {
        Flow::new(treq())
    }

    pub fn tflow_with_response() -> Flow {
        let mut flow = tflow();
        let resp = tresp(&flow.request);
        flow.set_response(resp).unwrap();
        flow
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::filter::{BodyContains, HasResponse};

    #[test]
    fn test_match() {
        let flow = tflow_with_response();
        assert!(!flow.matches(Some(&BodyContains::new("test"))));
        assert!(flow.matches(Some(&HasResponse)));
        // No filter at the flow level matches nothing
        assert!(!flow.matches(None));
    }

    #[test]
    fn test_backup_revert() {
        let mut flow = tflow_with_response();
        flow.request.content = b"foo".to_vec();
        assert!(!flow.modified());

        flow.backup();
        flow.request.content = b"bar".to_vec();
        assert!(flow.modified());

        flow.revert();
        assert_eq!(flow.request.content, b"foo");
        assert!(!flow.modified());
        assert!(!flow.has_backup());
    }

    #[test]
    fn test_backup_keeps_first_snapshot() {
        let mut flow = tflow();
        flow.request.path = "/one".to_string();
        flow.backup();
        flow.request.path = "/two".to_string();
        flow.backup();
        flow.request.path = "/three".to_string();

        flow.revert();
        assert_eq!(flow.request.path, "/one");
    }

    #[test]
    fn test_backup_covers_response() {
        let mut flow = tflow_with_response();
        flow.backup();
        flow.response_mut().unwrap().status_code = 500;
        assert!(flow.modified());

        flow.revert();
        assert_eq!(flow.response().unwrap().status_code, 200);
    }

    #[test]
    fn test_revert_without_backup_is_noop() {
        let mut flow = tflow();
        let before = flow.clone();
        flow.revert();
        assert_eq!(flow, before);
    }

    #[test]
    fn test_ack_is_not_a_modification() {
        let mut flow = tflow();
        flow.backup();
        flow.intercept();
        flow.accept_intercept();
        assert!(!flow.modified());

        flow.revert();
        assert_eq!(flow.request.acked, Some(Disposition::Forward));
    }

    #[test]
    fn test_getset_state() {
        let mut flow = tflow_with_response();
        let state = flow.get_state();
        assert_eq!(flow, Flow::from_state(state));

        flow.clear_outcome();
        flow.set_error(ErrorInfo::new(flow.request_id(), "error")).unwrap();
        let state = flow.get_state();
        assert_eq!(flow, Flow::from_state(state));

        let mut other = tflow();
        other
            .set_error(ErrorInfo::new(other.request_id(), "e2"))
            .unwrap();
        assert_ne!(flow, other);

        flow.load_state(other.get_state());
        assert_eq!(flow, other);
    }

    #[test]
    fn test_state_includes_backup() {
        let mut flow = tflow();
        flow.backup();
        flow.request.method = "POST".to_string();

        let mut restored = Flow::from_state(flow.get_state());
        assert!(restored.modified());
        restored.revert();
        assert_eq!(restored.request.method, "GET");
    }

    #[test]
    fn test_kill() {
        let mut flow = tflow();
        flow.intercept();
        assert!(!flow.request.is_acked());

        assert_eq!(flow.kill(), Some(AckTarget::Request));
        assert_eq!(flow.request.acked, Some(Disposition::Kill));
        assert!(!flow.intercepting);

        let mut flow = tflow();
        flow.request.ack(Disposition::Forward);
        let resp = tresp(&flow.request);
        flow.set_response(resp).unwrap();
        flow.intercept();
        assert!(!flow.response().unwrap().is_acked());

        assert_eq!(flow.kill(), Some(AckTarget::Response));
        assert_eq!(flow.response().unwrap().acked, Some(Disposition::Kill));
        assert_eq!(flow.request.acked, Some(Disposition::Forward));
    }

    #[test]
    fn test_accept_intercept() {
        let mut flow = tflow();
        flow.intercept();
        assert_eq!(flow.accept_intercept(), Some(AckTarget::Request));
        assert_eq!(flow.request.acked, Some(Disposition::Forward));

        let resp = tresp(&flow.request);
        flow.set_response(resp).unwrap();
        flow.intercept();
        assert!(!flow.response().unwrap().is_acked());

        assert_eq!(flow.accept_intercept(), Some(AckTarget::Response));
        assert_eq!(flow.response().unwrap().acked, Some(Disposition::Forward));
        assert!(!flow.intercepting);
    }

    #[test]
    fn test_single_outcome() {
        let mut flow = tflow_with_response();
        let err = ErrorInfo::new(flow.request_id(), "late");
        assert_eq!(
            flow.set_error(err),
            Err(StateError::AlreadyResolved(flow.id()))
        );
        let resp = tresp(&flow.request);
        assert!(flow.set_response(resp).is_err());
        assert!(flow.error().is_none());
    }

    #[test]
    fn test_deliverable() {
        let mut flow = tflow();
        assert!(flow.deliverable().is_ok());

        flow.kill();
        assert_eq!(flow.deliverable(), Err(ProxyError::Killed(flow.id())));

        let mut flow = tflow();
        flow.request.client_conn.as_mut().unwrap().mark_disconnected();
        assert_eq!(
            flow.deliverable(),
            Err(ProxyError::ClientDisconnected(flow.id()))
        );
    }

    #[test]
    fn test_replace_messages_keeps_identity() {
        let mut flow = tflow();
        let id = flow.request_id();

        let mut edited = flow.request.clone();
        edited.id = RequestId::new();
        edited.host = "TESTOK".to_string();
        flow.replace_messages(edited, None, None);

        assert_eq!(flow.request_id(), id);
        assert_eq!(flow.request.host, "TESTOK");
    }

    #[test]
    fn test_apply_edits_keeps_live_transport_state() {
        let mut live = tflow();
        let mut edited = live.clone();
        edited.request.path = "/edited".to_string();

        // Meanwhile the client leaves, the request is acked and a response lands
        live.request.client_conn.as_mut().unwrap().mark_disconnected();
        live.request.ack(Disposition::Forward);
        let resp = tresp(&live.request);
        live.set_response(resp).unwrap();

        live.apply_edits(edited);
        assert_eq!(live.request.path, "/edited");
        assert!(!live.client_conn().unwrap().is_connected());
        assert_eq!(live.request.acked, Some(Disposition::Forward));
        assert!(live.response().is_some());
        assert_eq!(live.deliverable(), Err(ProxyError::ClientDisconnected(live.id())));
    }

    #[test]
    fn test_apply_edits_keeps_response_acks() {
        let mut live = tflow_with_response();
        let mut edited = live.clone();
        edited.response_mut().unwrap().status_code = 418;
        live.response_mut().unwrap().ack(Disposition::Kill);

        live.apply_edits(edited);
        let response = live.response().unwrap();
        assert_eq!(response.status_code, 418);
        assert_eq!(response.acked, Some(Disposition::Kill));
    }

    #[test]
    fn test_summary() {
        let flow = tflow_with_response();
        assert_eq!(flow.summary(), "GET http://address:22/path -> 200 message");
    }
}
