//! Flow orchestration
//!
//! `FlowMaster` is the single entry point for the transport layer. Each
//! connection worker calls the `handle_*` methods; observers read the state
//! and subscribe to events. State mutation happens under the state write
//! lock, hooks run on a private copy with no lock held, and an intercepted
//! worker waits on its ticket with no lock held.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::sync::broadcast;

use super::hooks::{Admission, FlowHooks, NullHooks, ScriptHooks};
use super::intercept::{InterceptAction, InterceptManager, InterceptTicket, Phase};
use super::{ClientConnection, ConnectionId};
use crate::app::{Config, EventBus, FlowEvent};
use crate::error::{ConfigError, FlowtapError, HookError, ProxyError, StateError};
use crate::filter::FlowFilter;
use crate::flow::{AckTarget, Flow, FlowId, State};
use crate::http::{Disposition, ErrorInfo, Request, Response};
use crate::playback::{ClientPlaybackState, ServerPlaybackState};
use crate::session;

/// What the transport layer should do with the message it handed in
#[derive(Debug)]
pub enum Decision {
    /// Deliver the message
    Forward,

    /// Drop the message and terminate the connection
    Kill,

    /// Hold the message until the ticket resolves
    Paused(InterceptTicket),

    /// Answer the client with this recorded response, skipping upstream
    Reply(Response),
}

/// Result of handling a request or response
#[derive(Debug)]
pub struct Handled {
    pub flow_id: FlowId,
    pub decision: Decision,
}

enum Lookup {
    Inactive,
    Miss,
    Hit(Response),
}

/// Orchestrates proxy lifecycle events over a shared `State`
pub struct FlowMaster {
    state: Arc<RwLock<State>>,

    /// Intercept policy and pending decisions. Always locked after `state`.
    intercept: Mutex<InterceptManager>,

    server_playback: Mutex<Option<ServerPlaybackState>>,

    client_playback: Mutex<Option<ClientPlaybackState>>,

    /// Kill requests with no recorded match while server playback is active
    kill_extra: AtomicBool,

    hooks: Box<dyn FlowHooks>,

    events: EventBus,
}

impl FlowMaster {
    pub fn new(state: Arc<RwLock<State>>) -> Self {
        Self::with_hooks(state, Box::new(NullHooks))
    }

    pub fn with_hooks(state: Arc<RwLock<State>>, hooks: Box<dyn FlowHooks>) -> Self {
        Self {
            state,
            intercept: Mutex::new(InterceptManager::new()),
            server_playback: Mutex::new(None),
            client_playback: Mutex::new(None),
            kill_extra: AtomicBool::new(false),
            hooks,
            events: EventBus::default(),
        }
    }

    /// Build a master from configuration, loading any playback dumps
    pub fn from_config(config: &Config) -> Result<Self, FlowtapError> {
        let state = Arc::new(RwLock::new(State::with_max_flows(config.general.max_flows)));
        let master = Self::with_hooks(state, Box::new(ScriptHooks::from_config(&config.scripting)));

        {
            let mut intercept = master.intercept.lock();
            intercept.set_enabled(config.intercept.enabled);
            for (index, rule) in config.intercept.rules.iter().enumerate() {
                intercept
                    .add_rule(rule.clone())
                    .map_err(|e| ConfigError::ValidationError {
                        field: format!("intercept.rules[{}].url_pattern", index),
                        reason: e.to_string(),
                    })?;
            }
        }

        master.set_kill_extra(config.playback.kill_extra);
        if let Some(path) = &config.playback.server_replay {
            master.start_playback(session::read_flows(path)?);
        }
        if let Some(path) = &config.playback.client_replay {
            master.start_client_playback(session::read_flows(path)?);
        }
        Ok(master)
    }

    /// Shared handle on the flow state
    pub fn state(&self) -> Arc<RwLock<State>> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    /// Intercept policy, for changing rules and the global switch
    pub fn intercept_manager(&self) -> MutexGuard<'_, InterceptManager> {
        self.intercept.lock()
    }

    pub fn set_kill_extra(&self, kill_extra: bool) {
        self.kill_extra.store(kill_extra, Ordering::SeqCst);
    }

    // ----- Lifecycle events -----

    pub fn handle_clientconnect(&self, mut conn: ClientConnection) -> Result<Admission, FlowtapError> {
        let admission = self.hooks.clientconnect(&mut conn)?;
        match admission {
            Admission::Accept => {
                let id = conn.id;
                tracing::debug!(conn = %id, addr = %conn.address, "Client connected");
                self.state.write().clientconnect(conn);
                self.events.emit(FlowEvent::ClientConnected(id));
            }
            Admission::Reject => {
                tracing::info!(addr = %conn.address, "Client rejected by hook");
            }
        }
        Ok(admission)
    }

    pub fn handle_clientdisconnect(
        &self,
        id: ConnectionId,
    ) -> Result<Option<ClientConnection>, FlowtapError> {
        let Some(conn) = self.state.write().clientdisconnect(id) else {
            return Ok(None);
        };
        tracing::debug!(conn = %id, "Client disconnected");
        self.events.emit(FlowEvent::ClientDisconnected(id));
        self.hooks.clientdisconnect(&conn)?;
        Ok(Some(conn))
    }

    /// Record a request and decide its fate.
    ///
    /// A recorded match is answered directly; otherwise the intercept policy
    /// may pause or kill the request.
    pub fn handle_request(&self, request: Request) -> Result<Handled, FlowtapError> {
        let lookup = self.lookup(&request);
        let is_replay = request.is_replay;
        let flow_id = self.state.write().add_request(request);
        self.events.emit(FlowEvent::FlowAdded(flow_id));

        self.run_hook(flow_id, |hooks, flow| hooks.request(flow))?;

        let decision = match lookup {
            Lookup::Hit(response) => self.reply(flow_id, response)?,
            Lookup::Miss if self.kill_extra.load(Ordering::SeqCst) => {
                tracing::debug!(flow = %flow_id, "No recorded response, killing");
                self.update(flow_id, |flow| {
                    flow.kill();
                })?;
                Decision::Kill
            }
            _ if is_replay => {
                self.update(flow_id, |flow| flow.request.ack(Disposition::Forward))?;
                Decision::Forward
            }
            _ => self.apply_policy(flow_id, Phase::Request)?,
        };
        Ok(Handled { flow_id, decision })
    }

    /// Attach a response to its flow. `Ok(None)` when no flow is waiting.
    pub fn handle_response(&self, response: Response) -> Result<Option<Handled>, FlowtapError> {
        let Some(flow_id) = self.state.write().add_response(response)? else {
            return Ok(None);
        };
        self.events.emit(FlowEvent::FlowUpdated(flow_id));

        self.run_hook(flow_id, |hooks, flow| hooks.response(flow))?;
        let decision = self.apply_policy(flow_id, Phase::Response)?;
        Ok(Some(Handled { flow_id, decision }))
    }

    /// Attach an error to its flow. `Ok(None)` when no flow is waiting.
    pub fn handle_error(&self, error: ErrorInfo) -> Result<Option<FlowId>, FlowtapError> {
        let Some(flow_id) = self.state.write().add_error(error)? else {
            return Ok(None);
        };
        self.events.emit(FlowEvent::FlowUpdated(flow_id));
        self.run_hook(flow_id, |hooks, flow| hooks.error(flow))?;
        Ok(Some(flow_id))
    }

    // ----- Server playback -----

    /// Replace the playback corpus
    pub fn start_playback(&self, flows: impl IntoIterator<Item = Flow>) {
        let corpus = ServerPlaybackState::from_flows(flows);
        tracing::info!(flows = corpus.len(), "Server playback started");
        *self.server_playback.lock() = Some(corpus);
    }

    pub fn stop_playback(&self) {
        if self.server_playback.lock().take().is_some() {
            tracing::info!("Server playback stopped");
        }
    }

    /// Recorded flows not yet served
    pub fn playback_remaining(&self) -> usize {
        self.server_playback.lock().as_ref().map_or(0, |p| p.len())
    }

    /// Pop the recorded response for `request`, bound to its identity.
    /// `None` means proxy normally.
    pub fn playback(&self, request: &Request) -> Option<Response> {
        match self.lookup(request) {
            Lookup::Hit(response) => Some(response),
            _ => None,
        }
    }

    fn lookup(&self, request: &Request) -> Lookup {
        let mut guard = self.server_playback.lock();
        let Some(corpus) = guard.as_mut() else {
            return Lookup::Inactive;
        };
        let recorded = corpus
            .next_flow(request)
            .and_then(|flow| flow.response().map(|r| r.replay_for(request.id)));
        match recorded {
            Some(response) => Lookup::Hit(response),
            None => {
                tracing::debug!(url = %request.url(), "No recorded response");
                Lookup::Miss
            }
        }
    }

    fn reply(&self, flow_id: FlowId, mut response: Response) -> Result<Decision, FlowtapError> {
        response.ack(Disposition::Forward);
        let attached = response.clone();
        self.update(flow_id, |flow| {
            flow.request.ack(Disposition::Forward);
            flow.set_response(attached)
        })??;
        tracing::debug!(flow = %flow_id, "Served recorded response");
        Ok(Decision::Reply(response))
    }

    // ----- Client replay -----

    /// Queue recorded requests for re-issue, replacing any earlier queue
    pub fn start_client_playback(&self, flows: impl IntoIterator<Item = Flow>) {
        let queue = ClientPlaybackState::new(flows);
        tracing::info!(requests = queue.len(), "Client playback started");
        *self.client_playback.lock() = Some(queue);
    }

    pub fn stop_client_playback(&self) {
        self.client_playback.lock().take();
    }

    /// Next recorded request to issue. Feed it back through `handle_request`.
    pub fn next_client_replay(&self) -> Option<Request> {
        let mut guard = self.client_playback.lock();
        let request = guard.as_mut().and_then(|q| q.next_request());
        if guard.as_ref().is_some_and(|q| q.is_empty()) {
            tracing::info!("Client playback finished");
            *guard = None;
        }
        request
    }

    /// Prepare a recorded flow to be sent again.
    ///
    /// The flow is backed up and its outcome cleared. The returned request
    /// keeps the flow's identity, so the new response joins the same flow.
    pub fn replay_request(&self, id: FlowId) -> Result<Request, StateError> {
        let request = self
            .state
            .write()
            .update(id, |flow| {
                if flow.intercepting {
                    return Err(StateError::Intercepting(id));
                }
                flow.backup();
                flow.clear_outcome();
                flow.request.client_conn = None;
                flow.request.is_replay = true;
                flow.request.ack(Disposition::Forward);
                Ok(flow.request.clone())
            })
            .ok_or(StateError::UnknownFlow(id))??;
        self.events.emit(FlowEvent::FlowUpdated(id));
        Ok(request)
    }

    // ----- Interception control -----

    /// Release a paused flow
    pub fn accept_intercept(&self, id: FlowId) -> Result<Option<AckTarget>, StateError> {
        let target = self
            .state
            .write()
            .update(id, Flow::accept_intercept)
            .ok_or(StateError::UnknownFlow(id))?;
        self.intercept.lock().resolve(id, Disposition::Forward);
        self.events.emit(FlowEvent::FlowUpdated(id));
        Ok(target)
    }

    /// Kill a flow's in-transit message and remove the flow
    pub fn kill_flow(&self, id: FlowId) -> Option<Flow> {
        let flow = {
            let mut state = self.state.write();
            state.update(id, |flow| {
                flow.kill();
            });
            state.kill_flow(id)
        };
        self.intercept.lock().resolve(id, Disposition::Kill);
        if flow.is_some() {
            self.events.emit(FlowEvent::FlowRemoved(id));
        }
        flow
    }

    /// Release every paused flow
    pub fn accept_all(&self) -> Vec<FlowId> {
        let accepted = self.state.write().accept_all();
        let mut intercept = self.intercept.lock();
        for id in &accepted {
            intercept.resolve(*id, Disposition::Forward);
        }
        drop(intercept);
        for id in &accepted {
            self.events.emit(FlowEvent::FlowUpdated(*id));
        }
        accepted
    }

    /// Abandon every pending intercept decision
    pub fn shutdown(&self) {
        let mut intercept = self.intercept.lock();
        let pending = intercept.pending_count();
        intercept.cancel_all();
        if pending > 0 {
            tracing::info!(pending, "Abandoned pending intercepts");
        }
    }

    // ----- Observers -----

    pub fn flow(&self, id: FlowId) -> Option<Flow> {
        self.state.read().flow(id).cloned()
    }

    /// Whether the flow's current message may be written to its client
    pub fn deliverable(&self, id: FlowId) -> Result<(), ProxyError> {
        self.state
            .read()
            .flow(id)
            .ok_or(ProxyError::UnknownFlow(id))?
            .deliverable()
    }

    pub fn set_limit(&self, limit: Option<Arc<dyn FlowFilter>>) {
        self.state.write().set_limit(limit);
        self.events.emit(FlowEvent::ViewChanged);
    }

    pub fn view_snapshot(&self) -> Vec<Flow> {
        self.state.read().view_snapshot()
    }

    /// Drop every flow not paused for interception
    pub fn clear(&self) {
        self.state.write().clear();
        self.events.emit(FlowEvent::ViewChanged);
    }

    pub fn load_flows(&self, flows: impl IntoIterator<Item = Flow>) -> Vec<FlowId> {
        let loaded = self.state.write().load_flows(flows);
        for id in &loaded {
            self.events.emit(FlowEvent::FlowAdded(*id));
        }
        loaded
    }

    pub fn revert(&self, id: FlowId) -> bool {
        let reverted = self.state.write().revert(id);
        if reverted {
            self.events.emit(FlowEvent::FlowUpdated(id));
        }
        reverted
    }

    // ----- Internals -----

    fn update<R>(&self, id: FlowId, f: impl FnOnce(&mut Flow) -> R) -> Result<R, ProxyError> {
        self.state
            .write()
            .update(id, f)
            .ok_or(ProxyError::UnknownFlow(id))
    }

    /// Run a hook on a copy of the flow and merge its edits back
    fn run_hook(
        &self,
        id: FlowId,
        hook: impl FnOnce(&dyn FlowHooks, &mut Flow) -> Result<(), HookError>,
    ) -> Result<(), FlowtapError> {
        let mut working = self
            .state
            .read()
            .flow(id)
            .cloned()
            .ok_or(ProxyError::UnknownFlow(id))?;
        hook(self.hooks.as_ref(), &mut working)?;
        self.update(id, |flow| flow.apply_edits(working))?;
        Ok(())
    }

    /// Pause, kill or forward the message of `phase` per the intercept policy
    fn apply_policy(&self, id: FlowId, phase: Phase) -> Result<Decision, FlowtapError> {
        let mut state = self.state.write();
        let action = {
            let flow = state.flow(id).ok_or(ProxyError::UnknownFlow(id))?;
            self.intercept.lock().evaluate(flow, phase)
        };

        let decision = match action {
            Some(InterceptAction::Pause) => {
                let ticket = self.intercept.lock().register(id);
                state.update(id, Flow::intercept);
                Decision::Paused(ticket)
            }
            Some(InterceptAction::Kill) => {
                state.update(id, |flow| {
                    flow.kill();
                });
                Decision::Kill
            }
            None => {
                state.update(id, |flow| match phase {
                    Phase::Request => flow.request.ack(Disposition::Forward),
                    Phase::Response => {
                        if let Some(response) = flow.response_mut() {
                            response.ack(Disposition::Forward);
                        }
                    }
                });
                Decision::Forward
            }
        };
        drop(state);

        match &decision {
            Decision::Paused(_) => {
                tracing::debug!(flow = %id, ?phase, "Flow intercepted");
                self.events.emit(FlowEvent::FlowIntercepted(id));
            }
            Decision::Kill => tracing::debug!(flow = %id, ?phase, "Flow killed by rule"),
            _ => {}
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{BodyContains, HasResponse};
    use crate::flow::testutil::{tflow_with_response, treq, tresp};
    use crate::proxy::InterceptRule;
    use std::sync::Barrier;
    use std::time::Duration;

    fn master() -> FlowMaster {
        FlowMaster::new(Arc::new(RwLock::new(State::new())))
    }

    fn intercept_everything(master: &FlowMaster) {
        let mut intercept = master.intercept_manager();
        intercept.set_enabled(true);
        intercept
            .add_rule(InterceptRule {
                intercept_responses: true,
                ..Default::default()
            })
            .unwrap();
    }

    #[test]
    fn test_all() {
        let master = master();
        let req = treq();
        let conn = req.client_conn.clone().unwrap();
        let resp = tresp(&req);
        let err = ErrorInfo::new(req.id, "msg");

        assert_eq!(master.handle_clientconnect(conn.clone()).unwrap(), Admission::Accept);
        let handled = master.handle_request(req).unwrap();
        assert!(matches!(handled.decision, Decision::Forward));
        assert_eq!(master.state().read().len(), 1);

        let handled = master.handle_response(resp).unwrap().unwrap();
        assert!(matches!(handled.decision, Decision::Forward));
        let flow = master.flow(handled.flow_id).unwrap();
        assert_eq!(flow.response().unwrap().acked, Some(Disposition::Forward));

        // The flow already has a response
        assert!(matches!(
            master.handle_error(err),
            Err(FlowtapError::State(StateError::AlreadyResolved(_)))
        ));

        assert!(master.handle_clientdisconnect(conn.id).unwrap().is_some());
        assert_eq!(master.state().read().client_count(), 0);
        assert_eq!(master.state().read().len(), 1);
    }

    #[test]
    fn test_unmatched_response_and_error() {
        let master = master();
        let stray = treq();
        assert!(master.handle_response(tresp(&stray)).unwrap().is_none());
        assert!(master.handle_error(ErrorInfo::new(stray.id, "msg")).unwrap().is_none());
        assert!(master.state().read().is_empty());
    }

    #[test]
    fn test_replay() {
        let master = master();
        let recorded = tflow_with_response();

        assert!(master.playback(&treq()).is_none());

        master.start_playback(vec![recorded.clone()]);
        let live = treq();
        let response = master.playback(&live).unwrap();
        assert_eq!(response.request_id, live.id);
        assert!(response.is_replay);
        assert_eq!(response.content, recorded.response().unwrap().content);

        // Single use
        assert!(master.playback(&treq()).is_none());
        master.stop_playback();
        assert_eq!(master.playback_remaining(), 0);
    }

    #[test]
    fn test_handle_request_serves_recording() {
        let master = master();
        master.start_playback(vec![tflow_with_response()]);

        let handled = master.handle_request(treq()).unwrap();
        let Decision::Reply(response) = handled.decision else {
            panic!("expected a recorded reply");
        };
        assert_eq!(response.status_code, 200);

        let flow = master.flow(handled.flow_id).unwrap();
        assert!(flow.response().unwrap().is_replay);
        assert_eq!(flow.request.acked, Some(Disposition::Forward));

        // Corpus exhausted: proxy normally
        let handled = master.handle_request(treq()).unwrap();
        assert!(matches!(handled.decision, Decision::Forward));
    }

    #[test]
    fn test_kill_extra() {
        let master = master();
        master.set_kill_extra(true);
        master.start_playback(Vec::new());

        let handled = master.handle_request(treq()).unwrap();
        assert!(matches!(handled.decision, Decision::Kill));
        assert_eq!(
            master.deliverable(handled.flow_id),
            Err(ProxyError::Killed(handled.flow_id))
        );
    }

    #[test]
    fn test_kill_rule() {
        let master = master();
        {
            let mut intercept = master.intercept_manager();
            intercept.set_enabled(true);
            intercept
                .add_rule(InterceptRule {
                    action: InterceptAction::Kill,
                    ..Default::default()
                })
                .unwrap();
        }
        let handled = master.handle_request(treq()).unwrap();
        assert!(matches!(handled.decision, Decision::Kill));
    }

    #[tokio::test]
    async fn test_intercept_accept() {
        let master = Arc::new(master());
        intercept_everything(&master);

        let handled = master.handle_request(treq()).unwrap();
        let Decision::Paused(ticket) = handled.decision else {
            panic!("expected the request to pause");
        };
        let id = handled.flow_id;
        assert_eq!(master.state().read().intercepted(), vec![id]);

        let waiter = tokio::spawn(ticket.wait());
        assert_eq!(master.accept_intercept(id).unwrap(), Some(AckTarget::Request));
        assert_eq!(waiter.await.unwrap(), Ok(Disposition::Forward));
        assert!(!master.flow(id).unwrap().intercepting);
        assert!(master.deliverable(id).is_ok());
    }

    #[tokio::test]
    async fn test_intercept_does_not_block_other_flows() {
        let master = Arc::new(master());
        {
            let mut intercept = master.intercept_manager();
            intercept.set_enabled(true);
            intercept.set_filter(Some(Arc::new(BodyContains::new("pause-me"))));
        }

        let mut paused_req = treq();
        paused_req.content = b"pause-me".to_vec();
        let handled = master.handle_request(paused_req).unwrap();
        let Decision::Paused(ticket) = handled.decision else {
            panic!("expected the request to pause");
        };
        let paused_id = handled.flow_id;
        let waiter = tokio::spawn(ticket.wait());

        // Other workers keep going while one flow waits
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let master = master.clone();
                tokio::task::spawn_blocking(move || {
                    let req = treq();
                    let resp = tresp(&req);
                    let handled = master.handle_request(req).unwrap();
                    assert!(matches!(handled.decision, Decision::Forward));
                    master.handle_response(resp).unwrap().unwrap().flow_id
                })
            })
            .collect();
        for worker in workers {
            worker.await.unwrap();
        }
        assert_eq!(master.state().read().len(), 9);
        assert!(!waiter.is_finished());

        master.kill_flow(paused_id).unwrap();
        assert_eq!(waiter.await.unwrap(), Ok(Disposition::Kill));
        assert_eq!(master.state().read().len(), 8);
        assert_eq!(master.deliverable(paused_id), Err(ProxyError::UnknownFlow(paused_id)));
    }

    #[tokio::test]
    async fn test_response_interception() {
        let master = master();
        {
            let mut intercept = master.intercept_manager();
            intercept.set_enabled(true);
            intercept
                .add_rule(InterceptRule {
                    intercept_requests: false,
                    intercept_responses: true,
                    ..Default::default()
                })
                .unwrap();
        }

        let req = treq();
        let resp = tresp(&req);
        let handled = master.handle_request(req).unwrap();
        assert!(matches!(handled.decision, Decision::Forward));

        let handled = master.handle_response(resp).unwrap().unwrap();
        let Decision::Paused(ticket) = handled.decision else {
            panic!("expected the response to pause");
        };
        assert_eq!(master.kill_flow(handled.flow_id).map(|f| f.id()), Some(handled.flow_id));
        assert_eq!(ticket.wait().await, Ok(Disposition::Kill));
    }

    #[tokio::test]
    async fn test_disconnect_while_intercepted() {
        let master = master();
        intercept_everything(&master);

        let req = treq();
        let conn = req.client_conn.clone().unwrap();
        master.handle_clientconnect(conn.clone()).unwrap();
        let handled = master.handle_request(req).unwrap();
        let id = handled.flow_id;

        master.handle_clientdisconnect(conn.id).unwrap();
        // Still paused, and a clear keeps it
        master.clear();
        assert!(master.flow(id).unwrap().intercepting);

        master.accept_intercept(id).unwrap();
        assert_eq!(master.deliverable(id), Err(ProxyError::ClientDisconnected(id)));
        let Decision::Paused(ticket) = handled.decision else {
            panic!("expected the request to pause");
        };
        assert_eq!(ticket.wait().await, Ok(Disposition::Forward));
    }

    #[tokio::test]
    async fn test_accept_all_and_shutdown() {
        let master = master();
        intercept_everything(&master);

        let tickets: Vec<InterceptTicket> = (0..3)
            .filter_map(|_| match master.handle_request(treq()).unwrap().decision {
                Decision::Paused(ticket) => Some(ticket),
                _ => None,
            })
            .collect();
        assert_eq!(tickets.len(), 3);

        assert_eq!(master.accept_all().len(), 3);
        for ticket in tickets {
            assert_eq!(ticket.wait().await, Ok(Disposition::Forward));
        }

        let handled = master.handle_request(treq()).unwrap();
        let Decision::Paused(ticket) = handled.decision else {
            panic!("expected the request to pause");
        };
        master.shutdown();
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), ticket.wait()).await.unwrap(),
            Err(ProxyError::InterceptAbandoned(handled.flow_id))
        );
    }

    struct Rejecting;

    impl FlowHooks for Rejecting {
        fn clientconnect(&self, _conn: &mut ClientConnection) -> Result<Admission, HookError> {
            Ok(Admission::Reject)
        }

        fn request(&self, flow: &mut Flow) -> Result<(), HookError> {
            flow.request.headers.set("x-hooked", "1");
            Ok(())
        }

        fn response(&self, _flow: &mut Flow) -> Result<(), HookError> {
            Err(HookError::InvalidData {
                path: "inline".into(),
                reason: "refused".to_string(),
            })
        }
    }

    #[test]
    fn test_hooks() {
        let master = FlowMaster::with_hooks(Arc::new(RwLock::new(State::new())), Box::new(Rejecting));

        let conn = ClientConnection::new("127.0.0.1:9".parse().unwrap());
        assert_eq!(master.handle_clientconnect(conn).unwrap(), Admission::Reject);
        assert_eq!(master.state().read().client_count(), 0);

        let req = treq();
        let req_id = req.id;
        let resp = tresp(&req);
        let handled = master.handle_request(req).unwrap();
        let flow = master.flow(handled.flow_id).unwrap();
        assert_eq!(flow.request.headers.get("x-hooked"), Some("1"));
        assert_eq!(flow.request_id(), req_id);

        assert!(matches!(
            master.handle_response(resp),
            Err(FlowtapError::Hook(HookError::InvalidData { .. }))
        ));
        // The response itself was recorded before the hook failed
        assert!(master.flow(handled.flow_id).unwrap().response().is_some());
    }

    struct Gate {
        entered: Arc<Barrier>,
        release: Arc<Barrier>,
    }

    impl FlowHooks for Gate {
        fn request(&self, flow: &mut Flow) -> Result<(), HookError> {
            self.entered.wait();
            self.release.wait();
            flow.request.headers.set("x-gated", "1");
            Ok(())
        }
    }

    #[test]
    fn test_disconnect_while_hook_runs() {
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let hooks = Gate {
            entered: entered.clone(),
            release: release.clone(),
        };
        let master = Arc::new(FlowMaster::with_hooks(
            Arc::new(RwLock::new(State::new())),
            Box::new(hooks),
        ));

        let req = treq();
        let conn = req.client_conn.clone().unwrap();
        master.handle_clientconnect(conn.clone()).unwrap();

        let worker = {
            let master = master.clone();
            std::thread::spawn(move || master.handle_request(req).unwrap().flow_id)
        };
        entered.wait();
        master.handle_clientdisconnect(conn.id).unwrap();
        release.wait();
        let id = worker.join().unwrap();

        let flow = master.flow(id).unwrap();
        assert_eq!(flow.request.headers.get("x-gated"), Some("1"));
        assert!(!flow.client_conn().unwrap().is_connected());
        assert_eq!(master.deliverable(id), Err(ProxyError::ClientDisconnected(id)));
    }

    #[test]
    fn test_response_during_request_hook_survives() {
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let hooks = Gate {
            entered: entered.clone(),
            release: release.clone(),
        };
        let master = Arc::new(FlowMaster::with_hooks(
            Arc::new(RwLock::new(State::new())),
            Box::new(hooks),
        ));

        let req = treq();
        let resp = tresp(&req);
        let worker = {
            let master = master.clone();
            std::thread::spawn(move || master.handle_request(req).unwrap().flow_id)
        };
        entered.wait();
        // The request hook holds no lock, so the response gets through
        let responded = master.handle_response(resp).unwrap().unwrap().flow_id;
        release.wait();
        let id = worker.join().unwrap();

        assert_eq!(responded, id);
        assert!(master.flow(id).unwrap().response().is_some());
    }

    #[test]
    fn test_client_replay() {
        let master = master();
        let recorded = vec![tflow_with_response(), tflow_with_response()];
        master.start_client_playback(recorded.clone());

        let first = master.next_client_replay().unwrap();
        assert!(first.is_replay);
        assert!(first.client_conn.is_none());
        assert_ne!(first.id, recorded[0].request_id());
        let handled = master.handle_request(first).unwrap();
        assert!(matches!(handled.decision, Decision::Forward));

        assert!(master.next_client_replay().is_some());
        assert!(master.next_client_replay().is_none());
    }

    #[test]
    fn test_replay_request() {
        let master = master();
        let req = treq();
        let resp = tresp(&req);
        let id = master.handle_request(req).unwrap().flow_id;
        master.handle_response(resp.clone()).unwrap();

        let again = master.replay_request(id).unwrap();
        assert_eq!(again.id, master.flow(id).unwrap().request_id());
        let flow = master.flow(id).unwrap();
        assert!(flow.is_pending());
        assert!(flow.modified());

        // The fresh response joins the same flow
        let mut fresh = resp;
        fresh.status_code = 304;
        let handled = master.handle_response(fresh).unwrap().unwrap();
        assert_eq!(handled.flow_id, id);

        assert!(master.revert(id));
        assert_eq!(master.flow(id).unwrap().response().unwrap().status_code, 200);

        let unknown = FlowId::new();
        assert_eq!(master.replay_request(unknown), Err(StateError::UnknownFlow(unknown)));
    }

    #[test]
    fn test_replay_request_refused_while_intercepting() {
        let master = master();
        intercept_everything(&master);
        let id = master.handle_request(treq()).unwrap().flow_id;
        assert_eq!(master.replay_request(id), Err(StateError::Intercepting(id)));
    }

    #[tokio::test]
    async fn test_events() {
        let master = master();
        let mut rx = master.subscribe();

        let req = treq();
        let resp = tresp(&req);
        let id = master.handle_request(req).unwrap().flow_id;
        master.handle_response(resp).unwrap();
        master.set_limit(Some(Arc::new(HasResponse)));
        master.kill_flow(id);

        assert_eq!(rx.recv().await.unwrap(), FlowEvent::FlowAdded(id));
        assert_eq!(rx.recv().await.unwrap(), FlowEvent::FlowUpdated(id));
        assert_eq!(rx.recv().await.unwrap(), FlowEvent::ViewChanged);
        assert_eq!(rx.recv().await.unwrap(), FlowEvent::FlowRemoved(id));
    }

    #[test]
    fn test_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("recorded.dump");
        session::append_flows(&dump, [&tflow_with_response()]).unwrap();

        let mut config = Config::default();
        config.general.max_flows = 10;
        config.intercept.enabled = true;
        config.playback.server_replay = Some(dump);
        config.playback.kill_extra = true;

        let master = FlowMaster::from_config(&config).unwrap();
        assert!(master.intercept_manager().is_enabled());
        assert_eq!(master.playback_remaining(), 1);
        assert!(matches!(master.handle_request(treq()).unwrap().decision, Decision::Reply(_)));
        assert!(matches!(master.handle_request(treq()).unwrap().decision, Decision::Kill));
    }
}
