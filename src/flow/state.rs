//! Flow collection, request index and filtered view

use std::collections::HashMap;
use std::sync::Arc;

use super::{Flow, FlowId};
use crate::error::StateError;
use crate::filter::FlowFilter;
use crate::http::{ErrorInfo, Request, RequestId, Response};
use crate::proxy::{ClientConnection, ConnectionId};

struct Entry {
    /// Arrival position; orders both `flow_list` and `view`
    seq: u64,
    flow: Flow,
}

/// All recorded flows plus the currently filtered subset
pub struct State {
    flows: HashMap<FlowId, Entry>,

    /// Arrival order
    flow_list: Vec<FlowId>,

    /// Request identity -> flow
    flow_map: HashMap<RequestId, FlowId>,

    /// Subsequence of `flow_list` matching `limit`
    view: Vec<FlowId>,

    client_connections: HashMap<ConnectionId, ClientConnection>,

    limit: Option<Arc<dyn FlowFilter>>,

    next_seq: u64,

    /// Maximum number of flows to keep (0 = unbounded)
    max_flows: usize,
}

impl State {
    pub fn new() -> Self {
        Self::with_max_flows(0)
    }

    /// Create a state that evicts the oldest settled flows past `max_flows`
    pub fn with_max_flows(max_flows: usize) -> Self {
        Self {
            flows: HashMap::new(),
            flow_list: Vec::new(),
            flow_map: HashMap::new(),
            view: Vec::new(),
            client_connections: HashMap::new(),
            limit: None,
            next_seq: 0,
            max_flows,
        }
    }

    pub fn clientconnect(&mut self, conn: ClientConnection) {
        self.client_connections.insert(conn.id, conn);
    }

    /// Forget a client. Its flows stay, stamped as belonging to a gone client.
    pub fn clientdisconnect(&mut self, id: ConnectionId) -> Option<ClientConnection> {
        let mut conn = self.client_connections.remove(&id);
        if let Some(conn) = conn.as_mut() {
            conn.mark_disconnected();
        }

        for entry in self.flows.values_mut() {
            if let Some(flow_conn) = entry.flow.request.client_conn.as_mut() {
                if flow_conn.id == id {
                    flow_conn.mark_disconnected();
                }
            }
        }
        conn
    }

    pub fn client_connections(&self) -> impl Iterator<Item = &ClientConnection> {
        self.client_connections.values()
    }

    pub fn client_count(&self) -> usize {
        self.client_connections.len()
    }

    /// Record a new request. Always creates a new flow.
    pub fn add_request(&mut self, request: Request) -> FlowId {
        let flow = Flow::new(request);
        let id = flow.id();
        if let Some(previous) = self.flow_map.get(&flow.request_id()) {
            tracing::warn!(
                request = %flow.request_id(),
                flow = %previous,
                "Request identity reused; newer flow takes over the index"
            );
        }
        self.insert(flow);
        self.evict(id);
        id
    }

    /// Attach a response to the flow of its request.
    ///
    /// `Ok(None)` means no flow is waiting on that request; nothing changes.
    pub fn add_response(&mut self, response: Response) -> Result<Option<FlowId>, StateError> {
        let Some(id) = self.flow_map.get(&response.request_id).copied() else {
            tracing::debug!(request = %response.request_id, "No flow for response");
            return Ok(None);
        };
        self.resolve(id, |flow| flow.set_response(response))
    }

    /// Attach an error to the flow of its request. Same matching as responses.
    pub fn add_error(&mut self, error: ErrorInfo) -> Result<Option<FlowId>, StateError> {
        let Some(id) = self.flow_map.get(&error.request_id).copied() else {
            tracing::debug!(request = %error.request_id, "No flow for error");
            return Ok(None);
        };
        self.resolve(id, |flow| flow.set_error(error))
    }

    fn resolve(
        &mut self,
        id: FlowId,
        attach: impl FnOnce(&mut Flow) -> Result<(), StateError>,
    ) -> Result<Option<FlowId>, StateError> {
        let entry = self.flows.get_mut(&id).ok_or(StateError::UnknownFlow(id))?;
        attach(&mut entry.flow)?;
        self.refresh_view(id);
        Ok(Some(id))
    }

    /// Remove a flow from every index
    pub fn kill_flow(&mut self, id: FlowId) -> Option<Flow> {
        let entry = self.flows.remove(&id)?;
        self.flow_list.retain(|f| *f != id);
        self.view.retain(|f| *f != id);
        if self.flow_map.get(&entry.flow.request_id()) == Some(&id) {
            self.flow_map.remove(&entry.flow.request_id());
        }
        Some(entry.flow)
    }

    /// Set the view filter. `None` shows every flow.
    pub fn set_limit(&mut self, limit: Option<Arc<dyn FlowFilter>>) {
        self.limit = limit;
        let flows = &self.flows;
        let limit = &self.limit;
        self.view = self
            .flow_list
            .iter()
            .filter(|id| Self::visible(limit, &flows[*id].flow))
            .copied()
            .collect();
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    /// Remove every flow that is not paused for interception
    pub fn clear(&mut self) {
        self.flows.retain(|_, entry| entry.flow.intercepting);
        let flows = &self.flows;
        self.flow_list.retain(|id| flows.contains_key(id));
        self.view.retain(|id| flows.contains_key(id));
        self.flow_map.retain(|_, id| flows.contains_key(id));
    }

    /// Append fully formed flows, e.g. from a dump.
    ///
    /// Flows whose id is already live get fresh flow and request identities.
    pub fn load_flows(&mut self, flows: impl IntoIterator<Item = Flow>) -> Vec<FlowId> {
        let mut loaded = Vec::new();
        for mut flow in flows {
            if self.flows.contains_key(&flow.id()) || self.flow_map.contains_key(&flow.request_id()) {
                flow.reassign_ids();
            }
            loaded.push(flow.id());
            self.insert(flow);
        }
        tracing::debug!(count = loaded.len(), "Loaded flows");
        loaded
    }

    /// Accept every intercepting flow, returning the ones released
    pub fn accept_all(&mut self) -> Vec<FlowId> {
        let ids: Vec<FlowId> = self
            .flow_list
            .iter()
            .filter(|id| self.flows[*id].flow.intercepting)
            .copied()
            .collect();
        for id in &ids {
            if let Some(entry) = self.flows.get_mut(id) {
                entry.flow.accept_intercept();
            }
        }
        ids
    }

    /// Revert a flow to its backup. Returns false for unknown flows.
    pub fn revert(&mut self, id: FlowId) -> bool {
        self.update(id, Flow::revert).is_some()
    }

    pub fn flow(&self, id: FlowId) -> Option<&Flow> {
        self.flows.get(&id).map(|e| &e.flow)
    }

    /// Mutate a flow in place, then re-evaluate its view membership
    pub fn update<R>(&mut self, id: FlowId, f: impl FnOnce(&mut Flow) -> R) -> Option<R> {
        let entry = self.flows.get_mut(&id)?;
        let result = f(&mut entry.flow);
        self.refresh_view(id);
        Some(result)
    }

    pub fn flow_for_request(&self, request_id: &RequestId) -> Option<&Flow> {
        self.flow_map.get(request_id).and_then(|id| self.flow(*id))
    }

    /// All flows in arrival order
    pub fn flow_list(&self) -> impl Iterator<Item = &Flow> {
        self.flow_list.iter().map(|id| &self.flows[id].flow)
    }

    /// Flows passing the current limit, in arrival order
    pub fn view(&self) -> impl Iterator<Item = &Flow> {
        self.view.iter().map(|id| &self.flows[id].flow)
    }

    /// Owned copy of the view, for dumping or rendering without the lock
    pub fn view_snapshot(&self) -> Vec<Flow> {
        self.view().cloned().collect()
    }

    pub fn view_len(&self) -> usize {
        self.view.len()
    }

    /// Flows currently paused for interception
    pub fn intercepted(&self) -> Vec<FlowId> {
        self.flow_list()
            .filter(|f| f.intercepting)
            .map(|f| f.id())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.flow_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flow_list.is_empty()
    }

    fn insert(&mut self, flow: Flow) {
        let id = flow.id();
        self.flow_map.insert(flow.request_id(), id);
        self.flow_list.push(id);
        self.flows.insert(
            id,
            Entry {
                seq: self.next_seq,
                flow,
            },
        );
        self.next_seq += 1;
        self.refresh_view(id);
    }

    fn visible(limit: &Option<Arc<dyn FlowFilter>>, flow: &Flow) -> bool {
        limit.as_ref().map_or(true, |f| f.matches(flow))
    }

    fn refresh_view(&mut self, id: FlowId) {
        let Some(entry) = self.flows.get(&id) else {
            return;
        };
        let visible = Self::visible(&self.limit, &entry.flow);
        let flows = &self.flows;
        let position = self
            .view
            .binary_search_by_key(&entry.seq, |v| flows[v].seq);

        match (visible, position) {
            (true, Err(index)) => self.view.insert(index, id),
            (false, Ok(index)) => {
                self.view.remove(index);
            }
            _ => {}
        }
    }

    /// Drop the oldest settled flows past `max_flows`, never `keep`.
    /// Paused flows are exempt, so the bound may be exceeded.
    fn evict(&mut self, keep: FlowId) {
        if self.max_flows == 0 || self.flow_list.len() <= self.max_flows {
            return;
        }
        let excess = self.flow_list.len() - self.max_flows;
        let victims: Vec<FlowId> = self
            .flow_list
            .iter()
            .filter(|id| **id != keep && !self.flows[*id].flow.intercepting)
            .take(excess)
            .copied()
            .collect();
        for id in &victims {
            self.kill_flow(*id);
        }
        tracing::debug!(excess, evicted = victims.len(), "Evicted oldest flows");
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}
