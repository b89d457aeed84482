//! Proxy-facing side of the flow core
//!
//! Client connections, lifecycle hooks, interception policy and the
//! `FlowMaster` that the transport layer drives.

mod connection;
mod hooks;
mod intercept;
mod master;

pub use connection::{ClientConnection, ConnectionId};
pub use hooks::{Admission, FlowHooks, NullHooks, ScriptHooks};
pub use intercept::{InterceptAction, InterceptManager, InterceptRule, InterceptTicket, Phase};
pub use master::{Decision, FlowMaster, Handled};
