//! flowtap - flow management core for an intercepting HTTP proxy
//!
//! Records request/response flows, pauses them for interception, replays
//! recorded responses and persists flows to an appendable dump format.

pub mod app;
pub mod error;
pub mod filter;
pub mod flow;
pub mod http;
pub mod playback;
pub mod proxy;
pub mod scripting;
pub mod session;

pub use error::*;
pub use flow::{Flow, FlowId, State};
pub use proxy::FlowMaster;
