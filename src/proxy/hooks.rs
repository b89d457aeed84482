//! Lifecycle event hooks
//!
//! One method per proxy event. Every method defaults to a no-op, so a hook
//! only implements the events it cares about.

use crate::app::ScriptingConfig;
use crate::error::HookError;
use crate::flow::Flow;
use crate::proxy::ClientConnection;
use crate::scripting::Script;

/// Outcome of the client connect hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Reject,
}

/// Hooks invoked by `FlowMaster` for each lifecycle event.
///
/// Hooks receive a private copy of the flow and run without any proxy lock
/// held; changes they make are written back afterwards.
pub trait FlowHooks: Send + Sync {
    /// May tag the connection or reject it outright
    fn clientconnect(&self, _conn: &mut ClientConnection) -> Result<Admission, HookError> {
        Ok(Admission::Accept)
    }

    fn request(&self, _flow: &mut Flow) -> Result<(), HookError> {
        Ok(())
    }

    fn response(&self, _flow: &mut Flow) -> Result<(), HookError> {
        Ok(())
    }

    fn error(&self, _flow: &mut Flow) -> Result<(), HookError> {
        Ok(())
    }

    fn clientdisconnect(&self, _conn: &ClientConnection) -> Result<(), HookError> {
        Ok(())
    }
}

/// No hook installed
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHooks;

impl FlowHooks for NullHooks {}

/// Hooks backed by external scripts, one optional script per flow event
#[derive(Debug, Clone, Default)]
pub struct ScriptHooks {
    request: Option<Script>,
    response: Option<Script>,
    error: Option<Script>,
}

impl ScriptHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ScriptingConfig) -> Self {
        Self {
            request: config.request.as_ref().map(Script::new),
            response: config.response.as_ref().map(Script::new),
            error: config.error.as_ref().map(Script::new),
        }
    }

    pub fn on_request(mut self, script: Script) -> Self {
        self.request = Some(script);
        self
    }

    pub fn on_response(mut self, script: Script) -> Self {
        self.response = Some(script);
        self
    }

    pub fn on_error(mut self, script: Script) -> Self {
        self.error = Some(script);
        self
    }

    fn run(script: Option<&Script>, event: &str, flow: &mut Flow) -> Result<(), HookError> {
        let Some(script) = script else {
            return Ok(());
        };
        match script.run(flow) {
            Ok(result) => {
                if !result.console.is_empty() {
                    tracing::debug!(event, script = %script.path().display(), output = %result.console.trim_end(), "Script output");
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(event, flow = %flow.id(), "Script hook failed: {}", e);
                Err(e)
            }
        }
    }
}

impl FlowHooks for ScriptHooks {
    fn request(&self, flow: &mut Flow) -> Result<(), HookError> {
        Self::run(self.request.as_ref(), "request", flow)
    }

    fn response(&self, flow: &mut Flow) -> Result<(), HookError> {
        Self::run(self.response.as_ref(), "response", flow)
    }

    fn error(&self, flow: &mut Flow) -> Result<(), HookError> {
        Self::run(self.error.as_ref(), "error", flow)
    }
}
