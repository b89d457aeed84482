//! External flow scripts
//!
//! A script is an executable that receives the flow snapshot as JSON on
//! stdin and prints the (possibly modified) snapshot on stdout. Anything on
//! stderr is returned as console output.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::HookError;
use crate::flow::{Flow, FlowState};

/// Result of script execution
#[derive(Debug, Clone)]
pub struct ScriptResult {
    /// Console output (stderr)
    pub console: String,
}

/// A flow script on disk
#[derive(Debug, Clone)]
pub struct Script {
    path: PathBuf,
}

impl Script {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run the script against a flow, applying its output to the flow
    pub fn run(&self, flow: &mut Flow) -> Result<ScriptResult, HookError> {
        let input = serde_json::to_vec(&flow.get_state()).map_err(|e| HookError::InvalidData {
            path: self.path.clone(),
            reason: format!("could not encode flow: {}", e),
        })?;

        let mut child = Command::new(&self.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.not_runnable(e))?;

        // Scripts may fill stdout before draining stdin
        let writer = child.stdin.take().map(|mut stdin| {
            std::thread::spawn(move || match stdin.write_all(&input) {
                Err(e) if e.kind() != io::ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            })
        });

        let output = child.wait_with_output().map_err(|e| self.not_runnable(e))?;
        if let Some(Ok(Err(e))) = writer.map(|w| w.join()) {
            tracing::debug!(path = %self.path.display(), error = %e, "Script stdin write failed");
        }

        let console = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(HookError::ReturnedError {
                path: self.path.clone(),
                status: output.status.to_string(),
                stderr: console,
            });
        }

        let state: FlowState =
            serde_json::from_slice(&output.stdout).map_err(|e| HookError::InvalidData {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        if state.response.is_some() && state.error.is_some() {
            return Err(HookError::InvalidData {
                path: self.path.clone(),
                reason: "flow has both a response and an error".to_string(),
            });
        }

        flow.replace_messages(state.request, state.response, state.error);
        tracing::debug!(path = %self.path.display(), flow = %flow.id(), "Script applied");
        Ok(ScriptResult { console })
    }

    fn not_runnable(&self, e: io::Error) -> HookError {
        let reason = match e.kind() {
            io::ErrorKind::NotFound => "no such file".to_string(),
            io::ErrorKind::PermissionDenied => "permission denied".to_string(),
            _ => e.to_string(),
        };
        HookError::NotRunnable {
            path: self.path.clone(),
            reason,
        }
    }
}
