//! Application configuration and observer events

mod config;
mod events;

pub use config::{Config, GeneralConfig, InterceptConfig, PlaybackConfig, ScriptingConfig};
pub use events::{EventBus, FlowEvent};
