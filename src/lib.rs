pub mod capability;
pub mod cli;
pub mod commands;
pub mod compile;
pub mod config;
pub mod engine;
pub mod error;
pub mod external;
pub mod harness;
pub mod lease;
pub mod memory;
pub mod module_api;
pub mod policy;
pub mod region;
pub mod registry;
pub mod runtime;
pub mod sandbox;
pub mod script;
pub mod watch;
pub(crate) mod workers;

pub use config::EngineConfig;
pub use engine::ScriptEngine;
pub use error::{CapabilityError, ConfigurationError, ScriptError};
pub use script::{Script, ScriptState, StopReport};
