pub mod config;
pub mod events;
pub mod extract;
pub mod label;
pub mod tree;
pub mod types;

pub use config::Config;
pub use events::{ExecutionStateEvent, RunState, SuiteState, TestState};
pub use tree::TreeBuilder;
pub use types::*;
