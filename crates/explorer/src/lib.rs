//! rspec-explorer - discovers and runs RSpec examples for a host UI
//!
//! Library components behind the `rspec-explorer` binary: the single-slot
//! process runner, dry-run discovery and the execution engine.

pub mod discovery;
pub mod engine;
pub mod runner;
pub mod sink;

pub use engine::{Engine, EngineError};
pub use runner::{Invocation, ProcessRunner, RunnerError, RunnerState};
pub use sink::{EventSink, JsonLinesSink, RecordingSink, SharedSink};
