//! Test discovery via the framework's dry-run mode.

use explorer_core::extract::extract_json;
use explorer_core::{Config, RawTestRecord};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::runner::{Invocation, ProcessRunner, RunnerError};

/// Arguments that list examples without running them.
pub const DRY_RUN_ARGS: [&str; 3] = ["--order", "defined", "--dry-run"];

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("no test JSON found in discovery output")]
    MissingJson,
    #[error("malformed discovery output: {0}")]
    MalformedOutput(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[derive(Debug, Default, Deserialize)]
struct DiscoveryReport {
    #[serde(default)]
    examples: Vec<RawTestRecord>,
}

/// List every example the framework knows about, in defined order.
pub async fn discover(config: &Config, runner: &ProcessRunner) -> Result<Vec<RawTestRecord>> {
    let invocation = Invocation::from_config(config, DRY_RUN_ARGS);
    info!(command = %invocation.command_line, "discovering tests");

    let output = runner.capture(&invocation).await?;
    let records = parse_discovery_output(&output)?;

    info!(count = records.len(), "discovered tests");
    Ok(records)
}

pub fn parse_discovery_output(output: &str) -> Result<Vec<RawTestRecord>> {
    let Some(payload) = extract_json(output) else {
        debug!(output_bytes = output.len(), "discovery output has no JSON markers");
        return Err(DiscoveryError::MissingJson);
    };
    let report: DiscoveryReport = serde_json::from_str(payload)?;
    Ok(report.examples)
}
