//! State events sent to the host while tests run.
//!
//! Events are never stored; they are emitted in order and serialized in
//! the host's `{ "type": ..., "state": ... }` shape.

use serde::{Deserialize, Serialize};

/// State of a single test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestState {
    Running,
    Passed,
    Failed,
}

impl TestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
        }
    }
}

/// State of a suite (root, directory or file group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuiteState {
    Running,
    Completed,
}

/// State of a whole process run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecutionStateEvent {
    Test {
        test: String,
        state: TestState,
        /// Failure message, when the formatter reported one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Suite {
        suite: String,
        state: SuiteState,
    },
    Run {
        state: RunState,
    },
}

impl ExecutionStateEvent {
    pub fn test(id: impl Into<String>, state: TestState) -> Self {
        Self::Test {
            test: id.into(),
            state,
            message: None,
        }
    }

    pub fn failed_with(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Test {
            test: id.into(),
            state: TestState::Failed,
            message: Some(message.into()),
        }
    }

    pub fn suite(id: impl Into<String>, state: SuiteState) -> Self {
        Self::Suite {
            suite: id.into(),
            state,
        }
    }

    pub fn finished() -> Self {
        Self::Run {
            state: RunState::Finished,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
