//! Execution engine: walks the requested part of the suite tree, runs the
//! framework with the matching scope and turns its summary into events.
//!
//! Runs are strictly sequential; every step waits for the process to exit
//! before the next sibling starts.

use chrono::Utc;
use explorer_core::extract::extract_json;
use explorer_core::{
    Config, ExecutionStateEvent, RawTestRecord, SuiteState, TestGroup, TestLeaf, TestNode,
    TestState, TreeBuilder,
};
use futures::future::{BoxFuture, FutureExt};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::discovery::{discover, DiscoveryError};
use crate::runner::{Invocation, ProcessRunner, RunnerError};
use crate::sink::SharedSink;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed test output: {0}")]
    MalformedOutput(#[source] serde_json::Error),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure message for a test whose scoped run reported nothing.
pub const NO_RESULT_MESSAGE: &str = "no result reported";

/// Failure message for a test whose run was cancelled.
pub const CANCELLED_MESSAGE: &str = "run cancelled";

/// Summary document printed by the formatter after a run.
#[derive(Debug, Default, Deserialize)]
pub struct RunSummary {
    #[serde(default)]
    pub examples: Vec<ExampleResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExampleResult {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub exception: Option<ExampleException>,
    #[serde(default)]
    pub pending_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExampleException {
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Reported status of an example. Anything but `passed` fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExampleStatus {
    Passed,
    Failed,
    Pending,
    Unknown,
}

impl ExampleStatus {
    pub fn from_reported(status: &str) -> Self {
        match status {
            "passed" => Self::Passed,
            "failed" => Self::Failed,
            "pending" => Self::Pending,
            _ => Self::Unknown,
        }
    }

    pub fn test_state(self) -> TestState {
        match self {
            Self::Passed => TestState::Passed,
            Self::Failed | Self::Pending | Self::Unknown => TestState::Failed,
        }
    }
}

impl ExampleResult {
    pub fn status(&self) -> ExampleStatus {
        ExampleStatus::from_reported(&self.status)
    }

    fn failure_message(&self) -> Option<String> {
        match self.status() {
            ExampleStatus::Passed => None,
            ExampleStatus::Failed => self.exception.as_ref().and_then(|exception| {
                match (&exception.class, &exception.message) {
                    (Some(class), Some(message)) => Some(format!("{class}: {message}")),
                    (None, Some(message)) => Some(message.clone()),
                    (Some(class), None) => Some(class.clone()),
                    (None, None) => None,
                }
            }),
            ExampleStatus::Pending => Some(
                self.pending_message
                    .clone()
                    .unwrap_or_else(|| "pending".to_string()),
            ),
            ExampleStatus::Unknown => Some(format!("unrecognized status: {:?}", self.status)),
        }
    }

    pub fn to_event(&self) -> ExecutionStateEvent {
        ExecutionStateEvent::Test {
            test: self.id.clone(),
            state: self.status().test_state(),
            message: self.failure_message(),
        }
    }
}

/// Decode raw runner output.
///
/// Output with sentinel markers is narrowed to the marked payload; output
/// without them (including the `{}` of a process that never reported) is
/// decoded as is.
pub fn decode_summary(raw: &str) -> Result<RunSummary> {
    let payload = extract_json(raw).unwrap_or_else(|| raw.trim());
    serde_json::from_str(payload).map_err(EngineError::MalformedOutput)
}

/// What a single framework invocation covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Suite,
    File(String),
    Location { file: PathBuf, line: u32 },
}

impl Scope {
    pub fn args(&self) -> Vec<String> {
        match self {
            Self::Suite => Vec::new(),
            Self::File(path) => vec![path.clone()],
            Self::Location { file, line } => vec![format!("{}:{}", file.display(), line + 1)],
        }
    }
}

pub struct Engine {
    config: Config,
    builder: TreeBuilder,
    runner: ProcessRunner,
    events: SharedSink,
    tree: RwLock<Option<Arc<TestNode>>>,
    batch_lock: Mutex<()>,
    /// Bumped by every `cancel`; a batch is cancelled once it moves past the
    /// value seen when the batch was requested.
    cancel_epoch: AtomicU64,
}

/// One `run_selected`/`rerun` call.
#[derive(Debug, Clone, Copy)]
struct Batch {
    id: Uuid,
    epoch: u64,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine around the given runner. The runner's slot is the
    /// only process slot the engine uses.
    pub fn new(config: Config, runner: ProcessRunner, events: SharedSink) -> Self {
        Self {
            builder: TreeBuilder::from_config(&config),
            config,
            runner,
            events,
            tree: RwLock::new(None),
            batch_lock: Mutex::new(()),
            cancel_epoch: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    /// Most recently built tree.
    pub fn tree(&self) -> Option<Arc<TestNode>> {
        self.tree
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Build a tree from records and cache it.
    pub fn set_records(&self, records: &[RawTestRecord]) -> Arc<TestNode> {
        let tree = Arc::new(TestNode::from(self.builder.build_root_suite(records)));
        *self.tree.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&tree));
        tree
    }

    /// Discover tests and rebuild the cached tree.
    pub async fn load_tests(&self) -> Result<Arc<TestNode>> {
        let records = discover(&self.config, &self.runner).await?;
        Ok(self.set_records(&records))
    }

    /// Rebuild the tree, then run each requested id in order. Unknown ids
    /// are skipped.
    pub async fn run_selected(&self, ids: &[String]) -> Result<()> {
        let batch = self.begin_batch();
        let _guard = self.batch_lock.lock().await;
        let Some(tree) = self.discover_for(batch).await? else {
            return Ok(());
        };
        self.run_ids(batch, &tree, ids).await
    }

    /// Run against the cached tree, building it only if none exists yet.
    pub async fn rerun(&self, ids: &[String]) -> Result<()> {
        let batch = self.begin_batch();
        let _guard = self.batch_lock.lock().await;
        let tree = match self.tree() {
            Some(tree) => tree,
            None => match self.discover_for(batch).await? {
                Some(tree) => tree,
                None => return Ok(()),
            },
        };
        self.run_ids(batch, &tree, ids).await
    }

    /// Kill the current process and skip whatever is left of every batch
    /// requested so far, including ones still waiting for their turn.
    pub async fn cancel(&self) {
        self.cancel_epoch.fetch_add(1, Ordering::SeqCst);
        self.runner.kill().await;
    }

    fn begin_batch(&self) -> Batch {
        Batch {
            id: Uuid::now_v7(),
            epoch: self.cancel_epoch.load(Ordering::SeqCst),
        }
    }

    fn is_cancelled(&self, batch: Batch) -> bool {
        self.cancel_epoch.load(Ordering::SeqCst) != batch.epoch
    }

    /// Discovery for a batch; `None` when the batch was cancelled first.
    async fn discover_for(&self, batch: Batch) -> Result<Option<Arc<TestNode>>> {
        if self.is_cancelled(batch) {
            info!(batch = %batch.id, "run cancelled before discovery");
            return Ok(None);
        }
        match self.load_tests().await {
            Ok(tree) => Ok(Some(tree)),
            Err(EngineError::Discovery(DiscoveryError::Runner(RunnerError::Killed)))
                if self.is_cancelled(batch) =>
            {
                info!(batch = %batch.id, "discovery cancelled");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn run_ids(&self, batch: Batch, tree: &TestNode, ids: &[String]) -> Result<()> {
        info!(batch = %batch.id, count = ids.len(), "running selected tests");

        for id in ids {
            if self.is_cancelled(batch) {
                info!(batch = %batch.id, "run cancelled; skipping remaining tests");
                break;
            }
            match tree.find(id) {
                Some(node) => self.execute(batch, node).await?,
                None => debug!(batch = %batch.id, id = %id, "requested test not in tree; skipping"),
            }
        }
        Ok(())
    }

    fn execute<'a>(&'a self, batch: Batch, node: &'a TestNode) -> BoxFuture<'a, Result<()>> {
        async move {
            match node {
                TestNode::Leaf(leaf) => self.run_leaf(batch, leaf).await,
                TestNode::Group(group) if group.is_root() => {
                    self.run_suite(batch, group, Scope::Suite).await
                }
                TestNode::Group(group) if group.is_file_group(&self.config.spec_file_suffix) => {
                    self.run_suite(batch, group, Scope::File(group.id.clone())).await
                }
                TestNode::Group(group) => self.run_children(batch, group).await,
            }
        }
        .boxed()
    }

    async fn run_children(&self, batch: Batch, group: &TestGroup) -> Result<()> {
        self.emit(ExecutionStateEvent::suite(&group.id, SuiteState::Running));
        let mut result = Ok(());
        for child in &group.children {
            if self.is_cancelled(batch) {
                break;
            }
            result = self.execute(batch, child).await;
            if result.is_err() {
                break;
            }
        }
        self.emit(ExecutionStateEvent::suite(&group.id, SuiteState::Completed));
        result
    }

    async fn run_suite(&self, batch: Batch, group: &TestGroup, scope: Scope) -> Result<()> {
        self.emit(ExecutionStateEvent::suite(&group.id, SuiteState::Running));
        let result = self.run_scope(batch, &scope).await.map(|summary| {
            for example in &summary.examples {
                self.emit(example.to_event());
            }
        });
        self.emit(ExecutionStateEvent::suite(&group.id, SuiteState::Completed));
        result
    }

    /// A started leaf always ends `passed` or `failed`.
    async fn run_leaf(&self, batch: Batch, leaf: &TestLeaf) -> Result<()> {
        self.emit(ExecutionStateEvent::test(&leaf.id, TestState::Running));
        let scope = Scope::Location {
            file: leaf.file.clone(),
            line: leaf.line,
        };
        match self.run_scope(batch, &scope).await {
            Ok(summary) => {
                match summary.examples.first() {
                    Some(example) => self.emit(example.to_event()),
                    None => {
                        let message = if self.is_cancelled(batch) {
                            CANCELLED_MESSAGE
                        } else {
                            warn!(test = %leaf.id, "no result reported for test");
                            NO_RESULT_MESSAGE
                        };
                        self.emit(ExecutionStateEvent::failed_with(&leaf.id, message));
                    }
                }
                Ok(())
            }
            Err(err) => {
                self.emit(ExecutionStateEvent::failed_with(&leaf.id, err.to_string()));
                Err(err)
            }
        }
    }

    /// Run one framework process and decode its summary. Returns only after
    /// the process has exited.
    async fn run_scope(&self, batch: Batch, scope: &Scope) -> Result<RunSummary> {
        if self.is_cancelled(batch) {
            debug!(batch = %batch.id, scope = ?scope, "run cancelled; not starting");
            return Ok(RunSummary::default());
        }
        let invocation = Invocation::from_config(&self.config, scope.args());
        info!(batch = %batch.id, scope = ?scope, command = %invocation.command_line, "running tests");

        let start = Utc::now();
        let pending = self.runner.start(&invocation)?;
        // A cancel that landed before the slot was claimed found nothing to kill.
        if self.is_cancelled(batch) {
            self.runner.kill().await;
        }
        let raw = pending.output().await;
        self.runner.wait_idle().await;
        let duration_ms = (Utc::now() - start).num_milliseconds();

        let summary = decode_summary(&raw)?;
        info!(
            batch = %batch.id,
            scope = ?scope,
            duration_ms,
            examples = summary.examples.len(),
            "test run complete"
        );
        Ok(summary)
    }

    fn emit(&self, event: ExecutionStateEvent) {
        self.events.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_summary_accepts_marked_payload() {
        let raw = concat!(
            "Coverage: 90%\n",
            r#"START_OF_RSPEC_JSON START_OF_TEST_JSON{"examples":[{"id":"a[1:1]","status":"passed"}]}END_OF_TEST_JSON"#,
            "\n"
        );
        let summary = decode_summary(raw).unwrap();
        assert_eq!(summary.examples.len(), 1);
        assert_eq!(summary.examples[0].status(), ExampleStatus::Passed);
    }

    #[test]
    fn decode_summary_treats_empty_object_as_no_results() {
        let summary = decode_summary("{}").unwrap();
        assert!(summary.examples.is_empty());
    }

    #[test]
    fn decode_summary_rejects_unmarked_noise() {
        let result = decode_summary("LoadError: cannot load such file -- foo\n");
        assert!(matches!(result, Err(EngineError::MalformedOutput(_))));
    }

    #[test]
    fn decode_summary_rejects_truncated_payload() {
        let result = decode_summary(r#"START_OF_TEST_JSON{"examples":[}END_OF_TEST_JSON"#);
        assert!(matches!(result, Err(EngineError::MalformedOutput(_))));
    }

    #[test]
    fn unrecognized_statuses_fail_closed() {
        assert_eq!(ExampleStatus::from_reported("passed").test_state(), TestState::Passed);
        for status in ["failed", "pending", "skipped", "", "PASSED"] {
            assert_eq!(
                ExampleStatus::from_reported(status).test_state(),
                TestState::Failed,
                "{status:?} should fail"
            );
        }
    }

    #[test]
    fn failed_example_event_carries_exception() {
        let example: ExampleResult = serde_json::from_str(
            r#"{"id":"a[1:1]","status":"failed","exception":{"class":"RSpec::Expectations::ExpectationNotMetError","message":"expected 1"}}"#,
        )
        .unwrap();
        assert_eq!(
            example.to_event(),
            ExecutionStateEvent::failed_with(
                "a[1:1]",
                "RSpec::Expectations::ExpectationNotMetError: expected 1"
            )
        );
    }

    #[test]
    fn pending_example_fails_with_pending_message() {
        let example: ExampleResult = serde_json::from_str(
            r#"{"id":"a[1:2]","status":"pending","pending_message":"Not yet implemented"}"#,
        )
        .unwrap();
        assert_eq!(
            example.to_event(),
            ExecutionStateEvent::failed_with("a[1:2]", "Not yet implemented")
        );
    }

    #[test]
    fn passed_example_has_no_message() {
        let example: ExampleResult =
            serde_json::from_str(r#"{"id":"a[1:3]","status":"passed"}"#).unwrap();
        assert_eq!(
            example.to_event(),
            ExecutionStateEvent::test("a[1:3]", TestState::Passed)
        );
    }

    #[test]
    fn scope_args_convert_line_back_to_one_based() {
        assert!(Scope::Suite.args().is_empty());
        assert_eq!(
            Scope::File("./spec/a_spec.rb".to_string()).args(),
            vec!["./spec/a_spec.rb"]
        );
        assert_eq!(
            Scope::Location {
                file: PathBuf::from("/proj/spec/a_spec.rb"),
                line: 4,
            }
            .args(),
            vec!["/proj/spec/a_spec.rb:5"]
        );
    }
}
