//! Destinations for execution state events.

use explorer_core::ExecutionStateEvent;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Receives state events in emission order.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ExecutionStateEvent);
}

pub type SharedSink = Arc<dyn EventSink>;

impl EventSink for mpsc::UnboundedSender<ExecutionStateEvent> {
    fn emit(&self, event: ExecutionStateEvent) {
        if self.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }
}

/// Writes each event as one JSON line on stdout.
#[derive(Debug, Default)]
pub struct JsonLinesSink;

impl EventSink for JsonLinesSink {
    fn emit(&self, event: ExecutionStateEvent) {
        let line = match event.to_json() {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "failed to serialize event");
                return;
            }
        };
        let mut stdout = std::io::stdout().lock();
        if let Err(err) = writeln!(stdout, "{line}").and_then(|()| stdout.flush()) {
            warn!(error = %err, "failed to write event");
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ExecutionStateEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events received so far.
    pub fn events(&self) -> Vec<ExecutionStateEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: ExecutionStateEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
