//! Execution events and notifiers.
//!
//! The executor emits an event at every workflow and step transition and for
//! every serial console line matched by a wait step's status pattern.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionEvent {
  WorkflowStarted {
    run_id: String,
    workflow: String,
  },

  StepStarted {
    run_id: String,
    workflow: String,
    step: String,
  },

  StepCompleted {
    run_id: String,
    workflow: String,
    step: String,
  },

  StepFailed {
    run_id: String,
    workflow: String,
    step: String,
    error: String,
  },

  /// A serial console line matched a wait step's status pattern.
  SerialOutput {
    workflow: String,
    step: String,
    instance: String,
    line: String,
  },

  WorkflowCompleted {
    run_id: String,
    workflow: String,
  },

  WorkflowFailed {
    run_id: String,
    workflow: String,
    error: String,
  },
}

/// Receives execution events.
///
/// Called synchronously from step tasks, so implementations must not block.
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// Forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // Receiver may have been dropped
    let _ = self.sender.send(event);
  }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
  events: Mutex<Vec<ExecutionEvent>>,
}

impl RecordingNotifier {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn events(&self) -> Vec<ExecutionEvent> {
    self.events.lock().unwrap().clone()
  }

  /// Serial lines seen so far, in order.
  pub fn serial_lines(&self) -> Vec<String> {
    self
      .events
      .lock()
      .unwrap()
      .iter()
      .filter_map(|e| match e {
        ExecutionEvent::SerialOutput { line, .. } => Some(line.clone()),
        _ => None,
      })
      .collect()
  }
}

impl ExecutionNotifier for RecordingNotifier {
  fn notify(&self, event: ExecutionEvent) {
    self.events.lock().unwrap().push(event);
  }
}
