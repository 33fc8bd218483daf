//! Error types for workflow execution.

use std::time::Duration;

use thiserror::Error;
use vmport_compute::ApiError;
use vmport_workflow::WorkflowError;

/// Why a single step failed.
#[derive(Debug, Error)]
pub enum StepError {
  /// A cloud API call failed.
  #[error("{operation} {resource}: {source}")]
  Api {
    operation: &'static str,
    resource: String,
    #[source]
    source: ApiError,
  },

  /// A wait step saw one of its failure patterns on the serial console.
  #[error("{instance}: serial port {port} matched failure pattern {pattern:?}: {line}")]
  FailureMatch {
    instance: String,
    port: i64,
    pattern: String,
    line: String,
  },

  /// An included workflow failed.
  #[error("included workflow failed: {0}")]
  Include(#[source] Box<ExecutionError>),

  /// The step was cancelled before it finished.
  #[error("step cancelled")]
  Cancelled,
}

impl StepError {
  pub(crate) fn api(operation: &'static str, resource: impl Into<String>, source: ApiError) -> Self {
    Self::Api {
      operation,
      resource: resource.into(),
      source,
    }
  }
}

/// Broad classification of an [`ExecutionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  Validation,
  Step,
  Timeout,
  Cancelled,
}

/// Errors returned by [`WorkflowExecutor::run`](crate::WorkflowExecutor::run).
#[derive(Debug, Error)]
pub enum ExecutionError {
  /// The workflow failed validation; nothing was executed.
  #[error("workflow '{workflow}' is invalid: {source}")]
  Validation {
    workflow: String,
    #[source]
    source: WorkflowError,
  },

  /// A step failed.
  #[error("workflow '{workflow}': step '{step}' failed: {source}")]
  Step {
    workflow: String,
    step: String,
    #[source]
    source: StepError,
  },

  /// A step exceeded its timeout.
  #[error("workflow '{workflow}': step '{step}' did not complete within {timeout:?}")]
  Timeout {
    workflow: String,
    step: String,
    timeout: Duration,
  },

  /// The run was cancelled.
  #[error("workflow '{workflow}' cancelled")]
  Cancelled { workflow: String },

  /// A step task panicked or was aborted.
  #[error("workflow '{workflow}': step '{step}' task failed: {message}")]
  Join {
    workflow: String,
    step: String,
    message: String,
  },
}

impl ExecutionError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Validation { .. } => ErrorKind::Validation,
      Self::Timeout { .. } => ErrorKind::Timeout,
      Self::Cancelled { .. } => ErrorKind::Cancelled,
      Self::Step {
        source: StepError::Cancelled,
        ..
      } => ErrorKind::Cancelled,
      Self::Step {
        source: StepError::Include(inner),
        ..
      } => inner.kind(),
      Self::Step { .. } | Self::Join { .. } => ErrorKind::Step,
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.kind() == ErrorKind::Cancelled
  }

  /// The step that failed, innermost first for included workflows.
  pub fn step(&self) -> Option<&str> {
    match self {
      Self::Step {
        source: StepError::Include(inner),
        step,
        ..
      } => inner.step().or(Some(step.as_str())),
      Self::Step { step, .. } | Self::Timeout { step, .. } | Self::Join { step, .. } => {
        Some(step.as_str())
      }
      _ => None,
    }
  }

  /// The serial failure match behind this error, searching included
  /// workflows.
  pub fn failure_match(&self) -> Option<FailureMatch<'_>> {
    match self {
      Self::Step {
        source:
          StepError::FailureMatch {
            instance,
            port,
            pattern,
            line,
          },
        ..
      } => Some(FailureMatch {
        instance,
        port: *port,
        pattern,
        line,
      }),
      Self::Step {
        source: StepError::Include(inner),
        ..
      } => inner.failure_match(),
      _ => None,
    }
  }
}

/// Borrowed view of a serial failure match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureMatch<'a> {
  pub instance: &'a str,
  pub port: i64,
  pub pattern: &'a str,
  pub line: &'a str,
}
