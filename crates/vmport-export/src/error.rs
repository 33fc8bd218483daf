//! Error types for export.

use std::time::Duration;

use thiserror::Error;
use vmport_compute::ApiError;
use vmport_workflow::WorkflowError;
use vmport_workflow_executor::ExecutionError;

#[derive(Debug, Error)]
pub enum ExportError {
  /// The export arguments are inconsistent; nothing was created.
  #[error("invalid export arguments: {message}")]
  InvalidArgs { message: String },

  #[error("{operation} {resource}: {source}")]
  Api {
    operation: &'static str,
    resource: String,
    #[source]
    source: ApiError,
  },

  #[error("failed to build export workflow: {0}")]
  Build(#[from] WorkflowError),

  #[error("export failed: {0}")]
  Workflow(#[source] ExecutionError),

  #[error("failed to read {object} for the manifest: {source}")]
  Manifest {
    object: String,
    #[source]
    source: std::io::Error,
  },

  #[error("export cancelled: {reason}")]
  Cancelled { reason: String },

  #[error("export did not complete within {}", humantime::format_duration(*timeout))]
  Timeout { timeout: Duration },
}

impl ExportError {
  pub(crate) fn api(operation: &'static str, resource: impl Into<String>, source: ApiError) -> Self {
    Self::Api {
      operation,
      resource: resource.into(),
      source,
    }
  }

  pub(crate) fn invalid(message: impl Into<String>) -> Self {
    Self::InvalidArgs {
      message: message.into(),
    }
  }

  pub fn is_cancelled(&self) -> bool {
    match self {
      Self::Cancelled { .. } => true,
      Self::Workflow(source) => source.is_cancelled(),
      _ => false,
    }
  }
}
