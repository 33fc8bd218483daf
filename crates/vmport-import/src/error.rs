//! Error types for image import.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use vmport_compute::ApiError;
use vmport_workflow::WorkflowError;
use vmport_workflow_executor::ExecutionError;
use vmport_workflow_utils::OsError;

#[derive(Debug, Error)]
pub enum ImportError {
  /// The import arguments are inconsistent; nothing was created.
  #[error("invalid import arguments: {message}")]
  InvalidArgs { message: String },

  #[error(transparent)]
  Os(#[from] OsError),

  /// Neither the arguments nor inspection identified a supported OS.
  #[error("could not detect operating system: {reason}")]
  OsNotDetected { reason: String },

  /// Translation failed and inspection found a different OS than the one
  /// the user asked for.
  #[error("{detected} was detected on your disk, but {requested} was specified")]
  OsMismatch {
    detected: String,
    requested: String,
    #[source]
    source: ExecutionError,
  },

  #[error("inspection of {disk} failed: {source}")]
  Inspection {
    disk: String,
    #[source]
    source: ApiError,
  },

  #[error("{operation} {resource}: {source}")]
  Api {
    operation: &'static str,
    resource: String,
    #[source]
    source: ApiError,
  },

  #[error("failed to load workflow {}: {source}", path.display())]
  LoadWorkflow {
    path: PathBuf,
    #[source]
    source: WorkflowError,
  },

  /// A generated or loaded workflow failed.
  #[error("{stage} failed: {source}")]
  Workflow {
    stage: &'static str,
    #[source]
    source: ExecutionError,
  },

  /// A worker finished without publishing a value the import needs.
  #[error("{stage}: worker did not report `{key}`")]
  MissingValue { stage: &'static str, key: String },

  #[error("{stage}: worker reported invalid `{key}` value {value:?}")]
  InvalidValue {
    stage: &'static str,
    key: String,
    value: String,
  },

  /// The translate workflow completed without creating the image.
  #[error("image {image} was not created")]
  ImageMissing { image: String },

  #[error("import cancelled: {reason}")]
  Cancelled { reason: String },

  #[error("import did not complete within {}", humantime::format_duration(*timeout))]
  Timeout { timeout: Duration },
}

impl ImportError {
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
      Self::Workflow { source, .. } => source.is_cancelled(),
      _ => false,
    }
  }
}
