//! Error types for in-place upgrades.

use std::fmt;

use thiserror::Error;
use vmport_compute::ApiError;
use vmport_workflow::WorkflowError;
use vmport_workflow_executor::ExecutionError;

use crate::runner::Phase;

#[derive(Debug, Error)]
pub enum UpgradeError {
  /// The upgrade arguments are inconsistent; nothing was touched.
  #[error("invalid upgrade arguments: {message}")]
  InvalidArgs { message: String },

  #[error("{operation} {resource}: {source}")]
  Api {
    operation: &'static str,
    resource: String,
    #[source]
    source: ApiError,
  },

  #[error("instance {instance} has no boot disk")]
  NoBootDisk { instance: String },

  #[error("boot disk {disk} has no valid license for {source_os} (expected {license})")]
  NoValidLicense {
    disk: String,
    source_os: String,
    license: String,
  },

  #[error("boot disk {disk} is already upgraded to {target_os}")]
  AlreadyUpgraded { disk: String, target_os: String },

  /// A phase failed. `recovery` says what was done about it.
  #[error(
    "upgrade failed in {phase} phase: {source}; {recovery}{}",
    manual_steps.as_deref().map(|s| format!("\n\n{}", s)).unwrap_or_default()
  )]
  Failed {
    phase: Phase,
    #[source]
    source: PhaseError,
    recovery: Recovery,
    manual_steps: Option<String>,
  },
}

impl UpgradeError {
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
    matches!(
      self,
      Self::Failed {
        source: PhaseError::Cancelled,
        ..
      }
    )
  }
}

#[derive(Debug, Error)]
pub enum PhaseError {
  /// Windows asked for a restart before setup could run.
  #[error("Windows needs to be restarted: {line}")]
  RebootRequired { line: String },

  #[error("failed to build phase workflow: {0}")]
  Build(#[from] WorkflowError),

  #[error(transparent)]
  Workflow(ExecutionError),

  #[error("{operation} {resource}: {source}")]
  Api {
    operation: &'static str,
    resource: String,
    #[source]
    source: ApiError,
  },

  #[error("cancelled")]
  Cancelled,
}

impl PhaseError {
  pub(crate) fn api(operation: &'static str, resource: impl Into<String>, source: ApiError) -> Self {
    Self::Api {
      operation,
      resource: resource.into(),
      source,
    }
  }
}

/// What happened after a failed phase.
#[derive(Debug)]
pub enum Recovery {
  RolledBack,
  CleanedUp,
  RollbackFailed(PhaseError),
  CleanupFailed(PhaseError),
}

impl Recovery {
  pub fn succeeded(&self) -> bool {
    matches!(self, Self::RolledBack | Self::CleanedUp)
  }
}

impl fmt::Display for Recovery {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::RolledBack => f.write_str("the instance was rolled back to its original disk"),
      Self::CleanedUp => f.write_str("temporary upgrade resources were cleaned up"),
      Self::RollbackFailed(e) => write!(f, "rollback failed: {}", e),
      Self::CleanupFailed(e) => write!(f, "cleanup failed: {}", e),
    }
  }
}
