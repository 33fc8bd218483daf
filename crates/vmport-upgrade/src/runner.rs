//! Running upgrade phases.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use vmport_compute::ComputeClient;
use vmport_workflow::Workflow;
use vmport_workflow_executor::{
  ExecutionError, ExecutionNotifier, ExecutorConfig, NoopNotifier, WorkflowExecutor,
};

use crate::error::PhaseError;
use crate::phases::{
  LiveState, REBOOT_REQUIRED_MATCH, cleanup_workflow, prepare_workflow, reboot_workflow,
  retry_upgrade_workflow, rollback_workflow, upgrade_workflow,
};
use crate::vars::DerivedVars;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
  Prepare,
  Upgrade,
  Reboot,
  RetryUpgrade,
  Cleanup,
  Rollback,
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Prepare => "prepare",
      Self::Upgrade => "upgrade",
      Self::Reboot => "reboot",
      Self::RetryUpgrade => "retry-upgrade",
      Self::Cleanup => "cleanup",
      Self::Rollback => "rollback",
    })
  }
}

/// Runs one phase against the instance described by `vars`.
#[async_trait]
pub trait PhaseRunner: Send + Sync {
  async fn run(
    &self,
    phase: Phase,
    vars: &DerivedVars,
    cancel: CancellationToken,
  ) -> Result<(), PhaseError>;
}

/// Builds each phase's workflow and executes it.
pub struct WorkflowPhaseRunner {
  compute: Arc<dyn ComputeClient>,
  config: ExecutorConfig,
  notifier: Arc<dyn ExecutionNotifier>,
  timeout: Duration,
}

impl WorkflowPhaseRunner {
  /// `timeout` bounds each wait for the upgrade to finish.
  pub fn new(compute: Arc<dyn ComputeClient>, timeout: Duration) -> Self {
    Self {
      compute,
      config: ExecutorConfig::default(),
      notifier: Arc::new(NoopNotifier),
      timeout,
    }
  }

  pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
    self.config = config;
    self
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  async fn workflow(&self, phase: Phase, vars: &DerivedVars) -> Result<Workflow, PhaseError> {
    let workflow = match phase {
      Phase::Prepare => prepare_workflow(vars)?,
      Phase::Upgrade => upgrade_workflow(vars, self.timeout)?,
      Phase::Reboot => reboot_workflow(vars)?,
      Phase::RetryUpgrade => retry_upgrade_workflow(vars, self.timeout)?,
      Phase::Cleanup => {
        let live = LiveState::observe(self.compute.as_ref(), vars).await?;
        cleanup_workflow(vars, &live)?
      }
      Phase::Rollback => {
        let live = LiveState::observe(self.compute.as_ref(), vars).await?;
        rollback_workflow(vars, &live)?
      }
    };
    Ok(workflow)
  }
}

#[async_trait]
impl PhaseRunner for WorkflowPhaseRunner {
  #[instrument(name = "phase", skip_all, fields(phase = %phase, instance = %vars.instance_name))]
  async fn run(
    &self,
    phase: Phase,
    vars: &DerivedVars,
    cancel: CancellationToken,
  ) -> Result<(), PhaseError> {
    let workflow = self.workflow(phase, vars).await?;
    let executor = WorkflowExecutor::new(self.compute.clone(), self.config.clone())
      .with_notifier(self.notifier.clone());
    match executor.run(&workflow, cancel).await {
      Ok(_) => {
        info!("phase finished");
        Ok(())
      }
      Err(e) => Err(classify(e)),
    }
  }
}

fn classify(e: ExecutionError) -> PhaseError {
  if e.is_cancelled() {
    return PhaseError::Cancelled;
  }
  let reboot = e
    .failure_match()
    .filter(|m| m.pattern == REBOOT_REQUIRED_MATCH)
    .map(|m| m.line.to_string());
  match reboot {
    Some(line) => PhaseError::RebootRequired { line },
    None => PhaseError::Workflow(e),
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use vmport_workflow_executor::StepError;

  use super::*;

  fn failure(pattern: &str) -> ExecutionError {
    ExecutionError::Step {
      workflow: "upgrade".to_string(),
      step: "wait-for-upgrade".to_string(),
      source: StepError::FailureMatch {
        instance: "win".to_string(),
        port: 1,
        pattern: pattern.to_string(),
        line: format!("{} now", pattern),
      },
    }
  }

  #[test]
  fn test_reboot_is_typed() {
    let PhaseError::RebootRequired { line } = classify(failure(REBOOT_REQUIRED_MATCH)) else {
      panic!("expected reboot");
    };
    assert_eq!(line, "Windows needs to be restarted now");

    assert!(matches!(
      classify(failure("Insufficient disk space")),
      PhaseError::Workflow(_)
    ));
    assert!(matches!(
      classify(ExecutionError::Cancelled {
        workflow: "upgrade".to_string()
      }),
      PhaseError::Cancelled
    ));
    assert!(matches!(
      classify(ExecutionError::Timeout {
        workflow: "upgrade".to_string(),
        step: "wait-for-upgrade".to_string(),
        timeout: Duration::from_secs(1),
      }),
      PhaseError::Workflow(_)
    ));
  }
}
