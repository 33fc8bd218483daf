//! Workflow executor implementation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use vmport_compute::{ApiError, ComputeClient, ResourceKind};
use vmport_workflow::{StepKind, Workflow};

use crate::error::{ExecutionError, StepError};
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::handlers::{self, RunState, StepContext};
use crate::registry::{CreatedResource, ResourceRegistry};
use crate::result::RunOutcome;

/// Configuration for the workflow executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
  /// How often wait steps poll serial output and instance state.
  pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self {
      poll_interval: Duration::from_secs(5),
    }
  }
}

/// The workflow executor.
///
/// Validates a workflow, runs every step as soon as its prerequisites have
/// completed, stops scheduling at the first failure or on cancellation and
/// finally deletes the resources the run created.
#[derive(Clone)]
pub struct WorkflowExecutor {
  compute: Arc<dyn ComputeClient>,
  notifier: Arc<dyn ExecutionNotifier>,
  config: ExecutorConfig,
}

impl WorkflowExecutor {
  pub fn new(compute: Arc<dyn ComputeClient>, config: ExecutorConfig) -> Self {
    Self {
      compute,
      notifier: Arc::new(NoopNotifier),
      config,
    }
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn compute(&self) -> &Arc<dyn ComputeClient> {
    &self.compute
  }

  /// Run `workflow` to completion.
  ///
  /// Cleanup runs whether the run succeeds, fails or is cancelled.
  #[instrument(
    name = "workflow_run",
    skip(self, workflow, cancel),
    fields(workflow = %workflow.name)
  )]
  pub async fn run(
    &self,
    workflow: &Workflow,
    cancel: CancellationToken,
  ) -> Result<RunOutcome, ExecutionError> {
    let run_id = uuid::Uuid::new_v4().to_string();

    workflow
      .validate()
      .map_err(|source| ExecutionError::Validation {
        workflow: workflow.name.clone(),
        source,
      })?;

    info!(run_id = %run_id, workflow = %workflow.name, steps = workflow.steps.len(), "workflow_started");
    self.notifier.notify(ExecutionEvent::WorkflowStarted {
      run_id: run_id.clone(),
      workflow: workflow.name.clone(),
    });

    let state = Arc::new(RunState::default());
    let result = self
      .run_graph(
        Arc::new(workflow.clone()),
        run_id.clone(),
        state.clone(),
        cancel,
      )
      .await;

    if workflow.no_cleanup && !(result.is_err() && workflow.force_cleanup_on_error) {
      info!(run_id = %run_id, workflow = %workflow.name, "cleanup disabled, keeping created resources");
    } else {
      self.cleanup(&state.registry).await;
    }

    match result {
      Ok(()) => {
        info!(run_id = %run_id, workflow = %workflow.name, "workflow_completed");
        self.notifier.notify(ExecutionEvent::WorkflowCompleted {
          run_id: run_id.clone(),
          workflow: workflow.name.clone(),
        });
        Ok(RunOutcome {
          run_id,
          serial_values: state.serial_values.lock().unwrap().clone(),
          trace_logs: state.trace_logs.lock().unwrap().clone(),
          kept: state.registry.live(),
        })
      }
      Err(e) => {
        error!(run_id = %run_id, workflow = %workflow.name, error = %e, "workflow_failed");
        self.notifier.notify(ExecutionEvent::WorkflowFailed {
          run_id,
          workflow: workflow.name.clone(),
          error: e.to_string(),
        });
        Err(e)
      }
    }
  }

  /// Schedule the steps of one graph. Included workflows recurse through
  /// here with the same run state and a child token.
  fn run_graph(
    &self,
    workflow: Arc<Workflow>,
    run_id: String,
    state: Arc<RunState>,
    cancel: CancellationToken,
  ) -> BoxFuture<'static, Result<(), ExecutionError>> {
    let executor = self.clone();
    Box::pin(async move {
      let graph = workflow.graph();
      // Cancelled on the first failure; a child so outer cancellation reaches
      // every step.
      let steps_token = cancel.child_token();
      let mut completed: BTreeSet<String> = BTreeSet::new();
      let mut started: BTreeSet<String> = BTreeSet::new();
      let mut tasks: JoinSet<(String, Result<(), ExecutionError>)> = JoinSet::new();
      let mut failure: Option<ExecutionError> = None;

      loop {
        if failure.is_none() && !steps_token.is_cancelled() {
          let ready: Vec<String> = graph
            .ready(&completed, &started)
            .into_iter()
            .map(str::to_string)
            .collect();
          if !ready.is_empty() {
            debug!(workflow = %workflow.name, ready = ?ready, "dispatching ready steps");
          }
          for name in ready {
            started.insert(name.clone());
            let executor = executor.clone();
            let workflow = workflow.clone();
            let run_id = run_id.clone();
            let state = state.clone();
            let token = steps_token.clone();
            tasks.spawn(async move {
              let result = executor
                .execute_step(workflow, &name, run_id, state, token)
                .await;
              (name, result)
            });
          }
        }

        let Some(joined) = tasks.join_next().await else {
          break;
        };

        match joined {
          Ok((name, Ok(()))) => {
            completed.insert(name);
          }
          Ok((name, Err(e))) => {
            if failure.is_none() {
              warn!(workflow = %workflow.name, step = %name, "step failed, cancelling remaining steps");
              failure = Some(e);
              steps_token.cancel();
            } else {
              debug!(workflow = %workflow.name, step = %name, error = %e, "additional step failure");
            }
          }
          Err(join_error) => {
            if failure.is_none() {
              failure = Some(ExecutionError::Join {
                workflow: workflow.name.clone(),
                step: "unknown".to_string(),
                message: join_error.to_string(),
              });
              steps_token.cancel();
            }
          }
        }
      }

      match failure {
        Some(e) if !e.is_cancelled() => Err(e),
        _ if cancel.is_cancelled() => {
          warn!(workflow = %workflow.name, "workflow cancelled");
          Err(ExecutionError::Cancelled {
            workflow: workflow.name.clone(),
          })
        }
        Some(e) => Err(e),
        None => Ok(()),
      }
    })
  }

  #[instrument(name = "step", skip_all, fields(workflow = %workflow.name, step = %name))]
  async fn execute_step(
    &self,
    workflow: Arc<Workflow>,
    name: &str,
    run_id: String,
    state: Arc<RunState>,
    cancel: CancellationToken,
  ) -> Result<(), ExecutionError> {
    let Some(step) = workflow.get_step(name) else {
      return Err(ExecutionError::Join {
        workflow: workflow.name.clone(),
        step: name.to_string(),
        message: "step not found".to_string(),
      });
    };
    let timeout = workflow.step_timeout(step);

    info!(run_id = %run_id, step = %name, kind = %step.kind, "step_started");
    self.notifier.notify(ExecutionEvent::StepStarted {
      run_id: run_id.clone(),
      workflow: workflow.name.clone(),
      step: name.to_string(),
    });

    let step_error = |source: StepError| ExecutionError::Step {
      workflow: workflow.name.clone(),
      step: name.to_string(),
      source,
    };

    let body = async {
      match &step.kind {
        StepKind::IncludeWorkflow(include) => {
          let nested = Arc::new((*include.workflow).clone());
          self
            .run_graph(nested, run_id.clone(), state.clone(), cancel.child_token())
            .await
            .map_err(|e| StepError::Include(Box::new(e)))
        }
        kind => {
          let ctx = StepContext {
            compute: self.compute.clone(),
            notifier: self.notifier.clone(),
            state: state.clone(),
            workflow: workflow.name.clone(),
            step: name.to_string(),
            project: workflow.project.clone(),
            zone: workflow.zone.clone(),
            poll_interval: self.config.poll_interval,
            cancel: cancel.clone(),
          };
          handlers::run(&ctx, kind).await
        }
      }
    };

    let result = tokio::select! {
      biased;
      _ = cancel.cancelled() => Err(step_error(StepError::Cancelled)),
      outcome = tokio::time::timeout(timeout, body) => match outcome {
        Ok(result) => result.map_err(step_error),
        Err(_) => Err(ExecutionError::Timeout {
          workflow: workflow.name.clone(),
          step: name.to_string(),
          timeout,
        }),
      },
    };

    match &result {
      Ok(()) => {
        info!(run_id = %run_id, step = %name, "step_completed");
        self.notifier.notify(ExecutionEvent::StepCompleted {
          run_id,
          workflow: workflow.name.clone(),
          step: name.to_string(),
        });
      }
      Err(e) => {
        error!(run_id = %run_id, step = %name, error = %e, "step_failed");
        self.notifier.notify(ExecutionEvent::StepFailed {
          run_id,
          workflow: workflow.name.clone(),
          step: name.to_string(),
          error: e.to_string(),
        });
      }
    }
    result
  }

  /// Delete created resources, most recent first. Errors are logged only.
  async fn cleanup(&self, registry: &ResourceRegistry) {
    for resource in registry.cleanup_candidates() {
      let result = self.delete(&resource).await;
      match result {
        Ok(()) => {
          registry.mark_deleted(resource.kind, &resource.uri());
          info!(kind = %resource.kind, resource = %resource.name, "cleaned up");
        }
        Err(e) if e.is_not_found() => {
          registry.mark_deleted(resource.kind, &resource.uri());
          debug!(kind = %resource.kind, resource = %resource.name, "already gone");
        }
        Err(e) => {
          warn!(kind = %resource.kind, resource = %resource.name, error = %e, "cleanup failed");
        }
      }
    }
  }

  async fn delete(&self, resource: &CreatedResource) -> Result<(), ApiError> {
    let project = resource.project.as_str();
    let zone = resource.zone.as_deref().unwrap_or_default();
    let name = resource.name.as_str();
    match resource.kind {
      ResourceKind::Instance => self.compute.delete_instance(project, zone, name).await,
      ResourceKind::Disk => self.compute.delete_disk(project, zone, name).await,
      ResourceKind::Image => self.compute.delete_image(project, name).await,
      ResourceKind::Snapshot => self.compute.delete_snapshot(project, name).await,
      ResourceKind::MachineImage => self.compute.delete_machine_image(project, name).await,
    }
  }
}
