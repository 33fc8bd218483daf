//! The upgrade state machine.
//!
//! validate -> prepare -> upgrade, with one reboot and retry when Windows
//! asks for a restart. A failure in any phase ends in a compensating phase:
//! rollback when it is enabled and the instance is confirmed to boot from
//! the new OS disk, cleanup otherwise.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use vmport_compute::Clients;
use vmport_workflow_utils::random_suffix;

use crate::args::UpgradeArgs;
use crate::error::{PhaseError, Recovery, UpgradeError};
use crate::recovery::{manual_cleanup_steps, manual_rollback_steps};
use crate::runner::{Phase, PhaseRunner};
use crate::vars::{DerivedVars, derive_vars};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeOutcome {
  pub instance: String,
  pub new_os_disk: String,
  pub original_os_disk: String,
  pub snapshot: String,
  pub machine_image_backup: Option<String>,
  /// The instance had to be restarted before setup could run.
  pub rebooted: bool,
  /// Every phase run, in order.
  pub phases: Vec<Phase>,
}

pub struct Upgrader {
  args: Arc<UpgradeArgs>,
  clients: Clients,
  runner: Arc<dyn PhaseRunner>,
  token: CancellationToken,
  reason: Mutex<Option<String>>,
  phases: Mutex<Vec<Phase>>,
}

impl Upgrader {
  pub fn new(args: UpgradeArgs, clients: Clients, runner: Arc<dyn PhaseRunner>) -> Self {
    Self {
      args: Arc::new(args),
      clients,
      runner,
      token: CancellationToken::new(),
      reason: Mutex::new(None),
      phases: Mutex::new(Vec::new()),
    }
  }

  /// Also stop when `parent` is cancelled.
  pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
    self.token = parent.child_token();
    self
  }

  /// Stop the running phase. Compensation still runs.
  pub fn cancel(&self, reason: &str) -> bool {
    self
      .reason
      .lock()
      .unwrap()
      .get_or_insert_with(|| reason.to_string());
    self.token.cancel();
    true
  }

  pub fn cancel_reason(&self) -> Option<String> {
    self.reason.lock().unwrap().clone()
  }

  /// Phases run so far, compensation included.
  pub fn phases(&self) -> Vec<Phase> {
    self.phases.lock().unwrap().clone()
  }

  #[instrument(name = "upgrade", skip_all, fields(instance = %self.args.instance))]
  pub async fn run(&self) -> Result<UpgradeOutcome, UpgradeError> {
    let path = self.args.validate()?;
    let target = self
      .args
      .resolve_instance(self.clients.metadata.as_ref())
      .await?;
    let vars = derive_vars(
      self.clients.compute.as_ref(),
      &self.args,
      path,
      &target,
      &random_suffix(8),
    )
    .await?;
    info!(
      instance = %vars.instance_uri,
      os_disk = %vars.os_disk_name,
      new_os_disk = %vars.new_os_disk_name,
      from = path.source_os,
      to = path.target_os,
      "upgrade validated"
    );

    match self.upgrade(&vars).await {
      Ok(rebooted) => {
        info!(instance = %vars.instance_uri, rebooted, "upgrade finished");
        Ok(UpgradeOutcome {
          instance: vars.instance_uri.clone(),
          new_os_disk: vars.new_os_disk_name.clone(),
          original_os_disk: vars.os_disk_name.clone(),
          snapshot: vars.snapshot_name.clone(),
          machine_image_backup: vars.machine_image_backup_name.clone(),
          rebooted,
          phases: self.phases(),
        })
      }
      Err((phase, source)) => {
        error!(phase = %phase, error = %source, "upgrade phase failed");
        Err(self.compensate(phase, source, &vars).await)
      }
    }
  }

  /// Returns whether a reboot was needed.
  async fn upgrade(&self, vars: &DerivedVars) -> Result<bool, (Phase, PhaseError)> {
    self.phase(Phase::Prepare, vars, self.token.clone()).await?;
    match self.phase(Phase::Upgrade, vars, self.token.clone()).await {
      Ok(()) => Ok(false),
      Err((_, PhaseError::RebootRequired { line })) => {
        info!(line = %line, "Windows needs a restart, rebooting and waiting again");
        self.phase(Phase::Reboot, vars, self.token.clone()).await?;
        self.phase(Phase::RetryUpgrade, vars, self.token.clone()).await?;
        Ok(true)
      }
      Err(e) => Err(e),
    }
  }

  async fn phase(
    &self,
    phase: Phase,
    vars: &DerivedVars,
    cancel: CancellationToken,
  ) -> Result<(), (Phase, PhaseError)> {
    self.phases.lock().unwrap().push(phase);
    info!(phase = %phase, "running phase");
    if cancel.is_cancelled() {
      return Err((phase, PhaseError::Cancelled));
    }
    self
      .runner
      .run(phase, vars, cancel)
      .await
      .map_err(|e| (phase, e))
  }

  /// Undo what can be undone after `failed` failed. Runs on its own token:
  /// the user's cancellation must not stop it.
  async fn compensate(&self, failed: Phase, source: PhaseError, vars: &DerivedVars) -> UpgradeError {
    let token = CancellationToken::new();
    let compute = &self.clients.compute;
    let new_disk_attached = match compute
      .get_instance(&vars.project, &vars.zone, &vars.instance_name)
      .await
    {
      Ok(instance) => vars.new_os_disk_attached(&instance),
      Err(e) => {
        warn!(error = %e, "could not check which disk the instance boots from");
        false
      }
    };

    let (recovery, manual_steps) = if self.args.auto_rollback && new_disk_attached {
      match self.phase(Phase::Rollback, vars, token).await {
        Ok(()) => {
          info!(instance = %vars.instance_uri, "rolled back to the original OS disk");
          (Recovery::RolledBack, None)
        }
        Err((_, e)) => {
          error!(error = %e, "rollback failed");
          (Recovery::RollbackFailed(e), Some(manual_rollback_steps(vars)))
        }
      }
    } else {
      let recovery = match self.phase(Phase::Cleanup, vars, token).await {
        Ok(()) => Recovery::CleanedUp,
        Err((_, e)) => {
          error!(error = %e, "cleanup failed");
          Recovery::CleanupFailed(e)
        }
      };
      let mut steps = Vec::new();
      if new_disk_attached {
        steps.push(manual_rollback_steps(vars));
      }
      if !recovery.succeeded() {
        steps.push(manual_cleanup_steps(vars));
      }
      (recovery, (!steps.is_empty()).then(|| steps.join("\n")))
    };

    UpgradeError::Failed {
      phase: failed,
      source,
      recovery,
      manual_steps,
    }
  }
}
