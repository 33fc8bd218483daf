use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vmport_compute::{AttachedDisk, ComputeClient, Disk, EmulatorCloud, Image, Instance, InstanceStatus};
use vmport_upgrade::{
  DerivedVars, Phase, PhaseError, PhaseRunner, Recovery, STARTUP_SCRIPT_URL_BACKUP_KEY,
  STARTUP_SCRIPT_URL_KEY, UPGRADE_PATHS, UPGRADE_SCRIPT_KEY, UpgradeArgs, UpgradeError, Upgrader,
  WorkflowPhaseRunner,
};
use vmport_workflow_executor::{ExecutionError, ExecutorConfig};

const PROJECT: &str = "test-project";
const ZONE: &str = "us-central1-a";
const USER_SCRIPT: &str = "gs://scripts/user.ps1";

fn cloud_with_licenses(licenses: &[&str]) -> EmulatorCloud {
  let cloud = EmulatorCloud::new(PROJECT, ZONE);
  cloud.add_image(
    "compute-image-tools",
    Image {
      name: "windows-install-media-v20240101".to_string(),
      family: Some("windows-install-media".to_string()),
      ..Default::default()
    },
  );
  cloud.add_disk(
    PROJECT,
    ZONE,
    Disk {
      name: "win-boot".to_string(),
      size_gb: Some(50),
      disk_type: Some(format!("projects/{}/zones/{}/diskTypes/pd-balanced", PROJECT, ZONE)),
      licenses: licenses.iter().map(|l| l.to_string()).collect(),
      ..Default::default()
    },
  );
  cloud.add_instance(
    PROJECT,
    ZONE,
    Instance {
      name: "win".to_string(),
      disks: vec![AttachedDisk {
        source: "win-boot".to_string(),
        device_name: Some("persistent-disk-0".to_string()),
        boot: true,
        auto_delete: true,
        ..Default::default()
      }],
      metadata: BTreeMap::from([(STARTUP_SCRIPT_URL_KEY.to_string(), USER_SCRIPT.to_string())]),
      ..Default::default()
    },
  );
  cloud
}

fn cloud() -> EmulatorCloud {
  cloud_with_licenses(&[UPGRADE_PATHS[0].source_license])
}

fn args(auto_rollback: bool) -> UpgradeArgs {
  let mut args = UpgradeArgs::new("win");
  args.project = Some(PROJECT.to_string());
  args.zone = Some(ZONE.to_string());
  args.auto_rollback = auto_rollback;
  args.timeout = Duration::from_secs(5);
  args
}

fn workflow_runner(cloud: &EmulatorCloud) -> WorkflowPhaseRunner {
  WorkflowPhaseRunner::new(cloud.clients().compute, Duration::from_secs(5)).with_executor_config(
    ExecutorConfig {
      poll_interval: Duration::from_millis(10),
    },
  )
}

fn boot_disk(cloud: &EmulatorCloud) -> String {
  let instance = cloud.instance(PROJECT, ZONE, "win").unwrap();
  let boot = instance.boot_disk().unwrap();
  boot.source.rsplit('/').next().unwrap().to_string()
}

#[derive(Debug, Clone, Copy)]
enum Act {
  Succeed,
  Fail,
  NeedReboot,
  /// Boot the instance from the new OS disk, then fail.
  SwapDiskThenFail,
  /// Run the real workflow.
  Delegate,
}

/// Phase runner that plays a script and records what it was asked to run.
struct ScriptedRunner {
  cloud: EmulatorCloud,
  real: WorkflowPhaseRunner,
  plan: Mutex<HashMap<Phase, VecDeque<Act>>>,
  ran: Mutex<Vec<Phase>>,
}

impl ScriptedRunner {
  fn new(cloud: &EmulatorCloud, plan: &[(Phase, Act)]) -> Arc<Self> {
    let mut map: HashMap<Phase, VecDeque<Act>> = HashMap::new();
    for (phase, act) in plan {
      map.entry(*phase).or_default().push_back(*act);
    }
    Arc::new(Self {
      cloud: cloud.clone(),
      real: workflow_runner(cloud),
      plan: Mutex::new(map),
      ran: Mutex::new(Vec::new()),
    })
  }

  fn ran(&self) -> Vec<Phase> {
    self.ran.lock().unwrap().clone()
  }

  fn next(&self, phase: Phase) -> Act {
    let scripted = self
      .plan
      .lock()
      .unwrap()
      .get_mut(&phase)
      .and_then(|acts| acts.pop_front());
    match (scripted, phase) {
      (Some(act), _) => act,
      (None, Phase::Cleanup | Phase::Rollback) => Act::Delegate,
      (None, _) => Act::Succeed,
    }
  }
}

fn failed_step() -> PhaseError {
  PhaseError::Workflow(ExecutionError::Timeout {
    workflow: "scripted".to_string(),
    step: "scripted-step".to_string(),
    timeout: Duration::from_secs(1),
  })
}

#[async_trait]
impl PhaseRunner for ScriptedRunner {
  async fn run(
    &self,
    phase: Phase,
    vars: &DerivedVars,
    cancel: CancellationToken,
  ) -> Result<(), PhaseError> {
    self.ran.lock().unwrap().push(phase);
    match self.next(phase) {
      Act::Succeed => Ok(()),
      Act::Fail => Err(failed_step()),
      Act::NeedReboot => Err(PhaseError::RebootRequired {
        line: "Windows needs to be restarted before the upgrade can start.".to_string(),
      }),
      Act::SwapDiskThenFail => {
        self.cloud.add_disk(
          PROJECT,
          ZONE,
          Disk {
            name: vars.new_os_disk_name.clone(),
            ..Default::default()
          },
        );
        self
          .cloud
          .detach_disk(PROJECT, ZONE, "win", &vars.os_disk_device_name)
          .await
          .unwrap();
        self
          .cloud
          .attach_disk(
            PROJECT,
            ZONE,
            "win",
            &AttachedDisk {
              source: vars.new_os_disk_name.clone(),
              device_name: Some(vars.os_disk_device_name.clone()),
              boot: true,
              ..Default::default()
            },
          )
          .await
          .unwrap();
        Err(failed_step())
      }
      Act::Delegate => self.real.run(phase, vars, cancel).await,
    }
  }
}

#[tokio::test]
async fn test_upgrade_end_to_end() {
  let cloud = cloud();
  cloud.on_boot("win", 1, "Beginning upgrade startup script.\nUpgrade: launching setup\n");
  cloud.on_boot("win", 3, "windows_upgrade_current_version=6.3\n");

  let upgrader = Upgrader::new(args(false), cloud.clients(), Arc::new(workflow_runner(&cloud)));
  let outcome = upgrader.run().await.unwrap();

  assert!(!outcome.rebooted);
  assert_eq!(outcome.phases, vec![Phase::Prepare, Phase::Upgrade]);
  assert!(outcome.new_os_disk.starts_with("win-boot-windows-2012r2-"));
  assert_eq!(outcome.original_os_disk, "win-boot");
  assert_eq!(boot_disk(&cloud), outcome.new_os_disk);

  let new_disk = cloud.disk(PROJECT, ZONE, &outcome.new_os_disk).unwrap();
  assert!(new_disk.licenses.contains(&UPGRADE_PATHS[0].upgraded_license.to_string()));
  assert_eq!(new_disk.disk_type.as_deref().map(|t| t.rsplit('/').next().unwrap()), Some("pd-balanced"));

  let instance = cloud.instance(PROJECT, ZONE, "win").unwrap();
  assert_eq!(instance.status, InstanceStatus::Running);
  assert_eq!(instance.disks.len(), 1);
  assert_eq!(instance.disks[0].device_name.as_deref(), Some("persistent-disk-0"));
  assert!(instance.disks[0].auto_delete);
  assert_eq!(instance.metadata.get(STARTUP_SCRIPT_URL_KEY).map(String::as_str), Some(USER_SCRIPT));
  assert!(!instance.metadata.contains_key(UPGRADE_SCRIPT_KEY));
  assert!(!instance.metadata.contains_key(STARTUP_SCRIPT_URL_BACKUP_KEY));

  // The original disk and the backups stay around.
  assert!(cloud.disk(PROJECT, ZONE, "win-boot").unwrap().users.is_empty());
  assert!(cloud.snapshot(PROJECT, &outcome.snapshot).is_some());
  let backup = outcome.machine_image_backup.unwrap();
  assert!(cloud.machine_image(PROJECT, &backup).is_some());
  assert!(
    !cloud
      .state()
      .disks
      .keys()
      .any(|uri| uri.contains("windows-install-media"))
  );

  let calls = cloud.calls();
  assert_eq!(calls.first().map(String::as_str), Some("stop_instance win"));
  assert_eq!(calls.last().map(String::as_str), Some("start_instance win"));
}

#[tokio::test]
async fn test_repeated_restart_request_rolls_back() {
  let cloud = cloud();
  cloud.on_boot(
    "win",
    1,
    "Beginning upgrade startup script.\nWindows needs to be restarted before the upgrade can start.\n",
  );

  let upgrader = Upgrader::new(args(true), cloud.clients(), Arc::new(workflow_runner(&cloud)));
  let err = upgrader.run().await.unwrap_err();

  let UpgradeError::Failed {
    phase,
    source,
    recovery,
    manual_steps,
  } = err
  else {
    panic!("expected a failed phase, got {}", err);
  };
  assert_eq!(phase, Phase::RetryUpgrade);
  assert!(matches!(source, PhaseError::RebootRequired { .. }));
  assert!(matches!(recovery, Recovery::RolledBack), "{}", recovery);
  assert!(manual_steps.is_none());
  assert_eq!(
    upgrader.phases(),
    vec![
      Phase::Prepare,
      Phase::Upgrade,
      Phase::Reboot,
      Phase::RetryUpgrade,
      Phase::Rollback
    ]
  );

  assert_eq!(boot_disk(&cloud), "win-boot");
  let instance = cloud.instance(PROJECT, ZONE, "win").unwrap();
  assert_eq!(instance.status, InstanceStatus::Terminated);
  assert_eq!(instance.disks.len(), 1);
  assert_eq!(instance.disks[0].device_name.as_deref(), Some("persistent-disk-0"));
  assert!(instance.disks[0].auto_delete);
  assert_eq!(instance.metadata.get(STARTUP_SCRIPT_URL_KEY).map(String::as_str), Some(USER_SCRIPT));
  assert!(!instance.metadata.contains_key(UPGRADE_SCRIPT_KEY));

  let disks: Vec<String> = cloud.state().disks.keys().cloned().collect();
  assert_eq!(disks, vec![format!("projects/{}/zones/{}/disks/win-boot", PROJECT, ZONE)]);
}

#[tokio::test]
async fn test_rollback_runs_when_new_disk_is_attached() {
  let cloud = cloud();
  let runner = ScriptedRunner::new(&cloud, &[(Phase::Prepare, Act::SwapDiskThenFail)]);
  let upgrader = Upgrader::new(args(true), cloud.clients(), runner.clone());

  let err = upgrader.run().await.unwrap_err();
  let UpgradeError::Failed {
    phase, recovery, ..
  } = &err
  else {
    panic!("expected a failed phase, got {}", err);
  };
  assert_eq!(*phase, Phase::Prepare);
  assert!(matches!(recovery, Recovery::RolledBack));
  assert_eq!(runner.ran(), vec![Phase::Prepare, Phase::Rollback]);
  assert_eq!(boot_disk(&cloud), "win-boot");
  assert_eq!(cloud.state().disks.len(), 1);
}

#[tokio::test]
async fn test_cleanup_instead_of_rollback_when_disabled() {
  let cloud = cloud();
  let runner = ScriptedRunner::new(&cloud, &[(Phase::Prepare, Act::SwapDiskThenFail)]);
  let upgrader = Upgrader::new(args(false), cloud.clients(), runner.clone());

  let err = upgrader.run().await.unwrap_err();
  let message = err.to_string();
  let UpgradeError::Failed {
    recovery,
    manual_steps,
    ..
  } = err
  else {
    panic!("expected a failed phase, got {}", message);
  };
  assert!(matches!(recovery, Recovery::CleanedUp));
  assert_eq!(runner.ran(), vec![Phase::Prepare, Phase::Cleanup]);

  // The upgraded disk stays attached for the user to decide.
  assert_ne!(boot_disk(&cloud), "win-boot");
  let steps = manual_steps.unwrap();
  assert!(steps.contains("To roll back projects/test-project/zones/us-central1-a/instances/win"));
  assert!(message.contains(&steps));
}

#[tokio::test]
async fn test_no_rollback_before_disk_swap() {
  let cloud = cloud();
  let runner = ScriptedRunner::new(&cloud, &[(Phase::Prepare, Act::Fail)]);
  let upgrader = Upgrader::new(args(true), cloud.clients(), runner.clone());

  let err = upgrader.run().await.unwrap_err();
  assert!(matches!(
    err,
    UpgradeError::Failed {
      recovery: Recovery::CleanedUp,
      manual_steps: None,
      ..
    }
  ));
  assert_eq!(runner.ran(), vec![Phase::Prepare, Phase::Cleanup]);
}

#[tokio::test]
async fn test_reboot_then_retry() {
  let cloud = cloud();
  let runner = ScriptedRunner::new(&cloud, &[(Phase::Upgrade, Act::NeedReboot)]);
  let upgrader = Upgrader::new(args(false), cloud.clients(), runner.clone());

  let outcome = upgrader.run().await.unwrap();
  assert!(outcome.rebooted);
  assert_eq!(
    runner.ran(),
    vec![Phase::Prepare, Phase::Upgrade, Phase::Reboot, Phase::RetryUpgrade]
  );
}

#[tokio::test]
async fn test_other_upgrade_failures_do_not_reboot() {
  let cloud = cloud();
  let runner = ScriptedRunner::new(&cloud, &[(Phase::Upgrade, Act::Fail)]);
  let upgrader = Upgrader::new(args(false), cloud.clients(), runner.clone());

  let err = upgrader.run().await.unwrap_err();
  assert!(matches!(
    err,
    UpgradeError::Failed {
      phase: Phase::Upgrade,
      ..
    }
  ));
  assert_eq!(runner.ran(), vec![Phase::Prepare, Phase::Upgrade, Phase::Cleanup]);
}

#[tokio::test]
async fn test_failed_rollback_prints_manual_steps() {
  let cloud = cloud();
  let runner = ScriptedRunner::new(
    &cloud,
    &[
      (Phase::Prepare, Act::SwapDiskThenFail),
      (Phase::Rollback, Act::Fail),
    ],
  );
  let upgrader = Upgrader::new(args(true), cloud.clients(), runner.clone());

  let err = upgrader.run().await.unwrap_err();
  let UpgradeError::Failed {
    recovery,
    manual_steps,
    ..
  } = err
  else {
    panic!("expected a failed phase");
  };
  assert!(matches!(recovery, Recovery::RollbackFailed(_)));
  assert!(manual_steps.unwrap().contains("attach the original OS disk win-boot"));
}

#[tokio::test]
async fn test_cancelled_upgrade_still_cleans_up() {
  let cloud = cloud();
  let runner = ScriptedRunner::new(&cloud, &[]);
  let upgrader = Upgrader::new(args(false), cloud.clients(), runner.clone());
  upgrader.cancel("user interrupt");

  let err = upgrader.run().await.unwrap_err();
  assert!(err.is_cancelled());
  assert_eq!(upgrader.cancel_reason().as_deref(), Some("user interrupt"));
  // Prepare never reached the runner.
  assert_eq!(runner.ran(), vec![Phase::Cleanup]);
}

#[tokio::test]
async fn test_license_guard_touches_nothing() {
  for (licenses, expected) in [
    (vec![], "no valid license"),
    (
      vec!["projects/windows-cloud/global/licenses/windows-server-2016-dc"],
      "no valid license",
    ),
    (
      vec![UPGRADE_PATHS[0].source_license, UPGRADE_PATHS[0].upgraded_license],
      "already upgraded",
    ),
  ] {
    let cloud = cloud_with_licenses(&licenses);
    let runner = ScriptedRunner::new(&cloud, &[]);
    let upgrader = Upgrader::new(args(true), cloud.clients(), runner.clone());

    let err = upgrader.run().await.unwrap_err();
    assert!(err.to_string().contains(expected), "{}", err);
    assert!(runner.ran().is_empty());
    assert!(cloud.calls().is_empty());
  }
}

#[tokio::test]
async fn test_interrupted_attempt_keeps_first_backup() {
  let cloud = cloud();
  let mut instance = cloud.instance(PROJECT, ZONE, "win").unwrap();
  instance.metadata.insert(
    STARTUP_SCRIPT_URL_BACKUP_KEY.to_string(),
    "gs://scripts/first.ps1".to_string(),
  );
  cloud
    .set_instance_metadata(PROJECT, ZONE, "win", &instance.metadata)
    .await
    .unwrap();
  cloud.on_boot("win", 1, "Beginning upgrade startup script.\n");
  cloud.on_boot("win", 3, "windows_upgrade_current_version=6.3\n");

  let upgrader = Upgrader::new(args(false), cloud.clients(), Arc::new(workflow_runner(&cloud)));
  upgrader.run().await.unwrap();

  let metadata = cloud.instance(PROJECT, ZONE, "win").unwrap().metadata;
  assert_eq!(
    metadata.get(STARTUP_SCRIPT_URL_KEY).map(String::as_str),
    Some("gs://scripts/first.ps1")
  );
  assert!(!metadata.contains_key(STARTUP_SCRIPT_URL_BACKUP_KEY));
}
