//! Workflow builders for each upgrade phase.
//!
//! Resources created while preparing are kept (`no_cleanup`): the later
//! phases and any rollback need them after the prepare workflow is gone.

use std::collections::BTreeMap;
use std::time::Duration;

use vmport_compute::path::resource_name;
use vmport_compute::{AttachedDisk, ComputeClient, Disk, MachineImage, Snapshot};
use vmport_workflow::{
  AttachDiskDef, DeleteResourcesDef, DetachDiskDef, DiskDef, InstanceSignal, MachineImageDef,
  MetadataUpdateDef, SerialOutputSignal, SnapshotDef, StepKind, Workflow, WorkflowError,
};

use crate::error::PhaseError;
use crate::vars::{
  DerivedVars, STARTUP_SCRIPT_URL_BACKUP_KEY, STARTUP_SCRIPT_URL_KEY, UPGRADE_SCRIPT_KEY,
};

/// The script run at boot while the upgrade is in progress.
pub const UPGRADE_SCRIPT: &str = include_str!("../scripts/upgrade_script.ps1");

pub const STARTED_MATCH: &str = "Beginning upgrade startup script.";
pub const REBOOT_REQUIRED_MATCH: &str = "Windows needs to be restarted";
pub const DISK_SPACE_MATCH: &str = "Insufficient disk space";
pub const FAILURE_MATCH: &str = "UpgradeFailed:";
pub const STATUS_MATCH: &str = "Upgrade:";

const PROGRESS_PORT: i64 = 1;
const RESULT_PORT: i64 = 3;
const BOOT_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Live view of the instance taken right before a compensating phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveState {
  /// Name of the disk the instance boots from, if any.
  pub boot_disk: Option<String>,
  pub install_media_attached: bool,
  pub install_media_exists: bool,
  pub new_os_disk_exists: bool,
  pub original_os_disk_attached: bool,
}

impl LiveState {
  pub async fn observe(compute: &dyn ComputeClient, vars: &DerivedVars) -> Result<Self, PhaseError> {
    let instance = compute
      .get_instance(&vars.project, &vars.zone, &vars.instance_name)
      .await
      .map_err(|e| PhaseError::api("get_instance", vars.instance_uri.clone(), e))?;
    let attached = |name: &str| {
      instance
        .disks
        .iter()
        .any(|d| resource_name(&d.source) == name)
    };

    Ok(Self {
      boot_disk: instance
        .boot_disk()
        .map(|d| resource_name(&d.source).to_string()),
      install_media_attached: attached(&vars.install_media_disk_name),
      original_os_disk_attached: attached(&vars.os_disk_name),
      install_media_exists: disk_exists(compute, vars, &vars.install_media_disk_name).await,
      new_os_disk_exists: disk_exists(compute, vars, &vars.new_os_disk_name).await,
    })
  }

  fn new_os_disk_attached(&self, vars: &DerivedVars) -> bool {
    self.boot_disk.as_deref() == Some(vars.new_os_disk_name.as_str())
  }
}

/// Stop the instance, back it up and swap its OS disk for an upgradable
/// copy with the install media next to it.
pub fn prepare_workflow(vars: &DerivedVars) -> Result<Workflow, WorkflowError> {
  let mut wf = Workflow::new("upgrade-prepare", &vars.project, &vars.zone);
  let instance = vars.instance_uri.as_str();
  let mut chain = vec!["stop-instance"];
  wf.add_step("stop-instance", StepKind::StopInstances(vec![instance.to_string()]))?;

  if let Some(backup) = &vars.machine_image_backup_name {
    wf.add_step(
      "backup-machine-image",
      StepKind::CreateMachineImages(vec![MachineImageDef {
        machine_image: MachineImage {
          name: backup.clone(),
          source_instance: instance.to_string(),
          ..Default::default()
        },
        no_cleanup: true,
        ..Default::default()
      }]),
    )?;
    chain.push("backup-machine-image");
  }

  wf.add_step(
    "backup-os-disk-snapshot",
    StepKind::CreateSnapshots(vec![SnapshotDef {
      snapshot: Snapshot {
        name: vars.snapshot_name.clone(),
        source_disk: vars.os_disk_uri.clone(),
        ..Default::default()
      },
      no_cleanup: true,
      ..Default::default()
    }]),
  )?;
  wf.add_step(
    "create-new-os-disk",
    StepKind::CreateDisks(vec![DiskDef {
      no_cleanup: true,
      ..DiskDef::new(Disk {
        name: vars.new_os_disk_name.clone(),
        source_snapshot: Some(vars.snapshot_name.clone()),
        disk_type: vars.os_disk_type.clone(),
        licenses: vec![vars.upgraded_license.clone()],
        ..Default::default()
      })
    }]),
  )?;
  wf.add_step(
    "detach-old-os-disk",
    StepKind::DetachDisks(vec![detach(vars, &vars.os_disk_device_name)]),
  )?;
  wf.add_step(
    "attach-new-os-disk",
    StepKind::AttachDisks(vec![AttachDiskDef {
      instance: instance.to_string(),
      attached_disk: AttachedDisk {
        source: vars.new_os_disk_name.clone(),
        device_name: Some(vars.os_disk_device_name.clone()),
        boot: true,
        auto_delete: vars.os_disk_auto_delete,
        ..Default::default()
      },
    }]),
  )?;
  wf.add_step(
    "create-install-media-disk",
    StepKind::CreateDisks(vec![DiskDef {
      no_cleanup: true,
      ..DiskDef::new(Disk {
        name: vars.install_media_disk_name.clone(),
        source_image: Some(vars.install_media_image.clone()),
        disk_type: Some("pd-ssd".to_string()),
        ..Default::default()
      })
    }]),
  )?;
  wf.add_step(
    "attach-install-media-disk",
    StepKind::AttachDisks(vec![AttachDiskDef {
      instance: instance.to_string(),
      attached_disk: AttachedDisk {
        source: vars.install_media_disk_name.clone(),
        device_name: Some(vars.install_media_disk_name.clone()),
        ..Default::default()
      },
    }]),
  )?;

  let mut metadata = BTreeMap::from([(UPGRADE_SCRIPT_KEY.to_string(), UPGRADE_SCRIPT.to_string())]);
  let mut remove = Vec::new();
  if let Some(original) = &vars.original_startup_script_url {
    metadata.insert(STARTUP_SCRIPT_URL_BACKUP_KEY.to_string(), original.clone());
    remove.push(STARTUP_SCRIPT_URL_KEY.to_string());
  }
  wf.add_step(
    "set-upgrade-script",
    StepKind::UpdateInstanceMetadata(vec![MetadataUpdateDef {
      instance: instance.to_string(),
      metadata,
      remove,
    }]),
  )?;

  chain.extend([
    "backup-os-disk-snapshot",
    "create-new-os-disk",
    "detach-old-os-disk",
    "attach-new-os-disk",
    "create-install-media-disk",
    "attach-install-media-disk",
    "set-upgrade-script",
  ]);
  wf.add_sequence(&chain);
  Ok(wf)
}

/// Boot into the upgrade script and wait for it to finish.
pub fn upgrade_workflow(vars: &DerivedVars, timeout: Duration) -> Result<Workflow, WorkflowError> {
  let mut wf = Workflow::new("upgrade", &vars.project, &vars.zone);
  wf.add_step("start-instance", StepKind::StartInstances(vec![vars.instance_uri.clone()]))?;
  wf.add_step(
    "wait-for-upgrade-script",
    StepKind::WaitForInstancesSignal(vec![InstanceSignal::serial(
      &vars.instance_uri,
      SerialOutputSignal {
        port: PROGRESS_PORT,
        success_match: Some(STARTED_MATCH.to_string()),
        failure_match: Vec::new(),
        status_match: None,
      },
    )]),
  )?
  .timeout = Some(BOOT_TIMEOUT);
  wf.add_dependency("wait-for-upgrade-script", &["start-instance"]);
  add_wait_and_finish(&mut wf, vars, timeout, Some("wait-for-upgrade-script"))?;
  Ok(wf)
}

/// Wait again after a reboot; the script starts by itself.
pub fn retry_upgrade_workflow(vars: &DerivedVars, timeout: Duration) -> Result<Workflow, WorkflowError> {
  let mut wf = Workflow::new("upgrade-retry", &vars.project, &vars.zone);
  add_wait_and_finish(&mut wf, vars, timeout, None)?;
  Ok(wf)
}

pub fn reboot_workflow(vars: &DerivedVars) -> Result<Workflow, WorkflowError> {
  let mut wf = Workflow::new("upgrade-reboot", &vars.project, &vars.zone);
  wf.add_step("stop-instance", StepKind::StopInstances(vec![vars.instance_uri.clone()]))?;
  wf.add_step("start-instance", StepKind::StartInstances(vec![vars.instance_uri.clone()]))?;
  wf.add_sequence(&["stop-instance", "start-instance"]);
  Ok(wf)
}

// Race success on the result port against the failure markers on the
// progress port, then remove the install media and restore the user's
// startup script.
fn add_wait_and_finish(
  wf: &mut Workflow,
  vars: &DerivedVars,
  timeout: Duration,
  after: Option<&str>,
) -> Result<(), WorkflowError> {
  wf.add_step(
    "wait-for-upgrade",
    StepKind::WaitForAnySignal(vec![
      InstanceSignal::serial(
        &vars.instance_uri,
        SerialOutputSignal {
          port: RESULT_PORT,
          success_match: Some(success_marker(vars)),
          failure_match: Vec::new(),
          status_match: None,
        },
      ),
      InstanceSignal::serial(
        &vars.instance_uri,
        SerialOutputSignal {
          port: PROGRESS_PORT,
          success_match: None,
          failure_match: vec![
            REBOOT_REQUIRED_MATCH.to_string(),
            DISK_SPACE_MATCH.to_string(),
            FAILURE_MATCH.to_string(),
          ],
          status_match: Some(STATUS_MATCH.to_string()),
        },
      ),
    ]),
  )?
  .timeout = Some(timeout);
  if let Some(after) = after {
    wf.add_dependency("wait-for-upgrade", &[after]);
  }

  wf.add_step("stop-instance", StepKind::StopInstances(vec![vars.instance_uri.clone()]))?;
  wf.add_step(
    "detach-install-media-disk",
    StepKind::DetachDisks(vec![detach(vars, &vars.install_media_disk_name)]),
  )?;
  wf.add_step(
    "delete-install-media-disk",
    StepKind::DeleteResources(DeleteResourcesDef {
      disks: vec![vars.install_media_disk_name.clone()],
      ..Default::default()
    }),
  )?;
  wf.add_step("restore-startup-script", restore_startup_script(vars))?;
  wf.add_step(
    "start-upgraded-instance",
    StepKind::StartInstances(vec![vars.instance_uri.clone()]),
  )?;
  wf.add_sequence(&[
    "wait-for-upgrade",
    "stop-instance",
    "detach-install-media-disk",
    "delete-install-media-disk",
    "restore-startup-script",
    "start-upgraded-instance",
  ]);
  Ok(())
}

/// Put the original OS disk back and delete what the upgrade created.
/// The instance is left stopped.
pub fn rollback_workflow(vars: &DerivedVars, live: &LiveState) -> Result<Workflow, WorkflowError> {
  let mut wf = Workflow::new("upgrade-rollback", &vars.project, &vars.zone);
  let mut chain = vec!["stop-instance"];
  wf.add_step("stop-instance", StepKind::StopInstances(vec![vars.instance_uri.clone()]))?;

  if live.new_os_disk_attached(vars) {
    wf.add_step(
      "detach-new-os-disk",
      StepKind::DetachDisks(vec![detach(vars, &vars.os_disk_device_name)]),
    )?;
    chain.push("detach-new-os-disk");
  }
  if !live.original_os_disk_attached {
    wf.add_step("attach-old-os-disk", reattach_original(vars))?;
    chain.push("attach-old-os-disk");
  }
  if live.install_media_attached {
    wf.add_step(
      "detach-install-media-disk",
      StepKind::DetachDisks(vec![detach(vars, &vars.install_media_disk_name)]),
    )?;
    chain.push("detach-install-media-disk");
  }
  wf.add_step("restore-startup-script", restore_startup_script(vars))?;
  chain.push("restore-startup-script");

  let mut delete = DeleteResourcesDef::default();
  if live.new_os_disk_exists {
    delete.disks.push(vars.new_os_disk_name.clone());
  }
  if live.install_media_exists {
    delete.disks.push(vars.install_media_disk_name.clone());
  }
  if !delete.is_empty() {
    wf.add_step("delete-upgrade-disks", StepKind::DeleteResources(delete))?;
    chain.push("delete-upgrade-disks");
  }

  wf.add_sequence(&chain);
  Ok(wf)
}

/// Remove the install media and restore the startup script, leaving the
/// OS disk as it is. When the instance was left without a boot disk, the
/// original one is attached again.
pub fn cleanup_workflow(vars: &DerivedVars, live: &LiveState) -> Result<Workflow, WorkflowError> {
  let mut wf = Workflow::new("upgrade-cleanup", &vars.project, &vars.zone);
  let mut chain = Vec::new();

  if live.install_media_attached || live.boot_disk.is_none() {
    wf.add_step("stop-instance", StepKind::StopInstances(vec![vars.instance_uri.clone()]))?;
    chain.push("stop-instance");
  }
  if live.install_media_attached {
    wf.add_step(
      "detach-install-media-disk",
      StepKind::DetachDisks(vec![detach(vars, &vars.install_media_disk_name)]),
    )?;
    chain.push("detach-install-media-disk");
  }
  if live.boot_disk.is_none() && !live.original_os_disk_attached {
    wf.add_step("attach-old-os-disk", reattach_original(vars))?;
    chain.push("attach-old-os-disk");
  }
  wf.add_step("restore-startup-script", restore_startup_script(vars))?;
  chain.push("restore-startup-script");

  let mut delete = DeleteResourcesDef::default();
  if live.install_media_exists {
    delete.disks.push(vars.install_media_disk_name.clone());
  }
  // Only an unused copy; an attached one may hold a half-upgraded system
  // the user wants to look at.
  if live.new_os_disk_exists && !live.new_os_disk_attached(vars) {
    delete.disks.push(vars.new_os_disk_name.clone());
  }
  if !delete.is_empty() {
    wf.add_step("delete-upgrade-disks", StepKind::DeleteResources(delete))?;
    chain.push("delete-upgrade-disks");
  }

  wf.add_sequence(&chain);
  Ok(wf)
}

async fn disk_exists(compute: &dyn ComputeClient, vars: &DerivedVars, name: &str) -> bool {
  compute.get_disk(&vars.project, &vars.zone, name).await.is_ok()
}

fn success_marker(vars: &DerivedVars) -> String {
  crate::args::UPGRADE_PATHS
    .iter()
    .find(|p| p.upgraded_license == vars.upgraded_license)
    .map(|p| p.success_marker)
    .unwrap_or(crate::args::UPGRADE_PATHS[0].success_marker)
    .to_string()
}

fn detach(vars: &DerivedVars, device_name: &str) -> DetachDiskDef {
  DetachDiskDef {
    instance: vars.instance_uri.clone(),
    device_name: device_name.to_string(),
  }
}

fn reattach_original(vars: &DerivedVars) -> StepKind {
  StepKind::AttachDisks(vec![AttachDiskDef {
    instance: vars.instance_uri.clone(),
    attached_disk: AttachedDisk {
      source: vars.os_disk_uri.clone(),
      device_name: Some(vars.os_disk_device_name.clone()),
      boot: true,
      auto_delete: vars.os_disk_auto_delete,
      ..Default::default()
    },
  }])
}

fn restore_startup_script(vars: &DerivedVars) -> StepKind {
  let mut metadata = BTreeMap::new();
  if let Some(original) = &vars.original_startup_script_url {
    metadata.insert(STARTUP_SCRIPT_URL_KEY.to_string(), original.clone());
  }
  StepKind::UpdateInstanceMetadata(vec![MetadataUpdateDef {
    instance: vars.instance_uri.clone(),
    metadata,
    remove: vec![
      UPGRADE_SCRIPT_KEY.to_string(),
      STARTUP_SCRIPT_URL_BACKUP_KEY.to_string(),
    ],
  }])
}

#[cfg(test)]
mod tests {
  use super::*;

  fn vars() -> DerivedVars {
    DerivedVars {
      project: "p".to_string(),
      zone: "z".to_string(),
      instance_name: "win".to_string(),
      instance_uri: "projects/p/zones/z/instances/win".to_string(),
      os_disk_uri: "projects/p/zones/z/disks/win-boot".to_string(),
      os_disk_name: "win-boot".to_string(),
      os_disk_type: Some("pd-ssd".to_string()),
      os_disk_device_name: "persistent-disk-0".to_string(),
      os_disk_auto_delete: true,
      machine_image_backup_name: Some("win-backup-s".to_string()),
      snapshot_name: "win-boot-snapshot-s".to_string(),
      new_os_disk_name: "win-boot-windows-2012r2-s".to_string(),
      install_media_disk_name: "windows-install-media-s".to_string(),
      upgraded_license: crate::args::UPGRADE_PATHS[0].upgraded_license.to_string(),
      install_media_image: "media".to_string(),
      original_startup_script_url: Some("gs://b/user.ps1".to_string()),
    }
  }

  #[test]
  fn test_prepare_order() {
    let wf = prepare_workflow(&vars()).unwrap();
    let order = vmport_workflow::Graph::new(wf.steps.keys(), &wf.dependencies)
      .topological_order()
      .unwrap();
    assert_eq!(
      order,
      vec![
        "stop-instance",
        "backup-machine-image",
        "backup-os-disk-snapshot",
        "create-new-os-disk",
        "detach-old-os-disk",
        "attach-new-os-disk",
        "create-install-media-disk",
        "attach-install-media-disk",
        "set-upgrade-script",
      ]
    );

    let Some(StepKind::UpdateInstanceMetadata(updates)) =
      wf.get_step("set-upgrade-script").map(|s| &s.kind)
    else {
      panic!("expected metadata update");
    };
    assert_eq!(updates[0].metadata[STARTUP_SCRIPT_URL_BACKUP_KEY], "gs://b/user.ps1");
    assert!(updates[0].metadata[UPGRADE_SCRIPT_KEY].contains(STARTED_MATCH));
    assert_eq!(updates[0].remove, vec![STARTUP_SCRIPT_URL_KEY.to_string()]);
  }

  #[test]
  fn test_prepare_without_backup() {
    let vars = DerivedVars {
      machine_image_backup_name: None,
      ..vars()
    };
    let wf = prepare_workflow(&vars).unwrap();
    assert!(wf.get_step("backup-machine-image").is_none());
    assert_eq!(
      wf.dependencies.get("backup-os-disk-snapshot").unwrap(),
      &vec!["stop-instance".to_string()]
    );
  }

  #[test]
  fn test_retry_skips_start() {
    let upgrade = upgrade_workflow(&vars(), Duration::from_secs(60)).unwrap();
    assert!(upgrade.get_step("start-instance").is_some());
    assert_eq!(
      upgrade.get_step("wait-for-upgrade").unwrap().timeout,
      Some(Duration::from_secs(60))
    );

    let retry = retry_upgrade_workflow(&vars(), Duration::from_secs(60)).unwrap();
    assert!(retry.get_step("start-instance").is_none());
    assert!(retry.get_step("wait-for-upgrade-script").is_none());
    assert!(!retry.dependencies.contains_key("wait-for-upgrade"));
  }

  #[test]
  fn test_rollback_swaps_disks_back() {
    let vars = vars();
    let live = LiveState {
      boot_disk: Some(vars.new_os_disk_name.clone()),
      install_media_attached: true,
      install_media_exists: true,
      new_os_disk_exists: true,
      original_os_disk_attached: false,
    };
    let wf = rollback_workflow(&vars, &live).unwrap();
    let Some(StepKind::AttachDisks(attach)) = wf.get_step("attach-old-os-disk").map(|s| &s.kind)
    else {
      panic!("expected attach");
    };
    let disk = &attach[0].attached_disk;
    assert_eq!(disk.source, vars.os_disk_uri);
    assert_eq!(disk.device_name.as_deref(), Some("persistent-disk-0"));
    assert!(disk.boot && disk.auto_delete);

    let Some(StepKind::DeleteResources(delete)) =
      wf.get_step("delete-upgrade-disks").map(|s| &s.kind)
    else {
      panic!("expected delete");
    };
    assert_eq!(
      delete.disks,
      vec![vars.new_os_disk_name.clone(), vars.install_media_disk_name.clone()]
    );
  }

  #[test]
  fn test_cleanup_keeps_attached_new_disk() {
    let vars = vars();
    let live = LiveState {
      boot_disk: Some(vars.new_os_disk_name.clone()),
      install_media_attached: false,
      install_media_exists: false,
      new_os_disk_exists: true,
      original_os_disk_attached: false,
    };
    let wf = cleanup_workflow(&vars, &live).unwrap();
    assert_eq!(wf.steps.len(), 1);
    assert!(wf.get_step("restore-startup-script").is_some());
  }

  #[test]
  fn test_cleanup_reattaches_missing_boot_disk() {
    let vars = vars();
    let live = LiveState {
      boot_disk: None,
      new_os_disk_exists: true,
      ..Default::default()
    };
    let wf = cleanup_workflow(&vars, &live).unwrap();
    assert!(wf.get_step("attach-old-os-disk").is_some());
    let Some(StepKind::DeleteResources(delete)) =
      wf.get_step("delete-upgrade-disks").map(|s| &s.kind)
    else {
      panic!("expected delete");
    };
    assert_eq!(delete.disks, vec![vars.new_os_disk_name.clone()]);
  }
}
