//! Structural validation of a populated workflow.
//!
//! Runs before the executor dispatches anything, so a malformed graph never
//! touches a cloud resource.

use std::collections::BTreeMap;

use crate::error::WorkflowError;
use crate::resource::InstanceSignal;
use crate::step::{Step, StepKind};
use crate::workflow::Workflow;

const MAX_SERIAL_PORT: i64 = 4;

impl Workflow {
  /// Check dependencies, cycles and step contents, recursing into includes.
  pub fn validate(&self) -> Result<(), WorkflowError> {
    self.validate_dependencies()?;

    if let Some(cycle) = self.graph().find_cycle() {
      return Err(WorkflowError::CircularDependency {
        workflow: self.name.clone(),
        cycle,
      });
    }

    let mut created: BTreeMap<(&'static str, String), &str> = BTreeMap::new();
    for (name, step) in &self.steps {
      self.validate_step(name, step)?;
      for resource in created_names(step) {
        if let Some(other) = created.insert(resource.clone(), name) {
          return Err(self.invalid(
            name,
            format!("{} {} is also created by step '{}'", resource.0, resource.1, other),
          ));
        }
      }
    }

    for step in self.steps.values() {
      if let StepKind::IncludeWorkflow(include) = &step.kind {
        include.workflow.validate()?;
      }
    }
    Ok(())
  }

  fn validate_dependencies(&self) -> Result<(), WorkflowError> {
    for (step, prerequisites) in &self.dependencies {
      if !self.steps.contains_key(step) {
        return Err(WorkflowError::UnknownStep {
          workflow: self.name.clone(),
          step: step.clone(),
        });
      }
      for prerequisite in prerequisites {
        if !self.steps.contains_key(prerequisite) {
          return Err(WorkflowError::DanglingDependency {
            workflow: self.name.clone(),
            step: step.clone(),
            dependency: prerequisite.clone(),
          });
        }
      }
    }
    Ok(())
  }

  fn invalid(&self, step: &str, message: impl Into<String>) -> WorkflowError {
    WorkflowError::InvalidStep {
      workflow: self.name.clone(),
      step: step.to_string(),
      message: message.into(),
    }
  }

  fn validate_step(&self, name: &str, step: &Step) -> Result<(), WorkflowError> {
    if step.timeout.is_some_and(|t| t.is_zero()) {
      return Err(self.invalid(name, "timeout must be greater than zero"));
    }

    match &step.kind {
      StepKind::CreateDisks(disks) => {
        if disks.is_empty() {
          return Err(self.invalid(name, "must name at least one disk"));
        }
        for def in disks {
          if def.disk.name.is_empty() {
            return Err(self.invalid(name, "every disk needs a name"));
          }
          let sources = [
            &def.disk.source_image,
            &def.disk.source_disk,
            &def.disk.source_snapshot,
            &def.disk.source_storage_object,
          ];
          if sources.iter().filter(|s| s.is_some()).count() > 1 {
            return Err(self.invalid(
              name,
              format!("disk {} sets more than one source", def.disk.name),
            ));
          }
          if def.disk.size_gb.is_some_and(|s| s <= 0) {
            return Err(self.invalid(name, format!("disk {} has a non-positive size", def.disk.name)));
          }
        }
      }
      StepKind::CreateInstances(instances) => {
        if instances.is_empty() {
          return Err(self.invalid(name, "must name at least one instance"));
        }
        for def in instances {
          if def.instance.name.is_empty() {
            return Err(self.invalid(name, "every instance needs a name"));
          }
          if def.instance.disks.is_empty() {
            return Err(self.invalid(
              name,
              format!("instance {} has no disks", def.instance.name),
            ));
          }
          if def.instance.disks.iter().filter(|d| d.boot).count() > 1 {
            return Err(self.invalid(
              name,
              format!("instance {} has more than one boot disk", def.instance.name),
            ));
          }
          if def.instance.disks.iter().any(|d| d.source.is_empty()) {
            return Err(self.invalid(
              name,
              format!("instance {} attaches a disk without a source", def.instance.name),
            ));
          }
        }
      }
      StepKind::CreateImages(images) => {
        if images.is_empty() {
          return Err(self.invalid(name, "must name at least one image"));
        }
        for def in images {
          if def.image.name.is_empty() {
            return Err(self.invalid(name, "every image needs a name"));
          }
          match (&def.image.source_disk, &def.image.source_image) {
            (Some(_), None) | (None, Some(_)) => {}
            _ => {
              return Err(self.invalid(
                name,
                format!(
                  "image {} must set exactly one of sourceDisk or sourceImage",
                  def.image.name
                ),
              ));
            }
          }
        }
      }
      StepKind::AttachDisks(attachments) => {
        if attachments.is_empty() {
          return Err(self.invalid(name, "must name at least one disk to attach"));
        }
        for def in attachments {
          if def.instance.is_empty() || def.attached_disk.source.is_empty() {
            return Err(self.invalid(name, "attachments need an instance and a disk source"));
          }
        }
      }
      StepKind::DetachDisks(detachments) => {
        if detachments.is_empty() {
          return Err(self.invalid(name, "must name at least one disk to detach"));
        }
        for def in detachments {
          if def.instance.is_empty() || def.device_name.is_empty() {
            return Err(self.invalid(name, "detachments need an instance and a device name"));
          }
        }
      }
      StepKind::StartInstances(names) | StepKind::StopInstances(names) => {
        if names.is_empty() || names.iter().any(|n| n.is_empty()) {
          return Err(self.invalid(name, "must name at least one instance"));
        }
      }
      StepKind::DeleteResources(def) => {
        if def.is_empty() {
          return Err(self.invalid(name, "must name at least one resource"));
        }
      }
      StepKind::UpdateInstanceMetadata(updates) => {
        if updates.is_empty() {
          return Err(self.invalid(name, "must name at least one instance"));
        }
        for def in updates {
          if def.instance.is_empty() {
            return Err(self.invalid(name, "metadata updates need an instance"));
          }
          if def.metadata.is_empty() && def.remove.is_empty() {
            return Err(self.invalid(
              name,
              format!("metadata update for {} changes nothing", def.instance),
            ));
          }
        }
      }
      StepKind::WaitForInstancesSignal(signals) | StepKind::WaitForAnySignal(signals) => {
        if signals.is_empty() {
          return Err(self.invalid(name, "must wait for at least one instance"));
        }
        for signal in signals {
          self.validate_signal(name, signal)?;
        }
      }
      StepKind::IncludeWorkflow(include) => {
        if include.workflow.steps.is_empty() {
          return Err(self.invalid(name, "included workflow has no steps"));
        }
      }
      StepKind::CreateSnapshots(snapshots) => {
        if snapshots.is_empty() {
          return Err(self.invalid(name, "must name at least one snapshot"));
        }
        for def in snapshots {
          if def.snapshot.name.is_empty() || def.snapshot.source_disk.is_empty() {
            return Err(self.invalid(name, "snapshots need a name and a source disk"));
          }
        }
      }
      StepKind::CreateMachineImages(machine_images) => {
        if machine_images.is_empty() {
          return Err(self.invalid(name, "must name at least one machine image"));
        }
        for def in machine_images {
          if def.machine_image.name.is_empty() || def.machine_image.source_instance.is_empty() {
            return Err(self.invalid(
              name,
              "machine images need a name and a source instance",
            ));
          }
        }
      }
    }
    Ok(())
  }

  fn validate_signal(&self, name: &str, signal: &InstanceSignal) -> Result<(), WorkflowError> {
    if signal.name.is_empty() {
      return Err(self.invalid(name, "signals need an instance name"));
    }
    match &signal.serial_output {
      None if !signal.stopped => Err(self.invalid(
        name,
        format!("signal for {} waits for neither serial output nor stop", signal.name),
      )),
      Some(serial) => {
        if !(1..=MAX_SERIAL_PORT).contains(&serial.port) {
          return Err(self.invalid(
            name,
            format!("serial port {} is out of range 1-{}", serial.port, MAX_SERIAL_PORT),
          ));
        }
        if serial.success_match.is_none() && serial.failure_match.is_empty() {
          return Err(self.invalid(
            name,
            format!("serial signal for {} has no success or failure match", signal.name),
          ));
        }
        Ok(())
      }
      None => Ok(()),
    }
  }
}

/// Resources created by a step, keyed by kind and name.
fn created_names(step: &Step) -> Vec<(&'static str, String)> {
  match &step.kind {
    StepKind::CreateDisks(disks) => disks
      .iter()
      .map(|d| ("disk", format!("{}/{}", d.zone.as_deref().unwrap_or(""), d.disk.name)))
      .collect(),
    StepKind::CreateInstances(instances) => instances
      .iter()
      .map(|i| {
        (
          "instance",
          format!("{}/{}", i.zone.as_deref().unwrap_or(""), i.instance.name),
        )
      })
      .collect(),
    StepKind::CreateImages(images) => images
      .iter()
      .map(|i| ("image", i.image.name.clone()))
      .collect(),
    _ => Vec::new(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::resource::{DiskDef, ImageDef, ImageKind, SerialOutputSignal};
  use vmport_compute::{Disk, Image};

  fn disk_step(name: &str) -> StepKind {
    StepKind::CreateDisks(vec![DiskDef::new(Disk {
      name: name.to_string(),
      ..Default::default()
    })])
  }

  #[test]
  fn test_dangling_dependency() {
    let mut wf = Workflow::new("wf", "p", "z");
    wf.add_step("a", disk_step("d1")).unwrap();
    wf.add_dependency("a", &["missing"]);
    let err = wf.validate().unwrap_err();
    assert!(matches!(err, WorkflowError::DanglingDependency { ref dependency, .. } if dependency == "missing"));
  }

  #[test]
  fn test_unknown_step_in_dependencies() {
    let mut wf = Workflow::new("wf", "p", "z");
    wf.add_step("a", disk_step("d1")).unwrap();
    wf.add_dependency("ghost", &["a"]);
    assert!(matches!(wf.validate(), Err(WorkflowError::UnknownStep { .. })));
  }

  #[test]
  fn test_circular_dependency() {
    let mut wf = Workflow::new("wf", "p", "z");
    wf.add_step("a", disk_step("d1")).unwrap();
    wf.add_step("b", disk_step("d2")).unwrap();
    wf.add_dependency("a", &["b"]);
    wf.add_dependency("b", &["a"]);
    let err = wf.validate().unwrap_err();
    assert!(err.to_string().contains("circular dependency"));
  }

  #[test]
  fn test_empty_create_disks_rejected() {
    let mut wf = Workflow::new("wf", "p", "z");
    wf.add_step("a", StepKind::CreateDisks(vec![])).unwrap();
    let err = wf.validate().unwrap_err();
    assert!(err.to_string().contains("at least one disk"));
  }

  #[test]
  fn test_image_needs_one_source() {
    let mut wf = Workflow::new("wf", "p", "z");
    wf.add_step(
      "img",
      StepKind::CreateImages(vec![ImageDef::new(
        Image {
          name: "i".to_string(),
          ..Default::default()
        },
        ImageKind::Final,
      )]),
    )
    .unwrap();
    assert!(matches!(wf.validate(), Err(WorkflowError::InvalidStep { .. })));
  }

  #[test]
  fn test_duplicate_created_disk() {
    let mut wf = Workflow::new("wf", "p", "z");
    wf.add_step("a", disk_step("d1")).unwrap();
    wf.add_step("b", disk_step("d1")).unwrap();
    let err = wf.validate().unwrap_err();
    assert!(err.to_string().contains("also created by step 'a'"));
  }

  #[test]
  fn test_signal_port_range() {
    let mut wf = Workflow::new("wf", "p", "z");
    wf.add_step(
      "wait",
      StepKind::WaitForInstancesSignal(vec![InstanceSignal::serial(
        "vm",
        SerialOutputSignal {
          port: 9,
          success_match: Some("ok".to_string()),
          ..Default::default()
        },
      )]),
    )
    .unwrap();
    assert!(wf.validate().unwrap_err().to_string().contains("out of range"));
  }
}
