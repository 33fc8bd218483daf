use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::resource::{
  AttachDiskDef, DeleteResourcesDef, DetachDiskDef, DiskDef, ImageDef, InstanceDef,
  InstanceSignal, MachineImageDef, MetadataUpdateDef, SnapshotDef,
};
use crate::workflow::Workflow;

/// One node of a workflow graph.
#[derive(Debug, Clone)]
pub struct Step {
  /// Overrides the workflow's default timeout.
  pub timeout: Option<Duration>,
  pub kind: StepKind,
}

impl Step {
  pub fn new(kind: StepKind) -> Self {
    Self {
      timeout: None,
      kind,
    }
  }
}

/// A nested workflow run as a single step.
#[derive(Debug, Clone)]
pub struct IncludeWorkflow {
  /// File the workflow was loaded from, if any.
  pub path: Option<PathBuf>,
  pub workflow: Box<Workflow>,
}

#[derive(Debug, Clone)]
pub enum StepKind {
  CreateInstances(Vec<InstanceDef>),
  CreateDisks(Vec<DiskDef>),
  CreateImages(Vec<ImageDef>),
  AttachDisks(Vec<AttachDiskDef>),
  DetachDisks(Vec<DetachDiskDef>),
  StartInstances(Vec<String>),
  StopInstances(Vec<String>),
  DeleteResources(DeleteResourcesDef),
  UpdateInstanceMetadata(Vec<MetadataUpdateDef>),
  /// Completes when every listed instance signals success.
  WaitForInstancesSignal(Vec<InstanceSignal>),
  /// Completes when any listed instance signals success.
  WaitForAnySignal(Vec<InstanceSignal>),
  IncludeWorkflow(IncludeWorkflow),
  CreateSnapshots(Vec<SnapshotDef>),
  CreateMachineImages(Vec<MachineImageDef>),
}

impl StepKind {
  /// The file-format field name of this kind.
  pub fn name(&self) -> &'static str {
    match self {
      Self::CreateInstances(_) => "createInstances",
      Self::CreateDisks(_) => "createDisks",
      Self::CreateImages(_) => "createImages",
      Self::AttachDisks(_) => "attachDisks",
      Self::DetachDisks(_) => "detachDisks",
      Self::StartInstances(_) => "startInstances",
      Self::StopInstances(_) => "stopInstances",
      Self::DeleteResources(_) => "deleteResources",
      Self::UpdateInstanceMetadata(_) => "updateInstanceMetadata",
      Self::WaitForInstancesSignal(_) => "waitForInstancesSignal",
      Self::WaitForAnySignal(_) => "waitForAnySignal",
      Self::IncludeWorkflow(_) => "includeWorkflow",
      Self::CreateSnapshots(_) => "createSnapshots",
      Self::CreateMachineImages(_) => "createMachineImages",
    }
  }
}

impl fmt::Display for StepKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}
