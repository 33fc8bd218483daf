//! vmport Workflow
//!
//! The workflow graph model shared by every vmport pipeline. A [`Workflow`]
//! is a named DAG of [`Step`]s; each step carries exactly one [`StepKind`]
//! operation and the graph records step -> prerequisite dependencies.
//!
//! Workflows are either built in code (inflation, export, upgrade phases) or
//! loaded from JSON workflow files with [`load_workflow`] (OS translation).
//! [`Workflow::validate`] rejects dangling dependencies, cycles and malformed
//! steps before anything runs.

mod error;
mod graph;
mod loader;
mod resource;
mod step;
mod validate;
mod workflow;

pub use error::WorkflowError;
pub use graph::Graph;
pub use loader::{LoadOptions, load_workflow, parse_duration};
pub use resource::{
  AttachDiskDef, DeleteResourcesDef, DetachDiskDef, DiskDef, ImageDef, ImageKind, InstanceDef,
  InstanceSignal, MachineImageDef, MetadataUpdateDef, SerialOutputSignal, SnapshotDef,
  UNTRANSLATED_IMAGE_MARKER,
};
pub use step::{IncludeWorkflow, Step, StepKind};
pub use workflow::{DEFAULT_TIMEOUT, Workflow};
