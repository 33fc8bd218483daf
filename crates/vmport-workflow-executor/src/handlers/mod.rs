//! Step operation handlers.
//!
//! One handler per [`StepKind`]; `IncludeWorkflow` is run by the executor
//! itself. Handlers resolve bare resource names against the workflow's
//! project and zone and talk to the compute API through [`StepContext`].

mod create;
mod delete;
mod instance;
mod wait;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use vmport_compute::ComputeClient;
use vmport_compute::path::{GlobalResource, ZonalResource, resource_name};
use vmport_workflow::StepKind;

use crate::error::StepError;
use crate::events::ExecutionNotifier;
use crate::registry::ResourceRegistry;

/// State shared by every step of a run, including included workflows.
#[derive(Debug, Default)]
pub(crate) struct RunState {
  pub registry: ResourceRegistry,
  pub serial_values: Mutex<BTreeMap<String, String>>,
  pub trace_logs: Mutex<Vec<String>>,
}

pub(crate) struct StepContext {
  pub compute: Arc<dyn ComputeClient>,
  pub notifier: Arc<dyn ExecutionNotifier>,
  pub state: Arc<RunState>,
  pub workflow: String,
  pub step: String,
  pub project: String,
  pub zone: String,
  pub poll_interval: Duration,
  pub cancel: CancellationToken,
}

/// A zonal resource reference resolved against the workflow defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ZonalRef {
  pub project: String,
  pub zone: String,
  pub name: String,
}

impl StepContext {
  pub fn zonal(&self, reference: &str, collection: &str) -> ZonalRef {
    match ZonalResource::parse(reference, collection) {
      Some(r) => ZonalRef {
        project: r.project,
        zone: r.zone,
        name: r.name,
      },
      None => ZonalRef {
        project: self.project.clone(),
        zone: self.zone.clone(),
        name: resource_name(reference).to_string(),
      },
    }
  }

  pub fn global(&self, reference: &str, collection: &str) -> (String, String) {
    match GlobalResource::parse(reference, collection) {
      Some(r) => (r.project, r.name),
      None => (self.project.clone(), resource_name(reference).to_string()),
    }
  }
}

pub(crate) async fn run(ctx: &StepContext, kind: &StepKind) -> Result<(), StepError> {
  match kind {
    StepKind::CreateDisks(defs) => create::create_disks(ctx, defs).await,
    StepKind::CreateInstances(defs) => create::create_instances(ctx, defs).await,
    StepKind::CreateImages(defs) => create::create_images(ctx, defs).await,
    StepKind::CreateSnapshots(defs) => create::create_snapshots(ctx, defs).await,
    StepKind::CreateMachineImages(defs) => create::create_machine_images(ctx, defs).await,
    StepKind::AttachDisks(defs) => instance::attach_disks(ctx, defs).await,
    StepKind::DetachDisks(defs) => instance::detach_disks(ctx, defs).await,
    StepKind::StartInstances(names) => instance::start_instances(ctx, names).await,
    StepKind::StopInstances(names) => instance::stop_instances(ctx, names).await,
    StepKind::UpdateInstanceMetadata(defs) => instance::update_metadata(ctx, defs).await,
    StepKind::DeleteResources(def) => delete::delete_resources(ctx, def).await,
    StepKind::WaitForInstancesSignal(signals) => wait::wait_for_all(ctx, signals).await,
    StepKind::WaitForAnySignal(signals) => wait::wait_for_any(ctx, signals).await,
    // Run by the executor, which owns the nested scheduling loop.
    StepKind::IncludeWorkflow(_) => Ok(()),
  }
}
