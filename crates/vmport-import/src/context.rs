//! Everything the import stages share.

use std::sync::Arc;

use tracing::{info, warn};

use vmport_compute::Clients;
use vmport_compute::path::ZonalResource;
use vmport_workflow::Workflow;
use vmport_workflow_executor::{ExecutionNotifier, ExecutorConfig, NoopNotifier, WorkflowExecutor};
use vmport_workflow_utils::{NetworkSettings, ResourceLabeler, apply_no_external_ip};

use crate::args::ImportArgs;

#[derive(Clone)]
pub struct ImportContext {
  pub args: Arc<ImportArgs>,
  pub clients: Clients,
  pub executor_config: ExecutorConfig,
  pub notifier: Arc<dyn ExecutionNotifier>,
}

impl ImportContext {
  pub fn new(args: ImportArgs, clients: Clients) -> Self {
    Self {
      args: Arc::new(args),
      clients,
      executor_config: ExecutorConfig::default(),
      notifier: Arc::new(NoopNotifier),
    }
  }

  pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
    self.executor_config = config;
    self
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub(crate) fn executor(&self) -> WorkflowExecutor {
    WorkflowExecutor::new(self.clients.compute.clone(), self.executor_config.clone())
      .with_notifier(self.notifier.clone())
  }

  /// An empty workflow in the import's project and zone.
  pub(crate) fn new_workflow(&self, name: &str) -> Workflow {
    let mut workflow = Workflow::new(name, &self.args.project, &self.args.zone);
    workflow.default_timeout = self.args.timeout;
    workflow
  }

  pub(crate) fn labeler(&self) -> ResourceLabeler {
    ResourceLabeler::for_import(&self.args.build_id, self.args.labels.clone())
      .with_image_location(self.args.storage_location.clone())
  }

  /// Labels, network settings and external IP policy applied to every
  /// workflow the import runs.
  pub(crate) fn populate(&self, workflow: &mut Workflow) {
    self.labeler().label_resources(workflow);
    NetworkSettings::new(self.args.network.clone(), self.args.subnet.clone())
      .resolve(&self.args.project, &self.args.zone)
      .apply(workflow);
    if self.args.no_external_ip {
      apply_no_external_ip(workflow);
    }
  }

  /// Best-effort deletion of a pipeline-owned disk. Failures are logged.
  pub(crate) async fn delete_disk(&self, uri: &str) {
    let Some(disk) = ZonalResource::parse(uri, "disks") else {
      warn!(disk = %uri, "not a disk URI, skipping deletion");
      return;
    };
    match self
      .clients
      .compute
      .delete_disk(&disk.project, &disk.zone, &disk.name)
      .await
    {
      Ok(()) => info!(disk = %uri, "deleted disk"),
      Err(e) if e.is_not_found() => {}
      Err(e) => warn!(disk = %uri, error = %e, "failed to delete disk"),
    }
  }
}
