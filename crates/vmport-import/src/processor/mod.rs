//! The processor chain run between inflation and finishing.
//!
//! Bootable imports run inspection, then the metadata processor when the
//! plan needs licenses or guest OS features the disk lacks, then OS
//! translation. Data disks only run inspection.

mod bootable;
mod inspection;
mod metadata;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use bootable::BootableDiskProcessor;
pub use inspection::InspectionProcessor;
pub use metadata::MetadataProcessor;

use crate::context::ImportContext;
use crate::disk::PersistentDisk;
use crate::error::ImportError;
use crate::planner::ProcessingPlan;

#[async_trait]
pub trait Processor: Send + Sync {
  /// Process `pd`, returning the (possibly replaced) disk.
  async fn process(&self, pd: PersistentDisk) -> Result<PersistentDisk, ImportError>;

  /// Request cancellation. Returns `false` when there is nothing to cancel.
  fn cancel(&self, reason: &str) -> bool;

  fn trace_logs(&self) -> Vec<String>;
}

/// Build the processors `plan` calls for, in the order they run.
pub fn build_chain(
  ctx: &ImportContext,
  plan: &Arc<ProcessingPlan>,
  cancel: &CancellationToken,
) -> Vec<Arc<dyn Processor>> {
  let mut chain: Vec<Arc<dyn Processor>> = vec![Arc::new(InspectionProcessor::new(
    ctx.args.inspect,
    plan.clone(),
  ))];
  if ctx.args.data_disk {
    return chain;
  }
  if plan.metadata_changes_required() {
    chain.push(Arc::new(MetadataProcessor::new(ctx.clone(), plan.clone())));
  }
  chain.push(Arc::new(BootableDiskProcessor::new(
    ctx.clone(),
    plan.clone(),
    cancel,
  )));
  chain
}
