use std::sync::Arc;

use async_trait::async_trait;

use super::Processor;
use crate::disk::PersistentDisk;
use crate::error::ImportError;
use crate::planner::ProcessingPlan;

/// Copies the planner's boot mode findings onto the disk handle.
pub struct InspectionProcessor {
  enabled: bool,
  plan: Arc<ProcessingPlan>,
}

impl InspectionProcessor {
  pub fn new(enabled: bool, plan: Arc<ProcessingPlan>) -> Self {
    Self { enabled, plan }
  }
}

#[async_trait]
impl Processor for InspectionProcessor {
  async fn process(&self, mut pd: PersistentDisk) -> Result<PersistentDisk, ImportError> {
    if !self.enabled {
      return Ok(pd);
    }
    if let Some(inspection) = &self.plan.inspection {
      pd.is_uefi_detected = inspection.uefi_bootable;
    }
    pd.is_uefi_compatible = self.plan.uefi;
    Ok(pd)
  }

  fn cancel(&self, _reason: &str) -> bool {
    false
  }

  fn trace_logs(&self) -> Vec<String> {
    Vec::new()
  }
}
