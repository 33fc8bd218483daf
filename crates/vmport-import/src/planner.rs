//! Deciding what processing an inflated disk needs.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};
use vmport_compute::{GuestOsFeature, InspectionResult, Inspector, add_guest_os_feature};
use vmport_workflow_utils::os;

use crate::args::ImportArgs;
use crate::disk::PersistentDisk;
use crate::error::ImportError;

/// What the processors must do to a disk. Built once per import.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingPlan {
  pub required_licenses: Vec<String>,
  pub required_features: Vec<GuestOsFeature>,
  /// Translate workflow to run; `None` for data disks.
  pub translate_workflow: Option<PathBuf>,
  /// Supported OS id inspection found, if any.
  pub detected_os: Option<String>,
  /// OS the import targets, explicit or detected.
  pub os: Option<String>,
  pub uefi: bool,
  #[serde(skip)]
  pub inspection: Option<InspectionResult>,
}

impl ProcessingPlan {
  pub fn metadata_changes_required(&self) -> bool {
    !self.required_licenses.is_empty() || !self.required_features.is_empty()
  }
}

pub struct ProcessPlanner {
  args: Arc<ImportArgs>,
  inspector: Arc<dyn Inspector>,
}

impl ProcessPlanner {
  pub fn new(args: Arc<ImportArgs>, inspector: Arc<dyn Inspector>) -> Self {
    Self { args, inspector }
  }

  #[instrument(name = "plan", skip_all, fields(disk = %pd.uri))]
  pub async fn plan(&self, pd: &PersistentDisk) -> Result<ProcessingPlan, ImportError> {
    let args = &self.args;
    if let Some(custom) = &args.custom_workflow {
      info!(workflow = %custom.display(), "using custom translate workflow");
      return Ok(ProcessingPlan {
        translate_workflow: Some(custom.clone()),
        uefi: args.uefi_compatible,
        ..Default::default()
      });
    }

    let inspection = self.inspect(pd).await?;
    let detected_os = inspection
      .as_ref()
      .filter(|i| i.os_count == 1)
      .and_then(|i| i.os.as_ref())
      .and_then(os::from_detected)
      .map(str::to_string);
    let uefi = self.uefi(inspection.as_ref());

    if args.data_disk {
      let mut plan = ProcessingPlan {
        detected_os,
        uefi,
        inspection,
        ..Default::default()
      };
      if uefi {
        plan.required_features.push(GuestOsFeature::UefiCompatible);
      }
      return Ok(plan);
    }

    let os_id = match (&args.os, &detected_os) {
      (Some(requested), _) => requested.clone(),
      (None, Some(detected)) => {
        info!(os = %detected, "using detected operating system");
        detected.clone()
      }
      (None, None) => {
        return Err(ImportError::OsNotDetected {
          reason: describe_detection(inspection.as_ref()),
        });
      }
    };
    let info = os::lookup(&os_id)?;

    let mut required_features = Vec::new();
    if os::is_windows(&os_id) {
      add_guest_os_feature(&mut required_features, GuestOsFeature::Windows);
    }
    if uefi {
      add_guest_os_feature(&mut required_features, GuestOsFeature::UefiCompatible);
    }

    Ok(ProcessingPlan {
      required_licenses: vec![info.license.to_string()],
      required_features,
      translate_workflow: Some(args.workflow_dir.join(info.translate_workflow)),
      detected_os,
      os: Some(os_id),
      uefi,
      inspection,
    })
  }

  async fn inspect(&self, pd: &PersistentDisk) -> Result<Option<InspectionResult>, ImportError> {
    if !self.args.inspect {
      return Ok(None);
    }
    match self.inspector.inspect(&pd.uri, true).await {
      Ok(result) => {
        info!(
          os_count = result.os_count,
          uefi_bootable = result.uefi_bootable,
          bios_bootable = result.bios_bootable,
          "disk inspected"
        );
        Ok(Some(result))
      }
      // An explicit OS or a data disk does not depend on inspection.
      Err(e) if self.args.os.is_some() || self.args.data_disk => {
        warn!(error = %e, "disk inspection failed, continuing without it");
        Ok(None)
      }
      Err(source) => Err(ImportError::Inspection {
        disk: pd.uri.clone(),
        source,
      }),
    }
  }

  fn uefi(&self, inspection: Option<&InspectionResult>) -> bool {
    if self.args.uefi_compatible {
      return true;
    }
    match inspection {
      Some(result) if result.is_hybrid() => {
        info!("disk boots with both UEFI and BIOS, importing as BIOS");
        false
      }
      Some(result) => result.uefi_bootable,
      None => false,
    }
  }
}

fn describe_detection(inspection: Option<&InspectionResult>) -> String {
  match inspection {
    None => "inspection is disabled and no OS was specified".to_string(),
    Some(result) if result.os_count == 0 => "no operating system was found on the disk".to_string(),
    Some(result) if result.os_count > 1 => {
      format!("{} operating systems were found on the disk", result.os_count)
    }
    Some(result) => match &result.os {
      Some(detected) => format!(
        "{} {}.{} is not supported",
        detected.distro, detected.major_version, detected.minor_version
      ),
      None => "the operating system could not be identified".to_string(),
    },
  }
}
