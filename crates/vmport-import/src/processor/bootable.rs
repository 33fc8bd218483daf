use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use vmport_compute::{GuestOsFeature, add_guest_os_feature};
use vmport_workflow::{ImageKind, LoadOptions, StepKind, Workflow, load_workflow};
use vmport_workflow_executor::ExecutionError;
use vmport_workflow_utils::PrivacyFilterNotifier;

use super::Processor;
use crate::cancel::StageCancel;
use crate::context::ImportContext;
use crate::disk::PersistentDisk;
use crate::error::ImportError;
use crate::planner::ProcessingPlan;

const STAGE: &str = "translation";

/// Runs the OS translate workflow, which makes the disk bootable on the
/// platform and creates the final image from it.
pub struct BootableDiskProcessor {
  ctx: ImportContext,
  plan: Arc<ProcessingPlan>,
  cancel: StageCancel,
  trace_logs: Mutex<Vec<String>>,
}

impl BootableDiskProcessor {
  pub fn new(ctx: ImportContext, plan: Arc<ProcessingPlan>, parent: &CancellationToken) -> Self {
    Self {
      ctx,
      plan,
      cancel: StageCancel::child_of(parent),
      trace_logs: Mutex::new(Vec::new()),
    }
  }

  fn vars(&self, pd: &PersistentDisk) -> BTreeMap<String, String> {
    let args = &self.ctx.args;
    BTreeMap::from([
      ("source_disk".to_string(), pd.uri.clone()),
      ("image_name".to_string(), args.image_name.clone()),
      ("family".to_string(), args.family.clone().unwrap_or_default()),
      ("description".to_string(), args.description.clone().unwrap_or_default()),
      ("install_gce_packages".to_string(), "true".to_string()),
      ("is_uefi".to_string(), self.plan.uefi.to_string()),
    ])
  }

  pub(crate) fn load(&self, path: &Path, pd: &PersistentDisk) -> Result<Workflow, ImportError> {
    let options = LoadOptions {
      project: Some(self.ctx.args.project.clone()),
      zone: Some(self.ctx.args.zone.clone()),
      vars: self.vars(pd),
      ignore_unknown_vars: true,
    };
    let mut workflow = load_workflow(path, &options).map_err(|source| ImportError::LoadWorkflow {
      path: path.to_path_buf(),
      source,
    })?;
    self.apply_image_settings(&mut workflow);
    self.ctx.populate(&mut workflow);
    Ok(workflow)
  }

  /// Carry the user's image settings and the plan's licenses and features
  /// onto every final image the workflow creates.
  fn apply_image_settings(&self, workflow: &mut Workflow) {
    let args = &self.ctx.args;
    let plan = &self.plan;
    workflow.visit_steps_mut(&mut |step| {
      let StepKind::CreateImages(defs) = &mut step.kind else {
        return;
      };
      for def in defs.iter_mut() {
        if def.effective_kind() != ImageKind::Final {
          continue;
        }
        def.kind = Some(ImageKind::Final);
        def.no_cleanup = true;
        let image = &mut def.image;
        if let Some(family) = args.family.as_ref().filter(|f| !f.is_empty()) {
          image.family = Some(family.clone());
        }
        if let Some(description) = args.description.as_ref().filter(|d| !d.is_empty()) {
          image.description = Some(description.clone());
        }
        for license in &plan.required_licenses {
          if !image.licenses.contains(license) {
            image.licenses.push(license.clone());
          }
        }
        for feature in &plan.required_features {
          add_guest_os_feature(&mut image.guest_os_features, *feature);
        }
        if plan.uefi {
          add_guest_os_feature(&mut image.guest_os_features, GuestOsFeature::UefiCompatible);
        }
      }
    });
  }

  fn map_error(&self, source: ExecutionError) -> ImportError {
    if source.is_cancelled() || self.cancel.is_cancelled() {
      return self.cancel.error();
    }
    match (&self.plan.detected_os, &self.plan.os) {
      (Some(detected), Some(requested)) if detected != requested => ImportError::OsMismatch {
        detected: detected.clone(),
        requested: requested.clone(),
        source,
      },
      _ => ImportError::Workflow {
        stage: STAGE,
        source,
      },
    }
  }
}

#[async_trait]
impl Processor for BootableDiskProcessor {
  #[instrument(name = "translate", skip_all, fields(disk = %pd.uri))]
  async fn process(&self, pd: PersistentDisk) -> Result<PersistentDisk, ImportError> {
    let Some(path) = &self.plan.translate_workflow else {
      return Err(ImportError::invalid("no translate workflow was planned"));
    };
    let workflow = self.load(path, &pd)?;
    info!(workflow = %workflow.name, path = %path.display(), "translating disk");

    let privacy = Arc::new(PrivacyFilterNotifier::new(self.ctx.notifier.clone()));
    let result = self
      .ctx
      .executor()
      .with_notifier(privacy.clone())
      .run(&workflow, self.cancel.token())
      .await;
    self.trace_logs.lock().unwrap().extend(privacy.trace_logs());

    match result {
      Ok(_) => Ok(pd),
      Err(e) => {
        let err = self.map_error(e);
        warn!(error = %err, "translation failed");
        Err(err)
      }
    }
  }

  fn cancel(&self, reason: &str) -> bool {
    self.cancel.cancel(reason);
    true
  }

  fn trace_logs(&self) -> Vec<String> {
    self.trace_logs.lock().unwrap().clone()
  }
}
