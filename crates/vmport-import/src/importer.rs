//! The import pipeline: inflate, plan, process, finish.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::cancel::StageCancel;
use crate::context::ImportContext;
use crate::disk::PersistentDisk;
use crate::error::ImportError;
use crate::finisher::{Finisher, create_finisher};
use crate::inflater::{Inflater, create_inflater};
use crate::planner::{ProcessPlanner, ProcessingPlan};
use crate::processor::{Processor, build_chain};

/// What a successful import produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
  pub image_uri: String,
  /// The disk the image was created from. It no longer exists.
  pub disk: PersistentDisk,
  pub plan: ProcessingPlan,
  pub trace_logs: Vec<String>,
}

/// The stage a cancel request goes to.
#[derive(Clone)]
enum Stage {
  Inflate(Arc<dyn Inflater>),
  Process(Arc<dyn Processor>),
  Finish(Arc<dyn Finisher>),
}

impl Stage {
  fn cancel(&self, reason: &str) -> bool {
    match self {
      Self::Inflate(inflater) => inflater.cancel(reason),
      Self::Process(processor) => processor.cancel(reason),
      Self::Finish(finisher) => finisher.cancel(reason),
    }
  }
}

pub struct Importer {
  ctx: ImportContext,
  cancel: StageCancel,
  active: Mutex<Option<Stage>>,
  trace_logs: Mutex<Vec<String>>,
}

impl Importer {
  pub fn new(ctx: ImportContext) -> Self {
    Self::with_parent(ctx, &CancellationToken::new())
  }

  /// An importer that also stops when `parent` is cancelled.
  pub fn with_parent(ctx: ImportContext, parent: &CancellationToken) -> Self {
    Self {
      ctx,
      cancel: StageCancel::child_of(parent),
      active: Mutex::new(None),
      trace_logs: Mutex::new(Vec::new()),
    }
  }

  /// Stop the running stage. Non-blocking; resources created so far are
  /// still cleaned up before `run` returns.
  ///
  /// Returns `false`, and cancels nothing, when the running stage cannot be
  /// interrupted right now.
  pub fn cancel(&self, reason: &str) -> bool {
    let active = self.active.lock().unwrap().clone();
    if let Some(stage) = active {
      if !stage.cancel(reason) {
        info!(reason, "running stage cannot be cancelled now");
        return false;
      }
    }
    self.cancel.cancel(reason);
    true
  }

  /// Serial status lines collected from every stage so far.
  pub fn trace_logs(&self) -> Vec<String> {
    self.trace_logs.lock().unwrap().clone()
  }

  #[instrument(
    name = "import",
    skip_all,
    fields(image = %self.ctx.args.image_name, build_id = %self.ctx.args.build_id)
  )]
  pub async fn run(&self) -> Result<ImportOutcome, ImportError> {
    self.ctx.args.validate()?;
    let timeout = self.ctx.args.timeout;

    let stages = self.run_stages();
    tokio::pin!(stages);
    let result = tokio::select! {
      result = &mut stages => result,
      _ = tokio::time::sleep(timeout) => {
        self.cancel.cancel("import timed out");
        // Let the stages unwind and clean up.
        let _ = stages.await;
        Err(ImportError::Timeout { timeout })
      }
    };

    match result {
      Ok(outcome) => {
        info!(image = %outcome.image_uri, "import finished");
        Ok(outcome)
      }
      Err(e) if self.cancel.is_cancelled() && !matches!(e, ImportError::Timeout { .. }) => {
        Err(self.cancel.error())
      }
      Err(e) => {
        error!(error = %e, "import failed");
        Err(e)
      }
    }
  }

  async fn run_stages(&self) -> Result<ImportOutcome, ImportError> {
    let token = self.cancel.token();
    let inflater: Arc<dyn Inflater> = Arc::from(create_inflater(&self.ctx, &token));
    self.enter(Stage::Inflate(inflater.clone()));
    let inflated = inflater.inflate().await;
    self.leave();
    self.record(inflater.trace_logs());
    let mut pd = inflated?;

    let result = self.process(&mut pd, &token).await;
    // The disk only existed to build the image.
    self.ctx.delete_disk(&pd.uri).await;
    let (image_uri, plan) = result?;

    Ok(ImportOutcome {
      image_uri,
      disk: pd,
      plan,
      trace_logs: self.trace_logs(),
    })
  }

  /// Plan, run the processor chain and finish. `pd` always names the
  /// current working disk, even on error.
  async fn process(
    &self,
    pd: &mut PersistentDisk,
    token: &CancellationToken,
  ) -> Result<(String, ProcessingPlan), ImportError> {
    let planner = ProcessPlanner::new(self.ctx.args.clone(), self.ctx.clients.inspector.clone());
    let plan = Arc::new(planner.plan(pd).await?);
    info!(
      os = plan.os.as_deref().unwrap_or("none"),
      uefi = plan.uefi,
      metadata_changes = plan.metadata_changes_required(),
      "processing plan ready"
    );

    for processor in build_chain(&self.ctx, &plan, token) {
      if token.is_cancelled() {
        return Err(self.cancel.error());
      }
      self.enter(Stage::Process(processor.clone()));
      let processed = processor.process(pd.clone()).await;
      self.leave();
      self.record(processor.trace_logs());
      *pd = processed?;
    }

    if token.is_cancelled() {
      return Err(self.cancel.error());
    }
    let finisher: Arc<dyn Finisher> = Arc::from(create_finisher(&self.ctx, &plan));
    self.enter(Stage::Finish(finisher.clone()));
    let finished = finisher.finish(pd).await;
    self.leave();
    self.record(finisher.trace_logs());
    Ok((finished?, (*plan).clone()))
  }

  fn enter(&self, stage: Stage) {
    *self.active.lock().unwrap() = Some(stage);
  }

  fn leave(&self) {
    *self.active.lock().unwrap() = None;
  }

  fn record(&self, logs: Vec<String>) {
    self.trace_logs.lock().unwrap().extend(logs);
  }
}
