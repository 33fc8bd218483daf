use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::WorkflowError;
use crate::graph::Graph;
use crate::step::{Step, StepKind};

/// Default timeout applied to steps that do not set their own.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// A named DAG of steps.
///
/// Workflows are populated (built in code or loaded from a file), optionally
/// rewritten by hooks such as the resource labeler, and then handed to the
/// executor, which never mutates them.
#[derive(Debug, Clone)]
pub struct Workflow {
  pub name: String,
  pub project: String,
  pub zone: String,
  pub default_timeout: Duration,
  pub steps: BTreeMap<String, Step>,
  /// step -> prerequisite steps.
  pub dependencies: BTreeMap<String, Vec<String>>,
  /// Keep every created resource after the run, for debugging.
  pub no_cleanup: bool,
  /// Clean up after a failed run even when `no_cleanup` is set. Resources
  /// marked `no_cleanup` themselves are still kept.
  pub force_cleanup_on_error: bool,
  pub vars: BTreeMap<String, String>,
  pub source_path: Option<PathBuf>,
}

impl Workflow {
  pub fn new(name: impl Into<String>, project: impl Into<String>, zone: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      project: project.into(),
      zone: zone.into(),
      default_timeout: DEFAULT_TIMEOUT,
      steps: BTreeMap::new(),
      dependencies: BTreeMap::new(),
      no_cleanup: false,
      force_cleanup_on_error: false,
      vars: BTreeMap::new(),
      source_path: None,
    }
  }

  /// Add a step; step names are unique within a workflow.
  pub fn add_step(&mut self, name: &str, kind: StepKind) -> Result<&mut Step, WorkflowError> {
    if self.steps.contains_key(name) {
      return Err(WorkflowError::DuplicateStep {
        workflow: self.name.clone(),
        step: name.to_string(),
      });
    }
    Ok(self.steps.entry(name.to_string()).or_insert(Step::new(kind)))
  }

  /// Record that `step` runs only after every step in `prerequisites`.
  pub fn add_dependency(&mut self, step: &str, prerequisites: &[&str]) {
    let entry = self.dependencies.entry(step.to_string()).or_default();
    for prerequisite in prerequisites {
      if !entry.iter().any(|p| p == prerequisite) {
        entry.push(prerequisite.to_string());
      }
    }
  }

  /// Chain `steps` so each one depends on the previous.
  pub fn add_sequence(&mut self, steps: &[&str]) {
    for pair in steps.windows(2) {
      self.add_dependency(pair[1], &[pair[0]]);
    }
  }

  pub fn graph(&self) -> Graph {
    Graph::new(self.steps.keys(), &self.dependencies)
  }

  pub fn get_step(&self, name: &str) -> Option<&Step> {
    self.steps.get(name)
  }

  /// The effective timeout of `step`.
  pub fn step_timeout(&self, step: &Step) -> Duration {
    step.timeout.unwrap_or(self.default_timeout)
  }

  /// Visit every step of this workflow and of all included workflows.
  /// Included workflows are visited before the step that includes them.
  pub fn visit_steps_mut<F>(&mut self, f: &mut F)
  where
    F: FnMut(&mut Step),
  {
    for step in self.steps.values_mut() {
      if let StepKind::IncludeWorkflow(include) = &mut step.kind {
        include.workflow.visit_steps_mut(f);
      }
      f(step);
    }
  }

  /// Visit this workflow and every included workflow, parents first.
  pub fn visit_workflows_mut<F>(&mut self, f: &mut F)
  where
    F: FnMut(&mut Workflow),
  {
    f(self);
    for step in self.steps.values_mut() {
      if let StepKind::IncludeWorkflow(include) = &mut step.kind {
        include.workflow.visit_workflows_mut(f);
      }
    }
  }

  /// Visit every step, read-only, recursing into includes.
  pub fn visit_steps<F>(&self, f: &mut F)
  where
    F: FnMut(&Workflow, &str, &Step),
  {
    for (name, step) in &self.steps {
      if let StepKind::IncludeWorkflow(include) = &step.kind {
        include.workflow.visit_steps(f);
      }
      f(self, name, step);
    }
  }
}
