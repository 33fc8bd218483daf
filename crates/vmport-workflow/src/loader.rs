//! Workflow file loading.
//!
//! Workflow files are JSON documents:
//!
//! ```json
//! {
//!   "name": "translate-ubuntu",
//!   "defaultTimeout": "30m",
//!   "vars": {
//!     "image_name": { "required": true, "description": "name of the final image" },
//!     "install_gce_packages": "true"
//!   },
//!   "steps": {
//!     "translate-disk": { "createInstances": [ ... ] },
//!     "wait": { "timeout": "60m", "waitForInstancesSignal": [ ... ] }
//!   },
//!   "dependencies": { "wait": ["translate-disk"] }
//! }
//! ```
//!
//! Every string leaf outside `vars` is rendered with minijinja against the
//! resolved vars plus the automatic vars `id`, `name`, `project`, `zone` and
//! `wf_dir`. Referencing an undefined var is an error. Included workflows
//! are resolved relative to the including file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use minijinja::{Environment, UndefinedBehavior, Value};
use serde::Deserialize;
use tracing::debug;

use crate::error::WorkflowError;
use crate::resource::{
  AttachDiskDef, DeleteResourcesDef, DetachDiskDef, DiskDef, ImageDef, InstanceDef,
  InstanceSignal, MachineImageDef, MetadataUpdateDef, SnapshotDef,
};
use crate::step::{IncludeWorkflow, Step, StepKind};
use crate::workflow::{DEFAULT_TIMEOUT, Workflow};

/// Caller-supplied values applied while loading.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
  /// Overrides the file's project.
  pub project: Option<String>,
  /// Overrides the file's zone.
  pub zone: Option<String>,
  pub vars: BTreeMap<String, String>,
  /// Drop provided vars the top-level file does not declare instead of
  /// failing. Used when the same var set is handed to user-supplied files.
  pub ignore_unknown_vars: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VarDef {
  Value(String),
  Spec(VarSpec),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct VarSpec {
  required: bool,
  value: Option<String>,
  #[allow(dead_code)]
  description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct WorkflowFile {
  #[serde(default)]
  name: Option<String>,
  // Resolved from the raw document before rendering.
  #[serde(default)]
  #[allow(dead_code)]
  project: Option<String>,
  #[serde(default)]
  #[allow(dead_code)]
  zone: Option<String>,
  #[serde(default)]
  default_timeout: Option<String>,
  #[serde(default)]
  no_cleanup: bool,
  #[serde(default)]
  force_cleanup_on_error: bool,
  #[serde(default)]
  steps: BTreeMap<String, StepDef>,
  #[serde(default)]
  dependencies: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
struct StepDef {
  timeout: Option<String>,
  create_instances: Option<Vec<InstanceDef>>,
  create_disks: Option<Vec<DiskDef>>,
  create_images: Option<Vec<ImageDef>>,
  attach_disks: Option<Vec<AttachDiskDef>>,
  detach_disks: Option<Vec<DetachDiskDef>>,
  start_instances: Option<Vec<String>>,
  stop_instances: Option<Vec<String>>,
  delete_resources: Option<DeleteResourcesDef>,
  update_instance_metadata: Option<Vec<MetadataUpdateDef>>,
  wait_for_instances_signal: Option<Vec<InstanceSignal>>,
  wait_for_any_signal: Option<Vec<InstanceSignal>>,
  include_workflow: Option<IncludeDef>,
  create_snapshots: Option<Vec<SnapshotDef>>,
  create_machine_images: Option<Vec<MachineImageDef>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct IncludeDef {
  path: String,
  #[serde(default)]
  vars: BTreeMap<String, String>,
}

/// Load a workflow file and everything it includes.
pub fn load_workflow(path: &Path, options: &LoadOptions) -> Result<Workflow, WorkflowError> {
  let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
  let mut loader = Loader {
    stack: Vec::new(),
    ignore_unknown_vars: options.ignore_unknown_vars,
  };
  loader.load(
    path,
    options.project.clone(),
    options.zone.clone(),
    &options.vars,
    None,
    &id,
  )
}

/// Parse a duration such as `"90s"` or `"1h 30m"`.
pub fn parse_duration(value: &str) -> Result<Duration, WorkflowError> {
  humantime::parse_duration(value).map_err(|e| WorkflowError::InvalidDuration {
    value: value.to_string(),
    message: e.to_string(),
  })
}

struct Loader {
  /// Canonical paths of the files currently being loaded.
  stack: Vec<PathBuf>,
  ignore_unknown_vars: bool,
}

struct Context<'a> {
  path: &'a Path,
  workflow: &'a str,
  dir: &'a Path,
  project: &'a str,
  zone: &'a str,
  default_timeout: Duration,
  id: &'a str,
}

impl Loader {
  fn load(
    &mut self,
    path: &Path,
    project: Option<String>,
    zone: Option<String>,
    provided: &BTreeMap<String, String>,
    parent_timeout: Option<Duration>,
    id: &str,
  ) -> Result<Workflow, WorkflowError> {
    let canonical = std::fs::canonicalize(path).map_err(|source| WorkflowError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    if self.stack.contains(&canonical) {
      return Err(WorkflowError::RecursiveInclude { path: canonical });
    }

    let content = std::fs::read_to_string(&canonical).map_err(|source| WorkflowError::Io {
      path: canonical.clone(),
      source,
    })?;
    let mut raw: serde_json::Value =
      serde_json::from_str(&content).map_err(|source| WorkflowError::Parse {
        path: canonical.clone(),
        source,
      })?;

    let name = raw
      .get("name")
      .and_then(|v| v.as_str())
      .map(str::to_string)
      .unwrap_or_else(|| file_stem(&canonical));
    let var_defs: BTreeMap<String, VarDef> = match raw.as_object_mut().and_then(|o| o.remove("vars")) {
      Some(value) => serde_json::from_value(value).map_err(|source| WorkflowError::Parse {
        path: canonical.clone(),
        source,
      })?,
      None => BTreeMap::new(),
    };
    let lenient = self.ignore_unknown_vars && self.stack.is_empty();
    let vars = resolve_vars(&name, var_defs, provided, lenient)?;

    let project = project
      .or_else(|| raw_string(&raw, "project"))
      .unwrap_or_default();
    let zone = zone.or_else(|| raw_string(&raw, "zone")).unwrap_or_default();
    let dir = canonical
      .parent()
      .map(Path::to_path_buf)
      .unwrap_or_default();

    let mut context = vars.clone();
    context.insert("id".to_string(), id.to_string());
    context.insert("name".to_string(), name.clone());
    context.insert("project".to_string(), project.clone());
    context.insert("zone".to_string(), zone.clone());
    context.insert("wf_dir".to_string(), dir.display().to_string());

    let rendered = render_value(&canonical, &raw, &Value::from_serialize(&context))?;
    let file: WorkflowFile =
      serde_json::from_value(rendered).map_err(|source| WorkflowError::Parse {
        path: canonical.clone(),
        source,
      })?;

    let default_timeout = match &file.default_timeout {
      Some(value) => parse_duration(value)?,
      None => parent_timeout.unwrap_or(DEFAULT_TIMEOUT),
    };

    debug!(path = %canonical.display(), workflow = %name, "loading workflow");
    self.stack.push(canonical.clone());
    let ctx = Context {
      path: &canonical,
      workflow: &name,
      dir: &dir,
      project: &project,
      zone: &zone,
      default_timeout,
      id,
    };
    let steps = self.build_steps(&ctx, file.steps);
    self.stack.pop();

    Ok(Workflow {
      name: file.name.unwrap_or(name),
      project,
      zone,
      default_timeout,
      steps: steps?,
      dependencies: file.dependencies,
      no_cleanup: file.no_cleanup,
      force_cleanup_on_error: file.force_cleanup_on_error,
      vars,
      source_path: Some(canonical),
    })
  }

  fn build_steps(
    &mut self,
    ctx: &Context<'_>,
    defs: BTreeMap<String, StepDef>,
  ) -> Result<BTreeMap<String, Step>, WorkflowError> {
    let mut steps = BTreeMap::new();
    for (name, def) in defs {
      let step = self.build_step(ctx, &name, def)?;
      steps.insert(name, step);
    }
    Ok(steps)
  }

  fn build_step(
    &mut self,
    ctx: &Context<'_>,
    name: &str,
    def: StepDef,
  ) -> Result<Step, WorkflowError> {
    let invalid = |message: String| WorkflowError::InvalidStep {
      workflow: ctx.workflow.to_string(),
      step: name.to_string(),
      message,
    };

    let timeout = def.timeout.as_deref().map(parse_duration).transpose()?;

    let mut kinds = Vec::new();
    if let Some(v) = def.create_instances {
      kinds.push(StepKind::CreateInstances(v));
    }
    if let Some(v) = def.create_disks {
      kinds.push(StepKind::CreateDisks(v));
    }
    if let Some(v) = def.create_images {
      kinds.push(StepKind::CreateImages(v));
    }
    if let Some(v) = def.attach_disks {
      kinds.push(StepKind::AttachDisks(v));
    }
    if let Some(v) = def.detach_disks {
      kinds.push(StepKind::DetachDisks(v));
    }
    if let Some(v) = def.start_instances {
      kinds.push(StepKind::StartInstances(v));
    }
    if let Some(v) = def.stop_instances {
      kinds.push(StepKind::StopInstances(v));
    }
    if let Some(v) = def.delete_resources {
      kinds.push(StepKind::DeleteResources(v));
    }
    if let Some(v) = def.update_instance_metadata {
      kinds.push(StepKind::UpdateInstanceMetadata(v));
    }
    if let Some(v) = def.wait_for_instances_signal {
      kinds.push(StepKind::WaitForInstancesSignal(v));
    }
    if let Some(v) = def.wait_for_any_signal {
      kinds.push(StepKind::WaitForAnySignal(v));
    }
    if let Some(v) = def.create_snapshots {
      kinds.push(StepKind::CreateSnapshots(v));
    }
    if let Some(v) = def.create_machine_images {
      kinds.push(StepKind::CreateMachineImages(v));
    }

    let set = kinds.len() + usize::from(def.include_workflow.is_some());
    if set != 1 {
      return Err(invalid(format!(
        "exactly one step type must be set, found {}",
        set
      )));
    }

    let kind = match def.include_workflow {
      Some(include) => {
        let path = ctx.dir.join(&include.path);
        let nested = self
          .load(
            &path,
            Some(ctx.project.to_string()),
            Some(ctx.zone.to_string()),
            &include.vars,
            Some(ctx.default_timeout),
            ctx.id,
          )
          .map_err(|e| match e {
            WorkflowError::Io { .. } => invalid(format!(
              "cannot include {} from {}: {}",
              include.path,
              ctx.path.display(),
              e
            )),
            other => other,
          })?;
        StepKind::IncludeWorkflow(IncludeWorkflow {
          path: nested.source_path.clone(),
          workflow: Box::new(nested),
        })
      }
      None => kinds.remove(0),
    };

    Ok(Step { timeout, kind })
  }
}

fn resolve_vars(
  workflow: &str,
  defs: BTreeMap<String, VarDef>,
  provided: &BTreeMap<String, String>,
  ignore_unknown: bool,
) -> Result<BTreeMap<String, String>, WorkflowError> {
  let unknown = provided.keys().find(|k| !defs.contains_key(*k));
  if let (Some(unknown), false) = (unknown, ignore_unknown) {
    return Err(WorkflowError::UnknownVar {
      workflow: workflow.to_string(),
      var: unknown.clone(),
    });
  }

  let mut vars = BTreeMap::new();
  for (key, def) in defs {
    let (required, default) = match def {
      VarDef::Value(value) => (false, Some(value)),
      VarDef::Spec(spec) => (spec.required, spec.value),
    };
    let value = match (provided.get(&key), default) {
      (Some(value), _) => value.clone(),
      (None, Some(value)) if !(required && value.is_empty()) => value,
      (None, _) if required => {
        return Err(WorkflowError::MissingVar {
          workflow: workflow.to_string(),
          var: key,
        });
      }
      (None, _) => String::new(),
    };
    vars.insert(key, value);
  }
  Ok(vars)
}

fn render_value(
  path: &Path,
  value: &serde_json::Value,
  context: &Value,
) -> Result<serde_json::Value, WorkflowError> {
  let mut env = Environment::new();
  env.set_undefined_behavior(UndefinedBehavior::Strict);
  render_json(&env, path, value, context)
}

fn render_json(
  env: &Environment,
  path: &Path,
  value: &serde_json::Value,
  context: &Value,
) -> Result<serde_json::Value, WorkflowError> {
  match value {
    serde_json::Value::String(s) if s.contains("{{") || s.contains("{%") => {
      let result = env
        .render_str(s, context.clone())
        .map_err(|e| WorkflowError::Template {
          path: path.to_path_buf(),
          message: format!("{:?}: {}", s, e),
        })?;
      // A lone `{{ var }}` may stand in for a number or a bool
      if is_pure_template(s) {
        if let Ok(parsed @ (serde_json::Value::Number(_) | serde_json::Value::Bool(_))) =
          serde_json::from_str::<serde_json::Value>(&result)
        {
          return Ok(parsed);
        }
      }
      Ok(serde_json::Value::String(result))
    }
    serde_json::Value::Array(arr) => {
      let rendered: Result<Vec<_>, _> = arr
        .iter()
        .map(|v| render_json(env, path, v, context))
        .collect();
      Ok(serde_json::Value::Array(rendered?))
    }
    serde_json::Value::Object(obj) => {
      let mut rendered = serde_json::Map::new();
      for (k, v) in obj {
        rendered.insert(k.clone(), render_json(env, path, v, context)?);
      }
      Ok(serde_json::Value::Object(rendered))
    }
    _ => Ok(value.clone()),
  }
}

fn is_pure_template(s: &str) -> bool {
  let trimmed = s.trim();
  trimmed.starts_with("{{")
    && trimmed.ends_with("}}")
    && trimmed.matches("{{").count() == 1
    && trimmed.matches("}}").count() == 1
}

fn raw_string(raw: &serde_json::Value, key: &str) -> Option<String> {
  raw
    .get(key)
    .and_then(|v| v.as_str())
    .filter(|s| !s.is_empty() && !s.contains("{{"))
    .map(str::to_string)
}

fn file_stem(path: &Path) -> String {
  path
    .file_name()
    .and_then(|n| n.to_str())
    .map(|n| n.trim_end_matches(".json").trim_end_matches(".wf"))
    .unwrap_or("workflow")
    .to_string()
}
