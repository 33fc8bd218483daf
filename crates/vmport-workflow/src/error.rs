use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
  #[error("workflow '{workflow}': step '{step}' is defined more than once")]
  DuplicateStep { workflow: String, step: String },

  #[error("workflow '{workflow}': dependencies reference unknown step '{step}'")]
  UnknownStep { workflow: String, step: String },

  #[error("workflow '{workflow}': step '{step}' depends on unknown step '{dependency}'")]
  DanglingDependency {
    workflow: String,
    step: String,
    dependency: String,
  },

  #[error("workflow '{workflow}': circular dependency: {}", cycle.join(" -> "))]
  CircularDependency { workflow: String, cycle: Vec<String> },

  #[error("workflow '{workflow}': step '{step}' is invalid: {message}")]
  InvalidStep {
    workflow: String,
    step: String,
    message: String,
  },

  #[error("workflow '{workflow}': required var '{var}' has no value")]
  MissingVar { workflow: String, var: String },

  #[error("workflow '{workflow}': unknown var '{var}'")]
  UnknownVar { workflow: String, var: String },

  #[error("failed to render {path}: {message}")]
  Template { path: PathBuf, message: String },

  #[error("failed to read {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("invalid duration {value:?}: {message}")]
  InvalidDuration { value: String, message: String },

  #[error("workflow {path} includes itself")]
  RecursiveInclude { path: PathBuf },
}
