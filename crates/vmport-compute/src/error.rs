//! Errors returned by cloud API collaborators.

use thiserror::Error;

/// Errors returned by the compute, storage, metadata and inspection clients.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
  /// The referenced resource does not exist.
  #[error("resource not found: {resource}")]
  NotFound { resource: String },

  /// A resource with the same name already exists.
  #[error("resource already exists: {resource}")]
  AlreadyExists { resource: String },

  /// The resource is still used by another resource (e.g. a disk attached to
  /// an instance).
  #[error("resource in use: {resource} is used by {user}")]
  InUse { resource: String, user: String },

  /// The request was rejected as malformed.
  #[error("invalid argument: {message}")]
  InvalidArgument { message: String },

  /// The request failed in a way that may succeed when retried.
  #[error("transient error: {message}")]
  Transient { message: String },

  /// The operation is not available from this client.
  #[error("unsupported operation: {operation}")]
  Unsupported { operation: String },

  /// Any other failure.
  #[error("{message}")]
  Other { message: String },
}

impl ApiError {
  pub fn not_found(resource: impl Into<String>) -> Self {
    Self::NotFound {
      resource: resource.into(),
    }
  }

  pub fn invalid(message: impl Into<String>) -> Self {
    Self::InvalidArgument {
      message: message.into(),
    }
  }

  pub fn other(message: impl Into<String>) -> Self {
    Self::Other {
      message: message.into(),
    }
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, Self::NotFound { .. })
  }

  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Transient { .. })
  }
}
