//! Cancellation shared between a running stage and whoever stops it.

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::error::ImportError;

/// A stage's cancellation token plus the reason it was cancelled.
///
/// `cancel` never blocks and may be called from any thread.
#[derive(Debug, Default)]
pub(crate) struct StageCancel {
  token: CancellationToken,
  reason: Mutex<Option<String>>,
}

impl StageCancel {
  pub fn child_of(parent: &CancellationToken) -> Self {
    Self {
      token: parent.child_token(),
      reason: Mutex::new(None),
    }
  }

  pub fn cancel(&self, reason: &str) {
    self
      .reason
      .lock()
      .unwrap()
      .get_or_insert_with(|| reason.to_string());
    self.token.cancel();
  }

  pub fn token(&self) -> CancellationToken {
    self.token.clone()
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn error(&self) -> ImportError {
    let reason = self
      .reason
      .lock()
      .unwrap()
      .clone()
      .unwrap_or_else(|| "cancelled by caller".to_string());
    ImportError::Cancelled { reason }
  }
}
