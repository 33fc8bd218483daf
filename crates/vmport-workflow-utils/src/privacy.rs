//! Privacy tags in worker serial output.
//!
//! Workers wrap user data (file names, hostnames) in
//! `[Privacy-> ... <-Privacy]`. Users see the text without the tags; trace
//! logs kept for diagnostics drop the tagged text entirely.

use std::sync::{Arc, Mutex};

use vmport_workflow_executor::{ExecutionEvent, ExecutionNotifier};

const PRIVACY_START: &str = "[Privacy->";
const PRIVACY_END: &str = "<-Privacy]";

/// Remove tagged text along with the tags. An unterminated tag drops the
/// rest of the line.
pub fn strip_privacy_info(line: &str) -> String {
  let mut out = String::with_capacity(line.len());
  let mut rest = line;
  while let Some(start) = rest.find(PRIVACY_START) {
    out.push_str(&rest[..start]);
    rest = &rest[start + PRIVACY_START.len()..];
    match rest.find(PRIVACY_END) {
      Some(end) => rest = &rest[end + PRIVACY_END.len()..],
      None => return out,
    }
  }
  out.push_str(rest);
  out
}

/// Remove the tags but keep the tagged text.
pub fn strip_privacy_tags(line: &str) -> String {
  line.replace(PRIVACY_START, "").replace(PRIVACY_END, "")
}

/// Forwards events to `inner` with privacy tags removed from serial lines
/// and keeps a privacy-stripped copy of every serial line as a trace log.
pub struct PrivacyFilterNotifier {
  inner: Arc<dyn ExecutionNotifier>,
  trace_logs: Mutex<Vec<String>>,
}

impl PrivacyFilterNotifier {
  pub fn new(inner: Arc<dyn ExecutionNotifier>) -> Self {
    Self {
      inner,
      trace_logs: Mutex::new(Vec::new()),
    }
  }

  pub fn trace_logs(&self) -> Vec<String> {
    self.trace_logs.lock().unwrap().clone()
  }
}

impl ExecutionNotifier for PrivacyFilterNotifier {
  fn notify(&self, event: ExecutionEvent) {
    let event = match event {
      ExecutionEvent::SerialOutput {
        workflow,
        step,
        instance,
        line,
      } => {
        self.trace_logs.lock().unwrap().push(strip_privacy_info(&line));
        ExecutionEvent::SerialOutput {
          workflow,
          step,
          instance,
          line: strip_privacy_tags(&line),
        }
      }
      other => other,
    };
    self.inner.notify(event);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use vmport_workflow_executor::RecordingNotifier;

  #[test]
  fn test_strip_privacy_info() {
    assert_eq!(
      strip_privacy_info("Import: [Privacy->disk.vmdk<-Privacy] is 10GB"),
      "Import:  is 10GB"
    );
    assert_eq!(
      strip_privacy_info("a [Privacy->x<-Privacy] b [Privacy->y<-Privacy] c"),
      "a  b  c"
    );
    assert_eq!(strip_privacy_info("a [Privacy->unterminated"), "a ");
    assert_eq!(strip_privacy_info("plain"), "plain");
  }

  #[test]
  fn test_strip_privacy_tags() {
    assert_eq!(
      strip_privacy_tags("Import: [Privacy->disk.vmdk<-Privacy] is 10GB"),
      "Import: disk.vmdk is 10GB"
    );
  }

  #[test]
  fn test_notifier_filters_serial_lines() {
    let inner = Arc::new(RecordingNotifier::new());
    let notifier = PrivacyFilterNotifier::new(inner.clone());
    notifier.notify(ExecutionEvent::SerialOutput {
      workflow: "wf".to_string(),
      step: "wait".to_string(),
      instance: "worker".to_string(),
      line: "Translate: host [Privacy->db01<-Privacy]".to_string(),
    });
    notifier.notify(ExecutionEvent::WorkflowCompleted {
      run_id: "r".to_string(),
      workflow: "wf".to_string(),
    });

    assert_eq!(notifier.trace_logs(), vec!["Translate: host ".to_string()]);
    assert_eq!(inner.serial_lines(), vec!["Translate: host db01".to_string()]);
    assert_eq!(inner.events().len(), 2);
  }
}
