//! Workflow run results and serial output tags.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::registry::CreatedResource;

/// What a successful run produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOutcome {
  pub run_id: String,
  /// Values published by workers as serial output tags.
  pub serial_values: BTreeMap<String, String>,
  /// Serial lines that matched a status pattern.
  pub trace_logs: Vec<String>,
  /// Created resources that were kept after cleanup.
  pub kept: Vec<CreatedResource>,
}

const TAG_PREFIX: &str = "<serial-output key:'";
const TAG_SEPARATOR: &str = "' value:'";
const TAG_SUFFIX: &str = "'>";

/// Extract every `<serial-output key:'K' value:'V'>` tag from `line`.
pub fn parse_serial_tags(line: &str) -> Vec<(String, String)> {
  let mut tags = Vec::new();
  let mut rest = line;
  while let Some(start) = rest.find(TAG_PREFIX) {
    rest = &rest[start + TAG_PREFIX.len()..];
    let Some(separator) = rest.find(TAG_SEPARATOR) else {
      break;
    };
    let key = &rest[..separator];
    rest = &rest[separator + TAG_SEPARATOR.len()..];
    let Some(end) = rest.find(TAG_SUFFIX) else {
      break;
    };
    tags.push((key.to_string(), rest[..end].to_string()));
    rest = &rest[end + TAG_SUFFIX.len()..];
  }
  tags
}

/// Format a serial output tag the way workers print them.
pub fn serial_tag(key: &str, value: &str) -> String {
  format!("{}{}{}{}{}", TAG_PREFIX, key, TAG_SEPARATOR, value, TAG_SUFFIX)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_serial_tags() {
    let line = "Import: <serial-output key:'target-size-gb' value:'10'> and <serial-output key:'import-file-format' value:'vmdk'>";
    assert_eq!(
      parse_serial_tags(line),
      vec![
        ("target-size-gb".to_string(), "10".to_string()),
        ("import-file-format".to_string(), "vmdk".to_string()),
      ]
    );
  }

  #[test]
  fn test_parse_ignores_truncated_tag() {
    assert!(parse_serial_tags("<serial-output key:'a' value:'b").is_empty());
    assert!(parse_serial_tags("nothing here").is_empty());
  }

  #[test]
  fn test_serial_tag_round_trip() {
    let tag = serial_tag("disk-checksum", "abc def");
    assert_eq!(
      parse_serial_tags(&tag),
      vec![("disk-checksum".to_string(), "abc def".to_string())]
    );
  }
}
