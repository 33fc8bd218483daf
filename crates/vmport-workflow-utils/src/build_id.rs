//! Build IDs used for tracking labels and resource name suffixes.

/// Environment variable consulted for the build ID.
pub const BUILD_ID_ENV: &str = "BUILD_ID";

const BUILD_ID_LEN: usize = 8;

/// The build ID from `value` (normally the `BUILD_ID` environment variable),
/// or a random one when it is unset or blank. Label values must be
/// lowercase.
pub fn build_id_from(value: Option<String>) -> String {
  match value.map(|v| v.trim().to_lowercase()) {
    Some(v) if !v.is_empty() => v,
    _ => random_suffix(BUILD_ID_LEN),
  }
}

/// Reads the build ID from the environment.
pub fn build_id() -> String {
  build_id_from(std::env::var(BUILD_ID_ENV).ok())
}

/// A random lowercase alphanumeric string of at most 32 characters.
pub fn random_suffix(len: usize) -> String {
  uuid::Uuid::new_v4()
    .simple()
    .to_string()
    .chars()
    .take(len)
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_build_id_from_value() {
    assert_eq!(build_id_from(Some("Build-42".to_string())), "build-42");
  }

  #[test]
  fn test_random_build_id_when_unset() {
    let a = build_id_from(None);
    let b = build_id_from(Some("  ".to_string()));
    assert_eq!(a.len(), BUILD_ID_LEN);
    assert_eq!(b.len(), BUILD_ID_LEN);
    assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
  }
}
