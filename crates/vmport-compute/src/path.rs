//! Resource URI and GCS path helpers.

use std::fmt;

use crate::error::ApiError;

pub fn disk_uri(project: &str, zone: &str, name: &str) -> String {
  format!("projects/{}/zones/{}/disks/{}", project, zone, name)
}

pub fn instance_uri(project: &str, zone: &str, name: &str) -> String {
  format!("projects/{}/zones/{}/instances/{}", project, zone, name)
}

pub fn image_uri(project: &str, name: &str) -> String {
  format!("projects/{}/global/images/{}", project, name)
}

pub fn snapshot_uri(project: &str, name: &str) -> String {
  format!("projects/{}/global/snapshots/{}", project, name)
}

pub fn machine_image_uri(project: &str, name: &str) -> String {
  format!("projects/{}/global/machineImages/{}", project, name)
}

/// Last path segment of a resource URI, or the input itself for bare names.
pub fn resource_name(uri: &str) -> &str {
  uri.rsplit('/').next().unwrap_or(uri)
}

/// A parsed zonal resource URI such as `projects/p/zones/z/disks/d`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZonalResource {
  pub project: String,
  pub zone: String,
  pub name: String,
}

impl ZonalResource {
  /// Parses `[https://.../]projects/{p}/zones/{z}/{collection}/{name}`.
  pub fn parse(uri: &str, collection: &str) -> Option<Self> {
    let start = uri.find("projects/")?;
    let parts: Vec<&str> = uri[start..].split('/').collect();
    match parts.as_slice() {
      ["projects", project, "zones", zone, coll, name]
        if *coll == collection && !project.is_empty() && !zone.is_empty() && !name.is_empty() =>
      {
        Some(Self {
          project: project.to_string(),
          zone: zone.to_string(),
          name: name.to_string(),
        })
      }
      _ => None,
    }
  }
}

/// A parsed global resource URI such as `projects/p/global/images/i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalResource {
  pub project: String,
  pub name: String,
}

impl GlobalResource {
  pub fn parse(uri: &str, collection: &str) -> Option<Self> {
    let start = uri.find("projects/")?;
    let parts: Vec<&str> = uri[start..].split('/').collect();
    match parts.as_slice() {
      ["projects", project, "global", coll, name]
        if *coll == collection && !project.is_empty() && !name.is_empty() =>
      {
        Some(Self {
          project: project.to_string(),
          name: name.to_string(),
        })
      }
      // Image families resolve to the family name; callers that need the
      // concrete image look it up through the API.
      ["projects", project, "global", coll, "family", name] if *coll == collection => Some(Self {
        project: project.to_string(),
        name: name.to_string(),
      }),
      _ => None,
    }
  }
}

/// A `gs://bucket/object` location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GcsPath {
  pub bucket: String,
  pub object: String,
}

impl GcsPath {
  pub fn parse(path: &str) -> Result<Self, ApiError> {
    let rest = path
      .strip_prefix("gs://")
      .ok_or_else(|| ApiError::invalid(format!("{:?} is not a valid Cloud Storage path", path)))?;
    let (bucket, object) = match rest.split_once('/') {
      Some((bucket, object)) => (bucket, object),
      None => (rest, ""),
    };
    if bucket.is_empty() {
      return Err(ApiError::invalid(format!(
        "{:?} is missing a bucket name",
        path
      )));
    }
    Ok(Self {
      bucket: bucket.to_string(),
      object: object.to_string(),
    })
  }

  /// Parses a path that must name an object, not just a bucket or folder.
  pub fn parse_object(path: &str) -> Result<Self, ApiError> {
    let parsed = Self::parse(path)?;
    if parsed.object.is_empty() || parsed.object.ends_with('/') {
      return Err(ApiError::invalid(format!(
        "{:?} does not reference a Cloud Storage object",
        path
      )));
    }
    Ok(parsed)
  }

  /// Treats the path as a folder and returns the path of `name` inside it.
  pub fn join(&self, name: &str) -> Self {
    let object = if self.object.is_empty() || self.object.ends_with('/') {
      format!("{}{}", self.object, name)
    } else {
      format!("{}/{}", self.object, name)
    };
    Self {
      bucket: self.bucket.clone(),
      object,
    }
  }

  /// The object prefix used to list the contents of this path as a folder.
  pub fn folder_prefix(&self) -> String {
    if self.object.is_empty() || self.object.ends_with('/') {
      self.object.clone()
    } else {
      format!("{}/", self.object)
    }
  }
}

impl fmt::Display for GcsPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "gs://{}/{}", self.bucket, self.object)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_zonal_resource() {
    let parsed = ZonalResource::parse(
      "https://www.googleapis.com/compute/v1/projects/p1/zones/us-west1-a/disks/d1",
      "disks",
    )
    .unwrap();
    assert_eq!(parsed.project, "p1");
    assert_eq!(parsed.zone, "us-west1-a");
    assert_eq!(parsed.name, "d1");

    assert!(ZonalResource::parse("projects/p1/zones/z/instances/i", "disks").is_none());
    assert!(ZonalResource::parse("d1", "disks").is_none());
  }

  #[test]
  fn test_parse_global_resource_with_family() {
    let parsed = GlobalResource::parse("projects/p/global/images/family/debian-12", "images").unwrap();
    assert_eq!(parsed.project, "p");
    assert_eq!(parsed.name, "debian-12");
  }

  #[test]
  fn test_gcs_path() {
    let path = GcsPath::parse_object("gs://bucket/dir/file.vmdk").unwrap();
    assert_eq!(path.bucket, "bucket");
    assert_eq!(path.object, "dir/file.vmdk");
    assert_eq!(path.to_string(), "gs://bucket/dir/file.vmdk");

    assert!(GcsPath::parse("s3://bucket/x").is_err());
    assert!(GcsPath::parse_object("gs://bucket/").is_err());

    let folder = GcsPath::parse("gs://bucket/out").unwrap();
    assert_eq!(folder.join("a.vmdk").object, "out/a.vmdk");
    assert_eq!(folder.folder_prefix(), "out/");
  }
}
