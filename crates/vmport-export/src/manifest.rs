//! SHA1 manifests for exported files.

use std::io::Read;

use sha1::{Digest, Sha1};
use tracing::{debug, info};
use vmport_compute::{GcsPath, StorageClient};

use crate::error::ExportError;
use crate::reader::ByteCountingReader;

const CHUNK_SIZE: usize = 64 * 1024;

/// One manifest line: `SHA1(name)= digest`.
pub fn manifest_line(name: &str, digest: &str) -> String {
  format!("SHA1({})= {}\n", name, digest)
}

/// Hex SHA1 of everything `reader` yields, plus the number of bytes hashed.
pub fn sha1_hex<R: Read>(reader: R) -> std::io::Result<(String, u64)> {
  let mut reader = ByteCountingReader::new(reader);
  let mut hasher = Sha1::new();
  let mut buffer = vec![0u8; CHUNK_SIZE];
  loop {
    let n = reader.read(&mut buffer)?;
    if n == 0 {
      break;
    }
    hasher.update(&buffer[..n]);
  }
  Ok((hex::encode(hasher.finalize()), reader.bytes_read()))
}

/// The manifest name of `object`, or `None` when it does not belong in the
/// manifest of `prefix`.
fn entry_name<'a>(object: &'a str, prefix: &str, exclude: &[&str]) -> Option<&'a str> {
  let name = object.strip_prefix(prefix)?;
  // Nested folders are not part of the export.
  if name.is_empty() || name.contains('/') || exclude.contains(&name) {
    return None;
  }
  Some(name)
}

/// Build the manifest of every object directly under `folder`, in the order
/// the storage listing returns them. `exclude` names (e.g. the manifest
/// itself) are skipped.
pub async fn generate_manifest(
  storage: &dyn StorageClient,
  folder: &GcsPath,
  exclude: &[&str],
) -> Result<String, ExportError> {
  let prefix = folder.folder_prefix();
  let objects = storage
    .list_objects(&folder.bucket, &prefix)
    .await
    .map_err(|e| ExportError::api("list_objects", folder.to_string(), e))?;

  let mut manifest = String::new();
  for attrs in objects {
    let Some(name) = entry_name(&attrs.name, &prefix, exclude) else {
      continue;
    };
    let data = storage
      .read_object(&attrs.bucket, &attrs.name)
      .await
      .map_err(|e| ExportError::api("read_object", attrs.name.clone(), e))?;
    let (digest, bytes) = sha1_hex(data.as_slice()).map_err(|source| ExportError::Manifest {
      object: attrs.name.clone(),
      source,
    })?;
    debug!(object = %attrs.name, bytes, "hashed object");
    manifest.push_str(&manifest_line(name, &digest));
  }
  Ok(manifest)
}

/// Generate the manifest for `folder` and store it there as `name`.
pub async fn write_manifest(
  storage: &dyn StorageClient,
  folder: &GcsPath,
  name: &str,
) -> Result<GcsPath, ExportError> {
  let manifest = generate_manifest(storage, folder, &[name]).await?;
  let path = folder.join(name);
  storage
    .write_object(&path.bucket, &path.object, manifest.into_bytes())
    .await
    .map_err(|e| ExportError::api("write_object", path.to_string(), e))?;
  info!(manifest = %path, "wrote manifest");
  Ok(path)
}

#[cfg(test)]
mod tests {
  use super::*;

  use vmport_compute::EmulatorCloud;

  #[test]
  fn test_sha1_of_known_input() {
    let (digest, bytes) = sha1_hex(&b"abc"[..]).unwrap();
    assert_eq!(digest, "a9993e364706816aba3e25717850c26c9cd0d89d");
    assert_eq!(bytes, 3);
  }

  #[tokio::test]
  async fn test_manifest_lists_objects_in_listing_order() {
    let cloud = EmulatorCloud::new("p", "z");
    cloud.add_object("bucket", "folder/afile1.txt", b"abc".to_vec());
    cloud.add_object("bucket", "folder/afile2.txt", b"".to_vec());
    cloud.add_object("bucket", "folder/nested/skipped.txt", b"x".to_vec());
    cloud.add_object("bucket", "other/ignored.txt", b"x".to_vec());
    let folder = GcsPath::parse("gs://bucket/folder").unwrap();

    let manifest = generate_manifest(&cloud, &folder, &[]).await.unwrap();

    assert_eq!(
      manifest,
      "SHA1(afile1.txt)= a9993e364706816aba3e25717850c26c9cd0d89d\n\
       SHA1(afile2.txt)= da39a3ee5e6b4b0d3255bfef95601890afd80709\n"
    );
    let lines: Vec<&str> = manifest.lines().collect();
    assert_eq!(lines.len(), 2);
    for line in lines {
      let digest = line.rsplit("= ").next().unwrap();
      assert_eq!(digest.len(), 40);
      assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }
  }

  #[test]
  fn test_entry_name_skips_objects_outside_the_folder() {
    assert_eq!(entry_name("out/disk-1.vmdk", "out/", &[]), Some("disk-1.vmdk"));
    assert_eq!(entry_name("o", "out/", &[]), None);
    assert_eq!(entry_name("other/disk-1.vmdk", "out/", &[]), None);
    assert_eq!(entry_name("out/", "out/", &[]), None);
    assert_eq!(entry_name("out/nested/a", "out/", &[]), None);
    assert_eq!(entry_name("out/vm.mf", "out/", &["vm.mf"]), None);
  }

  #[tokio::test]
  async fn test_write_manifest_skips_itself() {
    let cloud = EmulatorCloud::new("p", "z");
    cloud.add_object("bucket", "out/vm.mf", b"stale".to_vec());
    cloud.add_object("bucket", "out/disk-1.vmdk", b"abc".to_vec());
    let folder = GcsPath::parse("gs://bucket/out/").unwrap();

    let path = write_manifest(&cloud, &folder, "vm.mf").await.unwrap();

    assert_eq!(path.to_string(), "gs://bucket/out/vm.mf");
    let written = String::from_utf8(cloud.object("bucket", "out/vm.mf").unwrap()).unwrap();
    assert_eq!(
      written,
      "SHA1(disk-1.vmdk)= a9993e364706816aba3e25717850c26c9cd0d89d\n"
    );
  }
}
