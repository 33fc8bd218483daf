//! In-process cloud emulator.
//!
//! `EmulatorCloud` keeps every resource in memory and implements all
//! collaborator traits. Serial console output can be scripted per instance
//! name prefix so that worker instances "print" their results when they boot,
//! failures can be injected per operation, and every mutating call is
//! recorded for assertions. The state serializes to JSON so the CLI can carry
//! it across invocations.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::{Clients, ComputeClient, Inspector, MetadataClient, StorageClient};
use crate::error::ApiError;
use crate::inspect::InspectionResult;
use crate::model::{
  AttachedDisk, Disk, Image, Instance, InstanceStatus, MachineImage, MachineType, ObjectAttrs,
  SerialPortOutput, Snapshot, add_guest_os_feature,
};
use crate::path::{
  GcsPath, GlobalResource, ZonalResource, disk_uri, image_uri, instance_uri, machine_image_uri,
  resource_name, snapshot_uri,
};

const GIB: u64 = 1 << 30;
const DEFAULT_DISK_SIZE_GB: i64 = 10;

/// Serial output written to an instance's console whenever an instance whose
/// name starts with `instance_prefix` boots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BootScript {
  pub instance_prefix: String,
  pub port: i64,
  pub output: String,
}

/// A failure returned by the operation `operation` for resources named
/// `name`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InjectedFailure {
  pub operation: String,
  pub name: String,
  pub message: String,
}

/// Extra time the operation `operation` takes for resources named `name`,
/// after its effect is already visible.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InjectedLatency {
  pub operation: String,
  pub name: String,
  pub delay: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoredObject {
  pub name: String,
  pub data: Vec<u8>,
}

/// Everything the emulator knows. Resources are keyed by their URI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmulatorState {
  pub project: String,
  pub zone: String,
  pub on_gce: bool,
  pub zones: Vec<String>,
  pub networks: Vec<String>,
  pub subnetworks: BTreeMap<String, Vec<String>>,
  pub disks: BTreeMap<String, Disk>,
  pub instances: BTreeMap<String, Instance>,
  pub images: BTreeMap<String, Image>,
  pub snapshots: BTreeMap<String, Snapshot>,
  pub machine_images: BTreeMap<String, MachineImage>,
  pub serial: BTreeMap<String, BTreeMap<i64, String>>,
  pub boot_scripts: Vec<BootScript>,
  pub objects: BTreeMap<String, Vec<StoredObject>>,
  pub inspection: Option<InspectionResult>,
  pub failures: Vec<InjectedFailure>,
  #[serde(skip)]
  pub latencies: Vec<InjectedLatency>,
  #[serde(skip)]
  pub calls: Vec<String>,
}

/// Cheaply cloneable handle to a shared emulated cloud.
#[derive(Debug, Clone, Default)]
pub struct EmulatorCloud {
  state: Arc<Mutex<EmulatorState>>,
}

impl EmulatorCloud {
  /// Create an empty cloud whose metadata server reports `project`/`zone`.
  pub fn new(project: impl Into<String>, zone: impl Into<String>) -> Self {
    let zone = zone.into();
    Self::from_state(EmulatorState {
      project: project.into(),
      zones: vec![zone.clone()],
      networks: vec!["default".to_string()],
      zone,
      ..Default::default()
    })
  }

  pub fn from_state(state: EmulatorState) -> Self {
    Self {
      state: Arc::new(Mutex::new(state)),
    }
  }

  /// Load state saved by [`EmulatorCloud::save`].
  pub async fn load(path: &Path) -> Result<Self, ApiError> {
    let content = tokio::fs::read_to_string(path)
      .await
      .map_err(|e| ApiError::other(format!("failed to read {}: {}", path.display(), e)))?;
    let state: EmulatorState = serde_json::from_str(&content)
      .map_err(|e| ApiError::other(format!("failed to parse {}: {}", path.display(), e)))?;
    Ok(Self::from_state(state))
  }

  pub async fn save(&self, path: &Path) -> Result<(), ApiError> {
    let content = serde_json::to_string_pretty(&*self.lock())
      .map_err(|e| ApiError::other(format!("failed to serialize emulator state: {}", e)))?;
    tokio::fs::write(path, content)
      .await
      .map_err(|e| ApiError::other(format!("failed to write {}: {}", path.display(), e)))
  }

  fn lock(&self) -> MutexGuard<'_, EmulatorState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// A client bundle where every collaborator is this emulator.
  pub fn clients(&self) -> Clients {
    Clients {
      compute: Arc::new(self.clone()),
      storage: Arc::new(self.clone()),
      metadata: Arc::new(self.clone()),
      inspector: Arc::new(self.clone()),
    }
  }

  /// Snapshot of the full state.
  pub fn state(&self) -> EmulatorState {
    self.lock().clone()
  }

  /// Mutating calls received so far, e.g. `create_disk disk-1`.
  pub fn calls(&self) -> Vec<String> {
    self.lock().calls.clone()
  }

  pub fn set_on_gce(&self, on_gce: bool) {
    self.lock().on_gce = on_gce;
  }

  pub fn add_image(&self, project: &str, mut image: Image) {
    let uri = image_uri(project, &image.name);
    image.self_link = Some(uri.clone());
    self.lock().images.insert(uri, image);
  }

  pub fn add_disk(&self, project: &str, zone: &str, mut disk: Disk) {
    let uri = disk_uri(project, zone, &disk.name);
    disk.self_link = Some(uri.clone());
    if disk.size_gb.is_none() {
      disk.size_gb = Some(DEFAULT_DISK_SIZE_GB);
    }
    self.lock().disks.insert(uri, disk);
  }

  /// Insert an instance as-is; attached disks must already exist and are
  /// marked as used by it.
  pub fn add_instance(&self, project: &str, zone: &str, mut instance: Instance) {
    let uri = instance_uri(project, zone, &instance.name);
    instance.self_link = Some(uri.clone());
    let mut state = self.lock();
    for attached in instance.disks.iter_mut() {
      let key = resolve_disk_key(project, zone, &attached.source);
      if let Some(disk) = state.disks.get_mut(&key) {
        disk.users.push(uri.clone());
      }
      if attached.device_name.is_none() {
        attached.device_name = Some(resource_name(&key).to_string());
      }
      attached.source = key;
    }
    state.instances.insert(uri, instance);
  }

  pub fn add_object(&self, bucket: &str, name: &str, data: impl Into<Vec<u8>>) {
    let mut state = self.lock();
    put_object(&mut state, bucket, name, data.into());
  }

  pub fn add_subnetwork(&self, region: &str, name: &str) {
    self
      .lock()
      .subnetworks
      .entry(region.to_string())
      .or_default()
      .push(name.to_string());
  }

  /// Append text to an instance's serial port.
  pub fn push_serial_output(&self, project: &str, zone: &str, instance: &str, port: i64, text: &str) {
    let uri = instance_uri(project, zone, instance);
    self
      .lock()
      .serial
      .entry(uri)
      .or_default()
      .entry(port)
      .or_default()
      .push_str(text);
  }

  /// Print `output` on `port` whenever an instance named `prefix*` boots.
  pub fn on_boot(&self, instance_prefix: &str, port: i64, output: &str) {
    self.lock().boot_scripts.push(BootScript {
      instance_prefix: instance_prefix.to_string(),
      port,
      output: output.to_string(),
    });
  }

  pub fn set_inspection_result(&self, result: InspectionResult) {
    self.lock().inspection = Some(result);
  }

  /// Make `operation` fail for resources named `name` (`*` matches all).
  pub fn fail_on(&self, operation: &str, name: &str, message: &str) {
    self.lock().failures.push(InjectedFailure {
      operation: operation.to_string(),
      name: name.to_string(),
      message: message.to_string(),
    });
  }

  pub fn clear_failures(&self) {
    self.lock().failures.clear();
  }

  /// Make `operation` on resources named `name` (`*` matches all) take
  /// `delay` longer to return. Only `create_disk` honours it.
  pub fn slow_on(&self, operation: &str, name: &str, delay: Duration) {
    self.lock().latencies.push(InjectedLatency {
      operation: operation.to_string(),
      name: name.to_string(),
      delay,
    });
  }

  /// Wait out any latency injected for this call.
  async fn settle(&self, operation: &str, name: &str) {
    let delay = self
      .lock()
      .latencies
      .iter()
      .find(|l| l.operation == operation && (l.name == name || l.name == "*"))
      .map(|l| l.delay);
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
  }

  pub fn disk(&self, project: &str, zone: &str, name: &str) -> Option<Disk> {
    self.lock().disks.get(&disk_uri(project, zone, name)).cloned()
  }

  pub fn instance(&self, project: &str, zone: &str, name: &str) -> Option<Instance> {
    self
      .lock()
      .instances
      .get(&instance_uri(project, zone, name))
      .cloned()
  }

  pub fn image(&self, project: &str, name: &str) -> Option<Image> {
    self.lock().images.get(&image_uri(project, name)).cloned()
  }

  pub fn snapshot(&self, project: &str, name: &str) -> Option<Snapshot> {
    self.lock().snapshots.get(&snapshot_uri(project, name)).cloned()
  }

  pub fn machine_image(&self, project: &str, name: &str) -> Option<MachineImage> {
    self
      .lock()
      .machine_images
      .get(&machine_image_uri(project, name))
      .cloned()
  }

  pub fn object(&self, bucket: &str, name: &str) -> Option<Vec<u8>> {
    self
      .lock()
      .objects
      .get(bucket)
      .and_then(|objects| objects.iter().find(|o| o.name == name))
      .map(|o| o.data.clone())
  }
}

fn record(state: &mut EmulatorState, operation: &str, name: &str) -> Result<(), ApiError> {
  state.calls.push(format!("{} {}", operation, name));
  debug!(operation, name, "emulator call");
  let failure = state
    .failures
    .iter()
    .find(|f| f.operation == operation && (f.name == name || f.name == "*"));
  match failure {
    Some(f) => Err(ApiError::other(f.message.clone())),
    None => Ok(()),
  }
}

fn resolve_disk_key(project: &str, zone: &str, source: &str) -> String {
  match ZonalResource::parse(source, "disks") {
    Some(r) => disk_uri(&r.project, &r.zone, &r.name),
    None => disk_uri(project, zone, resource_name(source)),
  }
}

fn resolve_instance_key(project: &str, zone: &str, source: &str) -> String {
  match ZonalResource::parse(source, "instances") {
    Some(r) => instance_uri(&r.project, &r.zone, &r.name),
    None => instance_uri(project, zone, resource_name(source)),
  }
}

fn resolve_image<'a>(state: &'a EmulatorState, project: &str, source: &str) -> Option<&'a Image> {
  if source.contains("/family/") {
    let family = GlobalResource::parse(source, "images")?;
    return state
      .images
      .iter()
      .filter(|(uri, _)| uri.starts_with(&format!("projects/{}/", family.project)))
      .map(|(_, image)| image)
      .find(|image| image.family.as_deref() == Some(family.name.as_str()));
  }
  let key = match GlobalResource::parse(source, "images") {
    Some(r) => image_uri(&r.project, &r.name),
    None => image_uri(project, resource_name(source)),
  };
  state.images.get(&key)
}

fn merge_lineage(
  disk: &mut Disk,
  licenses: &[String],
  features: &[crate::model::GuestOsFeature],
) {
  for license in licenses {
    if !disk.licenses.contains(license) {
      disk.licenses.push(license.clone());
    }
  }
  for feature in features {
    add_guest_os_feature(&mut disk.guest_os_features, *feature);
  }
}

fn put_object(state: &mut EmulatorState, bucket: &str, name: &str, data: Vec<u8>) {
  let objects = state.objects.entry(bucket.to_string()).or_default();
  match objects.iter_mut().find(|o| o.name == name) {
    Some(existing) => existing.data = data,
    None => objects.push(StoredObject {
      name: name.to_string(),
      data,
    }),
  }
}

fn run_boot_scripts(state: &mut EmulatorState, uri: &str, name: &str) {
  let outputs: Vec<(i64, String)> = state
    .boot_scripts
    .iter()
    .filter(|s| name.starts_with(&s.instance_prefix))
    .map(|s| (s.port, s.output.clone()))
    .collect();
  let ports = state.serial.entry(uri.to_string()).or_default();
  for (port, output) in outputs {
    ports.entry(port).or_default().push_str(&output);
  }
}

#[async_trait]
impl ComputeClient for EmulatorCloud {
  async fn create_disk(&self, project: &str, zone: &str, disk: &Disk) -> Result<(), ApiError> {
    {
      let mut state = self.lock();
      record(&mut state, "create_disk", &disk.name)?;
      let uri = disk_uri(project, zone, &disk.name);
      if state.disks.contains_key(&uri) {
        return Err(ApiError::AlreadyExists { resource: uri });
      }

      let mut created = disk.clone();
      created.self_link = Some(uri.clone());
      created.users.clear();
      let mut source_size = None;

      if let Some(source) = &disk.source_image {
        let image = resolve_image(&state, project, source)
          .ok_or_else(|| ApiError::not_found(source.clone()))?;
        merge_lineage(&mut created, &image.licenses, &image.guest_os_features);
        source_size = image.disk_size_gb;
      }
      if let Some(source) = &disk.source_disk {
        let key = resolve_disk_key(project, zone, source);
        let parent = state
          .disks
          .get(&key)
          .ok_or_else(|| ApiError::not_found(source.clone()))?;
        let (licenses, features) = (parent.licenses.clone(), parent.guest_os_features.clone());
        source_size = parent.size_gb;
        merge_lineage(&mut created, &licenses, &features);
      }
      if let Some(source) = &disk.source_snapshot {
        let key = match GlobalResource::parse(source, "snapshots") {
          Some(r) => snapshot_uri(&r.project, &r.name),
          None => snapshot_uri(project, resource_name(source)),
        };
        let snapshot = state
          .snapshots
          .get(&key)
          .ok_or_else(|| ApiError::not_found(source.clone()))?;
        let (licenses, features) = (snapshot.licenses.clone(), snapshot.guest_os_features.clone());
        source_size = snapshot.disk_size_gb;
        merge_lineage(&mut created, &licenses, &features);
      }
      if let Some(source) = &disk.source_storage_object {
        let path = GcsPath::parse_object(source)?;
        let object = state
          .objects
          .get(&path.bucket)
          .and_then(|objects| objects.iter().find(|o| o.name == path.object))
          .ok_or_else(|| ApiError::not_found(source.clone()))?;
        let gb = (object.data.len() as u64).div_ceil(GIB) as i64;
        source_size = Some(gb.max(DEFAULT_DISK_SIZE_GB));
      }

      created.size_gb = match (disk.size_gb, source_size) {
        (Some(requested), _) => Some(requested),
        (None, Some(size)) => Some(size),
        (None, None) => Some(DEFAULT_DISK_SIZE_GB),
      };
      state.disks.insert(uri, created);
    }
    self.settle("create_disk", &disk.name).await;
    Ok(())
  }

  async fn get_disk(&self, project: &str, zone: &str, name: &str) -> Result<Disk, ApiError> {
    let uri = disk_uri(project, zone, name);
    self
      .lock()
      .disks
      .get(&uri)
      .cloned()
      .ok_or(ApiError::NotFound { resource: uri })
  }

  async fn delete_disk(&self, project: &str, zone: &str, name: &str) -> Result<(), ApiError> {
    let mut state = self.lock();
    record(&mut state, "delete_disk", name)?;
    let uri = disk_uri(project, zone, name);
    let disk = state
      .disks
      .get(&uri)
      .ok_or_else(|| ApiError::not_found(uri.clone()))?;
    if let Some(user) = disk.users.first() {
      return Err(ApiError::InUse {
        resource: uri,
        user: user.clone(),
      });
    }
    state.disks.remove(&uri);
    Ok(())
  }

  async fn create_instance(
    &self,
    project: &str,
    zone: &str,
    instance: &Instance,
  ) -> Result<(), ApiError> {
    let mut state = self.lock();
    record(&mut state, "create_instance", &instance.name)?;
    let uri = instance_uri(project, zone, &instance.name);
    if state.instances.contains_key(&uri) {
      return Err(ApiError::AlreadyExists { resource: uri });
    }

    let mut created = instance.clone();
    for attached in created.disks.iter_mut() {
      let key = resolve_disk_key(project, zone, &attached.source);
      if !state.disks.contains_key(&key) {
        return Err(ApiError::not_found(key));
      }
      if attached.device_name.is_none() {
        attached.device_name = Some(resource_name(&key).to_string());
      }
      attached.source = key;
    }
    for attached in &created.disks {
      if let Some(disk) = state.disks.get_mut(&attached.source) {
        disk.users.push(uri.clone());
      }
    }
    created.status = InstanceStatus::Running;
    created.self_link = Some(uri.clone());
    state.instances.insert(uri.clone(), created);
    run_boot_scripts(&mut state, &uri, &instance.name);
    Ok(())
  }

  async fn get_instance(
    &self,
    project: &str,
    zone: &str,
    name: &str,
  ) -> Result<Instance, ApiError> {
    let uri = instance_uri(project, zone, name);
    self
      .lock()
      .instances
      .get(&uri)
      .cloned()
      .ok_or(ApiError::NotFound { resource: uri })
  }

  async fn delete_instance(&self, project: &str, zone: &str, name: &str) -> Result<(), ApiError> {
    let mut state = self.lock();
    record(&mut state, "delete_instance", name)?;
    let uri = instance_uri(project, zone, name);
    let instance = state
      .instances
      .remove(&uri)
      .ok_or_else(|| ApiError::not_found(uri.clone()))?;
    for attached in &instance.disks {
      let delete = match state.disks.get_mut(&attached.source) {
        Some(disk) => {
          disk.users.retain(|u| u != &uri);
          attached.auto_delete && disk.users.is_empty()
        }
        None => false,
      };
      if delete {
        state.disks.remove(&attached.source);
      }
    }
    state.serial.remove(&uri);
    Ok(())
  }

  async fn start_instance(&self, project: &str, zone: &str, name: &str) -> Result<(), ApiError> {
    let mut state = self.lock();
    record(&mut state, "start_instance", name)?;
    let uri = instance_uri(project, zone, name);
    let instance = state
      .instances
      .get_mut(&uri)
      .ok_or_else(|| ApiError::not_found(uri.clone()))?;
    instance.status = InstanceStatus::Running;
    run_boot_scripts(&mut state, &uri, name);
    Ok(())
  }

  async fn stop_instance(&self, project: &str, zone: &str, name: &str) -> Result<(), ApiError> {
    let mut state = self.lock();
    record(&mut state, "stop_instance", name)?;
    let uri = instance_uri(project, zone, name);
    let instance = state
      .instances
      .get_mut(&uri)
      .ok_or_else(|| ApiError::not_found(uri.clone()))?;
    instance.status = InstanceStatus::Terminated;
    // The console starts empty on the next boot.
    state.serial.remove(&uri);
    Ok(())
  }

  async fn attach_disk(
    &self,
    project: &str,
    zone: &str,
    instance: &str,
    disk: &AttachedDisk,
  ) -> Result<(), ApiError> {
    let mut state = self.lock();
    record(&mut state, "attach_disk", resource_name(&disk.source))?;
    let uri = instance_uri(project, zone, instance);
    let key = resolve_disk_key(project, zone, &disk.source);
    if !state.disks.contains_key(&key) {
      return Err(ApiError::not_found(key));
    }
    let device_name = disk
      .device_name
      .clone()
      .unwrap_or_else(|| resource_name(&key).to_string());
    let target = state
      .instances
      .get_mut(&uri)
      .ok_or_else(|| ApiError::not_found(uri.clone()))?;
    if target
      .disks
      .iter()
      .any(|d| d.device_name.as_deref() == Some(device_name.as_str()))
    {
      return Err(ApiError::invalid(format!(
        "device name {} is already in use on {}",
        device_name, instance
      )));
    }
    let mut attached = disk.clone();
    attached.source = key.clone();
    attached.device_name = Some(device_name);
    target.disks.push(attached);
    if let Some(d) = state.disks.get_mut(&key) {
      d.users.push(uri);
    }
    Ok(())
  }

  async fn detach_disk(
    &self,
    project: &str,
    zone: &str,
    instance: &str,
    device_name: &str,
  ) -> Result<(), ApiError> {
    let mut state = self.lock();
    record(&mut state, "detach_disk", device_name)?;
    let uri = instance_uri(project, zone, instance);
    let target = state
      .instances
      .get_mut(&uri)
      .ok_or_else(|| ApiError::not_found(uri.clone()))?;
    let position = target
      .disks
      .iter()
      .position(|d| d.device_name.as_deref() == Some(device_name))
      .ok_or_else(|| ApiError::not_found(format!("{}/{}", uri, device_name)))?;
    let removed = target.disks.remove(position);
    if let Some(disk) = state.disks.get_mut(&removed.source) {
      disk.users.retain(|u| u != &uri);
    }
    Ok(())
  }

  async fn set_instance_metadata(
    &self,
    project: &str,
    zone: &str,
    instance: &str,
    metadata: &BTreeMap<String, String>,
  ) -> Result<(), ApiError> {
    let mut state = self.lock();
    record(&mut state, "set_instance_metadata", instance)?;
    let uri = instance_uri(project, zone, instance);
    let target = state
      .instances
      .get_mut(&uri)
      .ok_or_else(|| ApiError::not_found(uri.clone()))?;
    target.metadata = metadata.clone();
    Ok(())
  }

  async fn create_image(&self, project: &str, image: &Image) -> Result<(), ApiError> {
    let mut state = self.lock();
    record(&mut state, "create_image", &image.name)?;
    let uri = image_uri(project, &image.name);
    if state.images.contains_key(&uri) {
      return Err(ApiError::AlreadyExists { resource: uri });
    }
    let mut created = image.clone();
    if let Some(source) = &image.source_disk {
      let key = match ZonalResource::parse(source, "disks") {
        Some(r) => disk_uri(&r.project, &r.zone, &r.name),
        None => return Err(ApiError::invalid(format!("source disk {} must be a URI", source))),
      };
      let disk = state
        .disks
        .get(&key)
        .ok_or_else(|| ApiError::not_found(key.clone()))?;
      for license in &disk.licenses {
        if !created.licenses.contains(license) {
          created.licenses.push(license.clone());
        }
      }
      for feature in &disk.guest_os_features {
        add_guest_os_feature(&mut created.guest_os_features, *feature);
      }
      created.disk_size_gb = disk.size_gb;
    }
    if let Some(source) = &image.source_image {
      let parent = resolve_image(&state, project, source)
        .ok_or_else(|| ApiError::not_found(source.clone()))?
        .clone();
      for license in parent.licenses {
        if !created.licenses.contains(&license) {
          created.licenses.push(license);
        }
      }
      for feature in parent.guest_os_features {
        add_guest_os_feature(&mut created.guest_os_features, feature);
      }
      created.disk_size_gb = parent.disk_size_gb;
    }
    created.self_link = Some(uri.clone());
    state.images.insert(uri, created);
    Ok(())
  }

  async fn get_image(&self, project: &str, name: &str) -> Result<Image, ApiError> {
    let uri = image_uri(project, name);
    self
      .lock()
      .images
      .get(&uri)
      .cloned()
      .ok_or(ApiError::NotFound { resource: uri })
  }

  async fn delete_image(&self, project: &str, name: &str) -> Result<(), ApiError> {
    let mut state = self.lock();
    record(&mut state, "delete_image", name)?;
    let uri = image_uri(project, name);
    state
      .images
      .remove(&uri)
      .map(|_| ())
      .ok_or(ApiError::NotFound { resource: uri })
  }

  async fn create_snapshot(
    &self,
    project: &str,
    zone: &str,
    disk: &str,
    snapshot: &Snapshot,
  ) -> Result<(), ApiError> {
    let mut state = self.lock();
    record(&mut state, "create_snapshot", &snapshot.name)?;
    let uri = snapshot_uri(project, &snapshot.name);
    if state.snapshots.contains_key(&uri) {
      return Err(ApiError::AlreadyExists { resource: uri });
    }
    let key = resolve_disk_key(project, zone, disk);
    let source = state
      .disks
      .get(&key)
      .ok_or_else(|| ApiError::not_found(key.clone()))?;
    let mut created = snapshot.clone();
    created.source_disk = key.clone();
    created.licenses = source.licenses.clone();
    created.guest_os_features = source.guest_os_features.clone();
    created.disk_size_gb = source.size_gb;
    created.self_link = Some(uri.clone());
    state.snapshots.insert(uri, created);
    Ok(())
  }

  async fn delete_snapshot(&self, project: &str, name: &str) -> Result<(), ApiError> {
    let mut state = self.lock();
    record(&mut state, "delete_snapshot", name)?;
    let uri = snapshot_uri(project, name);
    state
      .snapshots
      .remove(&uri)
      .map(|_| ())
      .ok_or(ApiError::NotFound { resource: uri })
  }

  async fn create_machine_image(
    &self,
    project: &str,
    machine_image: &MachineImage,
  ) -> Result<(), ApiError> {
    let mut state = self.lock();
    record(&mut state, "create_machine_image", &machine_image.name)?;
    let uri = machine_image_uri(project, &machine_image.name);
    if state.machine_images.contains_key(&uri) {
      return Err(ApiError::AlreadyExists { resource: uri });
    }
    let (default_zone, source) = (state.zone.clone(), machine_image.source_instance.clone());
    let key = resolve_instance_key(project, &default_zone, &source);
    if !state.instances.contains_key(&key) {
      return Err(ApiError::not_found(key));
    }
    let mut created = machine_image.clone();
    created.source_instance = key;
    created.self_link = Some(uri.clone());
    state.machine_images.insert(uri, created);
    Ok(())
  }

  async fn delete_machine_image(&self, project: &str, name: &str) -> Result<(), ApiError> {
    let mut state = self.lock();
    record(&mut state, "delete_machine_image", name)?;
    let uri = machine_image_uri(project, name);
    state
      .machine_images
      .remove(&uri)
      .map(|_| ())
      .ok_or(ApiError::NotFound { resource: uri })
  }

  async fn get_serial_port_output(
    &self,
    project: &str,
    zone: &str,
    instance: &str,
    port: i64,
    start: i64,
  ) -> Result<SerialPortOutput, ApiError> {
    let state = self.lock();
    let uri = instance_uri(project, zone, instance);
    if !state.instances.contains_key(&uri) {
      return Err(ApiError::NotFound { resource: uri });
    }
    let text = state
      .serial
      .get(&uri)
      .and_then(|ports| ports.get(&port))
      .map(String::as_str)
      .unwrap_or("");
    let start = usize::try_from(start).unwrap_or(0).min(text.len());
    Ok(SerialPortOutput {
      contents: text.get(start..).unwrap_or("").to_string(),
      next: text.len() as i64,
    })
  }

  async fn get_machine_type(
    &self,
    _project: &str,
    _zone: &str,
    name: &str,
  ) -> Result<MachineType, ApiError> {
    Ok(MachineType {
      name: name.to_string(),
      guest_cpus: 2,
      memory_mb: 7680,
    })
  }

  async fn list_zones(&self, _project: &str) -> Result<Vec<String>, ApiError> {
    Ok(self.lock().zones.clone())
  }

  async fn list_networks(&self, _project: &str) -> Result<Vec<String>, ApiError> {
    Ok(self.lock().networks.clone())
  }

  async fn list_subnetworks(&self, _project: &str, region: &str) -> Result<Vec<String>, ApiError> {
    Ok(
      self
        .lock()
        .subnetworks
        .get(region)
        .cloned()
        .unwrap_or_default(),
    )
  }
}

#[async_trait]
impl StorageClient for EmulatorCloud {
  async fn get_object_attrs(&self, bucket: &str, object: &str) -> Result<ObjectAttrs, ApiError> {
    self
      .lock()
      .objects
      .get(bucket)
      .and_then(|objects| objects.iter().find(|o| o.name == object))
      .map(|o| ObjectAttrs {
        bucket: bucket.to_string(),
        name: o.name.clone(),
        size: o.data.len() as u64,
        content_type: None,
      })
      .ok_or_else(|| ApiError::not_found(format!("gs://{}/{}", bucket, object)))
  }

  async fn read_object(&self, bucket: &str, object: &str) -> Result<Vec<u8>, ApiError> {
    self
      .object(bucket, object)
      .ok_or_else(|| ApiError::not_found(format!("gs://{}/{}", bucket, object)))
  }

  async fn write_object(&self, bucket: &str, object: &str, data: Vec<u8>) -> Result<(), ApiError> {
    let mut state = self.lock();
    record(&mut state, "write_object", object)?;
    put_object(&mut state, bucket, object, data);
    Ok(())
  }

  async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectAttrs>, ApiError> {
    Ok(
      self
        .lock()
        .objects
        .get(bucket)
        .map(|objects| {
          objects
            .iter()
            .filter(|o| o.name.starts_with(prefix))
            .map(|o| ObjectAttrs {
              bucket: bucket.to_string(),
              name: o.name.clone(),
              size: o.data.len() as u64,
              content_type: None,
            })
            .collect()
        })
        .unwrap_or_default(),
    )
  }

  async fn compose_objects(
    &self,
    bucket: &str,
    sources: &[String],
    destination: &str,
  ) -> Result<(), ApiError> {
    let mut state = self.lock();
    record(&mut state, "compose_objects", destination)?;
    let mut data = Vec::new();
    for source in sources {
      let object = state
        .objects
        .get(bucket)
        .and_then(|objects| objects.iter().find(|o| &o.name == source))
        .ok_or_else(|| ApiError::not_found(format!("gs://{}/{}", bucket, source)))?;
      data.extend_from_slice(&object.data);
    }
    put_object(&mut state, bucket, destination, data);
    Ok(())
  }

  async fn copy_object(
    &self,
    src_bucket: &str,
    src_object: &str,
    dst_bucket: &str,
    dst_object: &str,
  ) -> Result<(), ApiError> {
    let mut state = self.lock();
    record(&mut state, "copy_object", dst_object)?;
    let data = state
      .objects
      .get(src_bucket)
      .and_then(|objects| objects.iter().find(|o| o.name == src_object))
      .map(|o| o.data.clone())
      .ok_or_else(|| ApiError::not_found(format!("gs://{}/{}", src_bucket, src_object)))?;
    put_object(&mut state, dst_bucket, dst_object, data);
    Ok(())
  }

  async fn delete_object(&self, bucket: &str, object: &str) -> Result<(), ApiError> {
    let mut state = self.lock();
    record(&mut state, "delete_object", object)?;
    let objects = state
      .objects
      .get_mut(bucket)
      .ok_or_else(|| ApiError::not_found(format!("gs://{}/{}", bucket, object)))?;
    let before = objects.len();
    objects.retain(|o| o.name != object);
    if objects.len() == before {
      return Err(ApiError::not_found(format!("gs://{}/{}", bucket, object)));
    }
    Ok(())
  }
}

#[async_trait]
impl MetadataClient for EmulatorCloud {
  async fn on_gce(&self) -> bool {
    self.lock().on_gce
  }

  async fn project_id(&self) -> Result<String, ApiError> {
    let state = self.lock();
    if !state.on_gce {
      return Err(ApiError::Unsupported {
        operation: "metadata project id (not running on GCE)".to_string(),
      });
    }
    Ok(state.project.clone())
  }

  async fn zone(&self) -> Result<String, ApiError> {
    let state = self.lock();
    if !state.on_gce {
      return Err(ApiError::Unsupported {
        operation: "metadata zone (not running on GCE)".to_string(),
      });
    }
    Ok(state.zone.clone())
  }
}

#[async_trait]
impl Inspector for EmulatorCloud {
  async fn inspect(&self, disk_uri: &str, _full: bool) -> Result<InspectionResult, ApiError> {
    let state = self.lock();
    let disk = ZonalResource::parse(disk_uri, "disks")
      .ok_or_else(|| ApiError::invalid(format!("{} is not a disk URI", disk_uri)))?;
    let key = crate::path::disk_uri(&disk.project, &disk.zone, &disk.name);
    if !state.disks.contains_key(&key) {
      return Err(ApiError::NotFound { resource: key });
    }
    state.inspection.clone().ok_or(ApiError::Unsupported {
      operation: "inspect".to_string(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::GuestOsFeature;

  const P: &str = "proj";
  const Z: &str = "us-central1-a";

  #[tokio::test]
  async fn test_disk_from_disk_inherits_features() {
    let cloud = EmulatorCloud::new(P, Z);
    cloud.add_disk(
      P,
      Z,
      Disk {
        name: "src".to_string(),
        guest_os_features: vec![GuestOsFeature::Windows],
        licenses: vec!["lic-a".to_string()],
        size_gb: Some(20),
        ..Default::default()
      },
    );

    let mut disk = Disk {
      name: "copy".to_string(),
      source_disk: Some(disk_uri(P, Z, "src")),
      ..Default::default()
    };
    disk.guest_os_features.push(GuestOsFeature::UefiCompatible);
    cloud.create_disk(P, Z, &disk).await.unwrap();

    let copy = cloud.get_disk(P, Z, "copy").await.unwrap();
    assert_eq!(copy.size_gb, Some(20));
    assert_eq!(copy.licenses, vec!["lic-a".to_string()]);
    assert!(copy.guest_os_features.contains(&GuestOsFeature::Windows));
    assert!(copy.guest_os_features.contains(&GuestOsFeature::UefiCompatible));
  }

  #[tokio::test]
  async fn test_attached_disk_cannot_be_deleted() {
    let cloud = EmulatorCloud::new(P, Z);
    cloud.add_disk(P, Z, Disk {
      name: "d".to_string(),
      ..Default::default()
    });
    let instance = Instance {
      name: "vm".to_string(),
      disks: vec![AttachedDisk {
        source: "d".to_string(),
        boot: true,
        auto_delete: true,
        ..Default::default()
      }],
      ..Default::default()
    };
    cloud.create_instance(P, Z, &instance).await.unwrap();

    let err = cloud.delete_disk(P, Z, "d").await.unwrap_err();
    assert!(matches!(err, ApiError::InUse { .. }));

    // auto_delete removes the disk with the instance
    cloud.delete_instance(P, Z, "vm").await.unwrap();
    assert!(cloud.disk(P, Z, "d").is_none());
  }

  #[tokio::test]
  async fn test_boot_scripts_and_serial_offsets() {
    let cloud = EmulatorCloud::new(P, Z);
    cloud.on_boot("worker-", 1, "line one\nline two\n");
    cloud
      .create_instance(P, Z, &Instance {
        name: "worker-abc".to_string(),
        ..Default::default()
      })
      .await
      .unwrap();

    let first = cloud
      .get_serial_port_output(P, Z, "worker-abc", 1, 0)
      .await
      .unwrap();
    assert_eq!(first.contents, "line one\nline two\n");

    let second = cloud
      .get_serial_port_output(P, Z, "worker-abc", 1, first.next)
      .await
      .unwrap();
    assert!(second.contents.is_empty());
  }

  #[tokio::test]
  async fn test_injected_failure() {
    let cloud = EmulatorCloud::new(P, Z);
    cloud.fail_on("create_disk", "bad", "quota exceeded");
    let err = cloud
      .create_disk(P, Z, &Disk {
        name: "bad".to_string(),
        ..Default::default()
      })
      .await
      .unwrap_err();
    assert_eq!(err.to_string(), "quota exceeded");
    assert_eq!(cloud.calls(), vec!["create_disk bad".to_string()]);
  }

  #[tokio::test]
  async fn test_injected_latency_after_the_disk_exists() {
    let cloud = EmulatorCloud::new(P, Z);
    cloud.slow_on("create_disk", "*", Duration::from_millis(300));
    let call = tokio::spawn({
      let cloud = cloud.clone();
      async move {
        cloud
          .create_disk(P, Z, &Disk {
            name: "slow".to_string(),
            ..Default::default()
          })
          .await
      }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cloud.disk(P, Z, "slow").is_some());
    assert!(!call.is_finished());
    call.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn test_state_round_trips_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let cloud = EmulatorCloud::new(P, Z);
    cloud.add_object("bucket", "a.txt", b"hello".to_vec());
    cloud.save(&path).await.unwrap();

    let loaded = EmulatorCloud::load(&path).await.unwrap();
    assert_eq!(loaded.object("bucket", "a.txt"), Some(b"hello".to_vec()));
  }
}
