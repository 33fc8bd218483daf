use std::time::Duration;

use vmport_compute::{AttachedDisk, Disk, EmulatorCloud, Image, Instance, InstanceStatus};
use vmport_export::{ExportArgs, ExportError, ExportSource, Exporter};
use vmport_workflow_executor::ExecutorConfig;
use vmport_workflow_utils::{EXPORT_BUILD_ID_LABEL, EXPORT_TMP_LABEL};

const PROJECT: &str = "test-project";
const ZONE: &str = "us-central1-a";

fn cloud() -> EmulatorCloud {
  let cloud = EmulatorCloud::new(PROJECT, ZONE);
  cloud.add_image(
    "compute-image-tools",
    Image {
      name: "debian-11-worker-v20240101".to_string(),
      family: Some("debian-11-worker".to_string()),
      ..Default::default()
    },
  );
  cloud
}

fn exporter(cloud: &EmulatorCloud, args: ExportArgs) -> Exporter {
  Exporter::new(args, cloud.clients()).with_executor_config(ExecutorConfig {
    poll_interval: Duration::from_millis(10),
  })
}

fn args(source: ExportSource, destination: &str) -> ExportArgs {
  let mut args = ExportArgs::new(PROJECT, ZONE, source, destination);
  args.build_id = "build9".to_string();
  args
}

fn disk_uri(name: &str) -> String {
  format!("projects/{}/zones/{}/disks/{}", PROJECT, ZONE, name)
}

#[tokio::test]
async fn test_disk_export() {
  let cloud = cloud();
  cloud.add_disk(
    PROJECT,
    ZONE,
    Disk {
      name: "data".to_string(),
      size_gb: Some(50),
      ..Default::default()
    },
  );
  cloud.on_boot("inst-export-disk", 1, "Export: uploading\nExportSuccess\n");

  let outcome = exporter(
    &cloud,
    args(ExportSource::Disk("data".to_string()), "gs://out/data.tar.gz"),
  )
  .run()
  .await
  .unwrap();

  assert_eq!(outcome.files.len(), 1);
  assert_eq!(outcome.files[0].source, disk_uri("data"));
  assert_eq!(outcome.files[0].destination, "gs://out/data.tar.gz");
  assert!(outcome.manifest.is_none());
  assert_eq!(outcome.trace_logs, vec!["Export: uploading".to_string()]);

  // Only the exported disk is left.
  let state = cloud.state();
  assert_eq!(state.disks.keys().collect::<Vec<_>>(), vec![&disk_uri("data")]);
  assert!(state.disks[&disk_uri("data")].users.is_empty());
  assert!(state.instances.is_empty());
}

#[tokio::test]
async fn test_workers_are_labelled() {
  let cloud = cloud();
  cloud.add_disk(
    PROJECT,
    ZONE,
    Disk {
      name: "data".to_string(),
      ..Default::default()
    },
  );
  // The worker never finishes; inspect it while it runs.
  let exporter = std::sync::Arc::new(exporter(
    &cloud,
    args(ExportSource::Disk("data".to_string()), "gs://out/data.tar.gz"),
  ));
  let task = tokio::spawn({
    let exporter = exporter.clone();
    async move { exporter.run().await }
  });

  let worker = loop {
    let state = cloud.state();
    if let Some(instance) = state.instances.values().next() {
      break instance.clone();
    }
    drop(state);
    tokio::time::sleep(Duration::from_millis(5)).await;
  };
  assert_eq!(worker.labels.get(EXPORT_TMP_LABEL).map(String::as_str), Some("true"));
  assert_eq!(
    worker.labels.get(EXPORT_BUILD_ID_LABEL).map(String::as_str),
    Some("build9")
  );

  exporter.cancel("done looking");
  let err = task.await.unwrap().unwrap_err();
  assert!(err.is_cancelled());
  assert!(cloud.state().instances.is_empty());
}

#[tokio::test]
async fn test_image_export_removes_temporary_disk() {
  let cloud = cloud();
  cloud.add_image(
    PROJECT,
    Image {
      name: "golden".to_string(),
      disk_size_gb: Some(20),
      ..Default::default()
    },
  );
  cloud.on_boot("inst-export-disk", 1, "ExportSuccess\n");

  let mut export_args = args(ExportSource::Image("golden".to_string()), "gs://out/golden.vmdk");
  export_args.format = Some("vmdk".to_string());
  let outcome = exporter(&cloud, export_args).run().await.unwrap();

  assert_eq!(
    outcome.files[0].source,
    format!("projects/{}/global/images/golden", PROJECT)
  );
  let state = cloud.state();
  assert!(state.disks.is_empty());
  assert!(state.instances.is_empty());
  assert!(
    cloud
      .calls()
      .iter()
      .any(|c| c.starts_with("create_disk disk-image-export-"))
  );
}

#[tokio::test]
async fn test_instance_export_writes_manifest_and_restarts() {
  let cloud = cloud();
  for name in ["vm-boot", "vm-data"] {
    cloud.add_disk(
      PROJECT,
      ZONE,
      Disk {
        name: name.to_string(),
        ..Default::default()
      },
    );
  }
  cloud.add_instance(
    PROJECT,
    ZONE,
    Instance {
      name: "vm".to_string(),
      disks: vec![
        AttachedDisk {
          source: "vm-boot".to_string(),
          boot: true,
          ..Default::default()
        },
        AttachedDisk {
          source: "vm-data".to_string(),
          ..Default::default()
        },
      ],
      ..Default::default()
    },
  );
  cloud.on_boot("inst-export-disk", 1, "ExportSuccess\n");
  // What the workers upload.
  cloud.add_object("out", "vm/vm-boot.vmdk", b"abc".to_vec());
  cloud.add_object("out", "vm/vm-data.vmdk", b"".to_vec());

  let outcome = exporter(&cloud, args(ExportSource::Instance("vm".to_string()), "gs://out/vm"))
    .run()
    .await
    .unwrap();

  let destinations: Vec<&str> = outcome.files.iter().map(|f| f.destination.as_str()).collect();
  assert_eq!(
    destinations,
    vec!["gs://out/vm/vm-boot.vmdk", "gs://out/vm/vm-data.vmdk"]
  );
  assert_eq!(outcome.manifest.as_deref(), Some("gs://out/vm/vm.mf"));
  let manifest = String::from_utf8(cloud.object("out", "vm/vm.mf").unwrap()).unwrap();
  assert_eq!(
    manifest,
    "SHA1(vm-boot.vmdk)= a9993e364706816aba3e25717850c26c9cd0d89d\n\
     SHA1(vm-data.vmdk)= da39a3ee5e6b4b0d3255bfef95601890afd80709\n"
  );

  let calls = cloud.calls();
  let stop = calls.iter().position(|c| c == "stop_instance vm").unwrap();
  let start = calls.iter().position(|c| c == "start_instance vm").unwrap();
  assert!(stop < start);
  let vm = cloud.instance(PROJECT, ZONE, "vm").unwrap();
  assert_eq!(vm.status, InstanceStatus::Running);
  // Two workers, both gone.
  assert_eq!(
    calls
      .iter()
      .filter(|c| c.starts_with("create_instance inst-export-disk-"))
      .count(),
    2
  );
  assert_eq!(cloud.state().instances.len(), 1);
}

#[tokio::test]
async fn test_failed_export_still_restarts_instance() {
  let cloud = cloud();
  cloud.add_disk(
    PROJECT,
    ZONE,
    Disk {
      name: "vm-boot".to_string(),
      ..Default::default()
    },
  );
  cloud.add_instance(
    PROJECT,
    ZONE,
    Instance {
      name: "vm".to_string(),
      disks: vec![AttachedDisk {
        source: "vm-boot".to_string(),
        boot: true,
        ..Default::default()
      }],
      ..Default::default()
    },
  );
  cloud.on_boot("inst-export-disk", 1, "ExportFailed: qemu-img convert failed\n");

  let err = exporter(&cloud, args(ExportSource::Instance("vm".to_string()), "gs://out/vm"))
    .run()
    .await
    .unwrap_err();

  assert!(matches!(err, ExportError::Workflow(_)));
  assert!(err.to_string().contains("qemu-img convert failed"));
  assert_eq!(
    cloud.instance(PROJECT, ZONE, "vm").unwrap().status,
    InstanceStatus::Running
  );
  assert!(cloud.object("out", "vm/vm.mf").is_none());
  let state = cloud.state();
  assert_eq!(state.instances.len(), 1);
  assert_eq!(state.disks.len(), 1);
}

#[tokio::test]
async fn test_missing_source_disk() {
  let cloud = cloud();
  let err = exporter(
    &cloud,
    args(ExportSource::Disk("nope".to_string()), "gs://out/d.tar.gz"),
  )
  .run()
  .await
  .unwrap_err();

  assert!(matches!(err, ExportError::Api { operation: "get_disk", .. }));
  assert!(cloud.calls().iter().all(|c| !c.starts_with("create_")));
}

#[tokio::test]
async fn test_invalid_destination_is_rejected_up_front() {
  let cloud = cloud();
  let err = exporter(&cloud, args(ExportSource::Disk("d".to_string()), "/tmp/d.tar.gz"))
    .run()
    .await
    .unwrap_err();
  assert!(matches!(err, ExportError::InvalidArgs { .. }));
  assert!(cloud.calls().is_empty());
}
