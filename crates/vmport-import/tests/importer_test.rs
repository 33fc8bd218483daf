use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use vmport_compute::{
  DetectedOs, Disk, EmulatorCloud, GuestOsFeature, Image, InspectionResult,
};
use vmport_import::{
  ApiInflater, DATA_DISK_LICENSE, ImportArgs, ImportContext, ImportError, ImportSource, Importer,
  InflationMethod, Inflater, MetadataProcessor, PersistentDisk, ProcessPlanner, ProcessingPlan,
  Processor,
};
use vmport_workflow_executor::{ExecutorConfig, serial_tag};
use vmport_workflow_utils::{IMPORT_BUILD_ID_LABEL, IMPORT_LABEL};

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
  cloud.add_object("imports", "disk.vmdk", vec![0u8; 4096]);
  cloud
}

fn file_args() -> ImportArgs {
  let source = ImportSource::from_flags(Some("gs://imports/disk.vmdk"), None).unwrap();
  let mut args = ImportArgs::new(PROJECT, ZONE, "my-image", source);
  args.build_id = "build123".to_string();
  args
}

fn context(cloud: &EmulatorCloud, args: ImportArgs) -> ImportContext {
  ImportContext::new(args, cloud.clients()).with_executor_config(ExecutorConfig {
    poll_interval: Duration::from_millis(10),
  })
}

fn detected(distro: &str, major: &str, minor: &str) -> Option<DetectedOs> {
  Some(DetectedOs {
    distro: distro.to_string(),
    major_version: major.to_string(),
    minor_version: minor.to_string(),
    architecture: "x64".to_string(),
  })
}

fn inspection(distro: &str, major: &str, minor: &str) -> InspectionResult {
  InspectionResult {
    os_count: 1,
    os: detected(distro, major, minor),
    bios_bootable: true,
    ..Default::default()
  }
}

fn script_import_worker(cloud: &EmulatorCloud) {
  let output = format!(
    "Import: converting [Privacy->disk.vmdk<-Privacy]\n{}\n{}\n{}\nImportSuccess\n",
    serial_tag("target-size-gb", "12"),
    serial_tag("source-size-gb", "3"),
    serial_tag("import-file-format", "vmdk"),
  );
  cloud.on_boot("inst-importer", 1, &output);
}

fn script_translate_worker(cloud: &EmulatorCloud) {
  cloud.on_boot(
    "inst-translate",
    1,
    "Translate: installing packages on [Privacy->db01<-Privacy]\nTranslateSuccess\n",
  );
}

/// Nothing but the published image survives an import.
fn assert_cleaned_up(cloud: &EmulatorCloud) {
  let state = cloud.state();
  assert!(state.disks.is_empty(), "disks left behind: {:?}", state.disks.keys());
  assert!(
    state.instances.is_empty(),
    "instances left behind: {:?}",
    state.instances.keys()
  );
}

fn has_feature(image: &Image, feature: GuestOsFeature) -> bool {
  image.guest_os_features.contains(&feature)
}

#[tokio::test]
async fn test_file_import_with_explicit_os() {
  let cloud = cloud();
  script_import_worker(&cloud);
  script_translate_worker(&cloud);
  cloud.set_inspection_result(inspection("ubuntu", "18", "04"));

  let mut args = file_args();
  args.os = Some("ubuntu-1804".to_string());
  args.family = Some("my-family".to_string());
  let importer = Importer::new(context(&cloud, args));

  let outcome = importer.run().await.unwrap();

  assert_eq!(
    outcome.image_uri,
    format!("projects/{}/global/images/my-image", PROJECT)
  );
  assert_eq!(outcome.disk.size_gb, 12);
  assert_eq!(outcome.disk.source_size_gb, 3);
  assert_eq!(outcome.disk.source_type, "vmdk");
  assert_eq!(outcome.plan.os.as_deref(), Some("ubuntu-1804"));

  let image = cloud.image(PROJECT, "my-image").unwrap();
  assert_eq!(image.family.as_deref(), Some("my-family"));
  assert!(
    image
      .licenses
      .contains(&"projects/ubuntu-os-cloud/global/licenses/ubuntu-1804-lts".to_string())
  );
  assert!(!has_feature(&image, GuestOsFeature::UefiCompatible));
  assert_eq!(image.labels.get(IMPORT_LABEL).map(String::as_str), Some("true"));
  assert_eq!(
    image.labels.get(IMPORT_BUILD_ID_LABEL).map(String::as_str),
    Some("build123")
  );

  assert_cleaned_up(&cloud);

  let logs = outcome.trace_logs;
  assert!(logs.iter().any(|l| l.starts_with("Import: converting")));
  // Translate output is recorded without the private parts.
  assert!(logs.iter().any(|l| l.starts_with("Translate: installing")));
  assert!(logs.iter().all(|l| !l.contains("db01")));
}

#[tokio::test]
async fn test_detected_uefi_os_is_used() {
  let cloud = cloud();
  script_import_worker(&cloud);
  script_translate_worker(&cloud);
  cloud.set_inspection_result(InspectionResult {
    os_count: 1,
    os: detected("ubuntu", "20", "04"),
    has_efi_partition: true,
    uefi_bootable: true,
    bios_bootable: false,
  });

  let outcome = Importer::new(context(&cloud, file_args())).run().await.unwrap();

  assert_eq!(outcome.plan.os.as_deref(), Some("ubuntu-2004"));
  assert_eq!(outcome.plan.detected_os.as_deref(), Some("ubuntu-2004"));
  assert!(outcome.plan.uefi);
  assert!(outcome.disk.is_uefi_detected);
  let image = cloud.image(PROJECT, "my-image").unwrap();
  assert!(has_feature(&image, GuestOsFeature::UefiCompatible));
  assert_cleaned_up(&cloud);
}

#[tokio::test]
async fn test_hybrid_disk_is_imported_as_bios() {
  let cloud = cloud();
  script_import_worker(&cloud);
  script_translate_worker(&cloud);
  cloud.set_inspection_result(InspectionResult {
    os_count: 1,
    os: detected("debian", "11", "7"),
    has_efi_partition: true,
    uefi_bootable: true,
    bios_bootable: true,
  });

  let outcome = Importer::new(context(&cloud, file_args())).run().await.unwrap();

  assert_eq!(outcome.plan.os.as_deref(), Some("debian-11"));
  assert!(!outcome.plan.uefi);
  let image = cloud.image(PROJECT, "my-image").unwrap();
  assert!(!has_feature(&image, GuestOsFeature::UefiCompatible));
}

#[tokio::test]
async fn test_undetectable_os_fails_and_cleans_up() {
  let cloud = cloud();
  script_import_worker(&cloud);
  cloud.set_inspection_result(InspectionResult::default());

  let err = Importer::new(context(&cloud, file_args()))
    .run()
    .await
    .unwrap_err();

  assert!(matches!(err, ImportError::OsNotDetected { .. }));
  assert!(err.to_string().contains("could not detect operating system"));
  assert!(cloud.image(PROJECT, "my-image").is_none());
  assert_cleaned_up(&cloud);
}

#[tokio::test]
async fn test_os_mismatch_is_reported() {
  let cloud = cloud();
  script_import_worker(&cloud);
  cloud.on_boot("inst-translate", 1, "TranslateFailed: unsupported distribution\n");
  cloud.set_inspection_result(inspection("centos", "7", "9"));

  let mut args = file_args();
  args.os = Some("ubuntu-1804".to_string());
  let err = Importer::new(context(&cloud, args)).run().await.unwrap_err();

  assert!(matches!(err, ImportError::OsMismatch { .. }));
  assert_eq!(
    err.to_string(),
    "centos-7 was detected on your disk, but ubuntu-1804 was specified"
  );
  assert_cleaned_up(&cloud);
}

#[tokio::test]
async fn test_data_disk_import_skips_translation() {
  let cloud = cloud();
  script_import_worker(&cloud);

  let mut args = file_args();
  args.data_disk = true;
  args.description = Some("backups".to_string());
  // No inspection result is scripted, so inspection fails; data disks do
  // not need it.
  let outcome = Importer::new(context(&cloud, args)).run().await.unwrap();

  assert!(outcome.plan.translate_workflow.is_none());
  let image = cloud.image(PROJECT, "my-image").unwrap();
  assert_eq!(image.licenses, vec![DATA_DISK_LICENSE.to_string()]);
  assert_eq!(image.description.as_deref(), Some("backups"));
  assert_eq!(image.labels.get(IMPORT_LABEL).map(String::as_str), Some("true"));
  assert!(
    cloud
      .calls()
      .iter()
      .all(|call| !call.contains("inst-translate"))
  );
  assert_cleaned_up(&cloud);
}

#[tokio::test]
async fn test_image_source_is_cloned_without_worker() {
  let cloud = cloud();
  script_translate_worker(&cloud);
  cloud.add_image(
    PROJECT,
    Image {
      name: "source-image".to_string(),
      ..Default::default()
    },
  );

  let source = ImportSource::from_flags(None, Some("source-image")).unwrap();
  let mut args = ImportArgs::new(PROJECT, ZONE, "my-image", source);
  args.os = Some("debian-11".to_string());
  let outcome = Importer::new(context(&cloud, args)).run().await.unwrap();

  assert!(outcome.disk.source_type.is_empty());
  assert!(cloud.image(PROJECT, "my-image").is_some());
  assert!(
    cloud
      .calls()
      .iter()
      .all(|call| !call.contains("inst-importer"))
  );
  assert_cleaned_up(&cloud);
}

#[tokio::test]
async fn test_custom_workflow_receives_known_vars() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("custom.wf.json");
  std::fs::write(
    &path,
    r#"{
      "name": "custom-translate",
      "vars": {
        "source_disk": {"required": true},
        "image_name": {"required": true}
      },
      "steps": {
        "create-image": {
          "createImages": [
            {"name": "{{image_name}}", "sourceDisk": "{{source_disk}}"}
          ]
        }
      }
    }"#,
  )
  .unwrap();

  let cloud = cloud();
  script_import_worker(&cloud);
  let mut args = file_args();
  args.custom_workflow = Some(path.clone());
  args.uefi_compatible = true;

  let outcome = Importer::new(context(&cloud, args)).run().await.unwrap();

  assert_eq!(outcome.plan.translate_workflow, Some(path));
  let image = cloud.image(PROJECT, "my-image").unwrap();
  assert!(has_feature(&image, GuestOsFeature::UefiCompatible));
  assert_eq!(image.labels.get(IMPORT_LABEL).map(String::as_str), Some("true"));
  assert_cleaned_up(&cloud);
}

#[tokio::test]
async fn test_inflation_failure_removes_target_disk() {
  let cloud = cloud();
  cloud.on_boot("inst-importer", 1, "Import: starting\nImportFailed: unknown file format\n");

  let mut args = file_args();
  args.os = Some("debian-11".to_string());
  let err = Importer::new(context(&cloud, args)).run().await.unwrap_err();

  assert!(matches!(err, ImportError::Workflow { stage: "inflation", .. }));
  assert!(err.to_string().contains("unknown file format"));
  assert_cleaned_up(&cloud);
}

#[tokio::test]
async fn test_cancel_stops_translation() {
  let cloud = cloud();
  script_import_worker(&cloud);
  // The translate worker never reports back.
  cloud.set_inspection_result(inspection("debian", "11", "0"));

  let importer = Arc::new(Importer::new(context(&cloud, file_args())));
  let task = tokio::spawn({
    let importer = importer.clone();
    async move { importer.run().await }
  });

  while !cloud.calls().iter().any(|c| c.contains("inst-translate")) {
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  assert!(importer.cancel("user pressed ctrl-c"));

  let err = task.await.unwrap().unwrap_err();
  assert!(err.is_cancelled());
  assert!(err.to_string().contains("user pressed ctrl-c"));
  assert!(cloud.image(PROJECT, "my-image").is_none());
  assert_cleaned_up(&cloud);
}

#[tokio::test]
async fn test_timeout_cancels_import() {
  let cloud = cloud();
  // The import worker never reports back.
  let mut args = file_args();
  args.os = Some("debian-11".to_string());
  args.timeout = Duration::from_millis(200);

  let err = Importer::new(context(&cloud, args)).run().await.unwrap_err();

  assert!(matches!(err, ImportError::Timeout { .. }));
  assert_cleaned_up(&cloud);
}

#[tokio::test]
async fn test_cancel_is_refused_during_disk_create_call() {
  let cloud = cloud();
  cloud.slow_on("create_disk", "*", Duration::from_millis(500));

  let mut args = file_args();
  args.inflation_method = InflationMethod::Api;
  args.compute_checksum = false;
  args.data_disk = true;
  let importer = Arc::new(Importer::new(context(&cloud, args)));
  let task = tokio::spawn({
    let importer = importer.clone();
    async move { importer.run().await }
  });

  while !cloud.calls().iter().any(|c| c.starts_with("create_disk ")) {
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  assert!(!importer.cancel("too late"));

  // The refused cancel left the import running.
  task.await.unwrap().unwrap();
  assert!(cloud.image(PROJECT, "my-image").is_some());
}

#[tokio::test]
async fn test_api_inflation_computes_checksum() {
  let cloud = cloud();
  cloud.on_boot(
    "inst-checksum",
    1,
    &format!(
      "Checksum: hashing\n{}\nChecksum calculated.\n",
      serial_tag("disk-checksum", "abc123")
    ),
  );

  let mut args = file_args();
  args.inflation_method = InflationMethod::Api;
  let ctx = context(&cloud, args);
  let inflater = ApiInflater::new(ctx, &CancellationToken::new());

  let pd = inflater.inflate().await.unwrap();

  assert_eq!(pd.checksum.as_deref(), Some("abc123"));
  assert_eq!(pd.source_type, "vmdk");
  assert!(pd.size_gb >= 10);
  assert!(inflater.trace_logs().iter().any(|l| l == "Checksum: hashing"));

  // Only the inflated disk is left; the checksum worker is gone.
  let state = cloud.state();
  assert_eq!(state.disks.len(), 1);
  assert!(state.disks.contains_key(&pd.uri));
  assert!(state.instances.is_empty());
}

#[tokio::test]
async fn test_api_inflation_cancelled_before_start() {
  let cloud = cloud();
  let mut args = file_args();
  args.inflation_method = InflationMethod::Api;
  let inflater = ApiInflater::new(context(&cloud, args), &CancellationToken::new());

  assert!(inflater.cancel("shutting down"));
  let err = inflater.inflate().await.unwrap_err();

  assert!(err.is_cancelled());
  assert!(cloud.state().disks.is_empty());
}

#[tokio::test]
async fn test_metadata_processor_swaps_disk() {
  let cloud = cloud();
  cloud.add_disk(
    PROJECT,
    ZONE,
    Disk {
      name: "disk-abc".to_string(),
      size_gb: Some(20),
      ..Default::default()
    },
  );
  let uri = format!("projects/{}/zones/{}/disks/disk-abc", PROJECT, ZONE);
  let license = "projects/debian-cloud/global/licenses/debian-11-bullseye".to_string();
  let plan = Arc::new(ProcessingPlan {
    required_licenses: vec![license.clone()],
    required_features: vec![GuestOsFeature::UefiCompatible],
    uefi: true,
    ..Default::default()
  });
  let processor = MetadataProcessor::new(context(&cloud, file_args()), plan);

  let pd = processor
    .process(PersistentDisk {
      uri: uri.clone(),
      size_gb: 20,
      ..Default::default()
    })
    .await
    .unwrap();

  assert_ne!(pd.uri, uri);
  assert!(pd.uri.starts_with(&format!("{}-", uri)));
  let state = cloud.state();
  assert!(!state.disks.contains_key(&uri));
  let replacement = &state.disks[&pd.uri];
  assert_eq!(replacement.licenses, vec![license]);
  assert!(
    replacement
      .guest_os_features
      .contains(&GuestOsFeature::UefiCompatible)
  );
}

#[tokio::test]
async fn test_metadata_processor_keeps_complete_disk() {
  let cloud = cloud();
  let license = "projects/debian-cloud/global/licenses/debian-11-bullseye".to_string();
  cloud.add_disk(
    PROJECT,
    ZONE,
    Disk {
      name: "disk-abc".to_string(),
      licenses: vec![license.clone()],
      ..Default::default()
    },
  );
  let uri = format!("projects/{}/zones/{}/disks/disk-abc", PROJECT, ZONE);
  let plan = Arc::new(ProcessingPlan {
    required_licenses: vec![license],
    ..Default::default()
  });
  let processor = MetadataProcessor::new(context(&cloud, file_args()), plan);

  let pd = processor
    .process(PersistentDisk {
      uri: uri.clone(),
      ..Default::default()
    })
    .await
    .unwrap();

  assert_eq!(pd.uri, uri);
  assert!(cloud.calls().iter().all(|c| !c.starts_with("create_disk")));
}

fn planner(cloud: &EmulatorCloud, args: ImportArgs) -> ProcessPlanner {
  ProcessPlanner::new(Arc::new(args), cloud.clients().inspector)
}

fn inflated() -> PersistentDisk {
  PersistentDisk {
    uri: format!("projects/{}/zones/{}/disks/disk-1", PROJECT, ZONE),
    ..Default::default()
  }
}

#[tokio::test]
async fn test_planner_explicit_os_wins_over_detection() {
  let cloud = cloud();
  cloud.set_inspection_result(inspection("centos", "7", "9"));
  let mut args = file_args();
  args.os = Some("windows-2019".to_string());

  let plan = planner(&cloud, args).plan(&inflated()).await.unwrap();

  assert_eq!(plan.os.as_deref(), Some("windows-2019"));
  assert_eq!(plan.detected_os.as_deref(), Some("centos-7"));
  assert!(plan.required_features.contains(&GuestOsFeature::Windows));
  assert!(
    plan
      .translate_workflow
      .unwrap()
      .ends_with("windows/translate_windows_2019.wf.json")
  );
}

#[tokio::test]
async fn test_planner_without_inspection_needs_os() {
  let cloud = cloud();
  let mut args = file_args();
  args.inspect = false;

  let err = planner(&cloud, args).plan(&inflated()).await.unwrap_err();

  assert!(matches!(err, ImportError::OsNotDetected { .. }));
}

#[tokio::test]
async fn test_planner_tolerates_failed_inspection_with_explicit_os() {
  let cloud = cloud();
  let mut args = file_args();
  args.os = Some("debian-11".to_string());

  let plan = planner(&cloud, args).plan(&inflated()).await.unwrap();

  assert_eq!(plan.os.as_deref(), Some("debian-11"));
  assert!(plan.detected_os.is_none());
  assert!(plan.inspection.is_none());
}

#[tokio::test]
async fn test_planner_multiple_operating_systems() {
  let cloud = cloud();
  cloud.set_inspection_result(InspectionResult {
    os_count: 2,
    ..Default::default()
  });

  let err = planner(&cloud, file_args()).plan(&inflated()).await.unwrap_err();

  assert!(err.to_string().contains("2 operating systems"));
}
