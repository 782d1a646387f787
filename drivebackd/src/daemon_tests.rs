use super::*;
use crate::sync::engine::ItemStatus;
use crate::sync::ledger::TransferStatus;
use std::collections::HashMap;
use tempfile::tempdir;

#[test]
fn expands_tilde_to_home_dir() {
    let home = PathBuf::from("/tmp/home-user");
    assert_eq!(
        expand_with_home("~/Drive", &home),
        PathBuf::from("/tmp/home-user/Drive")
    );
    assert_eq!(expand_with_home("~", &home), home);
    assert_eq!(expand_with_home("/srv/data", &home), PathBuf::from("/srv/data"));
}

#[test]
fn reads_numbers_and_flags_with_defaults() {
    assert_eq!(read_u64_env("NO_SUCH_ENV_FOR_DRIVEBACK_TEST", 42), 42);
    assert!(read_bool_env("NO_SUCH_BOOL_ENV_FOR_DRIVEBACK_TEST", true));
    assert!(parse_bool(" Yes "));
    assert!(!parse_bool("off"));
}

#[test]
fn splits_comma_lists() {
    assert_eq!(
        split_list(" aws_s3, backblaze_b2,,"),
        vec!["aws_s3".to_string(), "backblaze_b2".to_string()]
    );
}

#[test]
fn destination_settings_follow_key_prefix() {
    let home = PathBuf::from("/home/u");
    let env: HashMap<&str, &str> = HashMap::from([
        ("DRIVEBACK_DEST_AWS_S3_BUCKET", "backups"),
        ("DRIVEBACK_DEST_AWS_S3_ROOT", "~/mnt/s3"),
        ("DRIVEBACK_DEST_B2_EU_ENABLED", "false"),
    ]);
    let keys = vec!["aws_s3".to_string(), "b2-eu".to_string()];
    let settings = destination_settings(&keys, &home, |name| {
        env.get(name).map(|value| value.to_string())
    });

    assert_eq!(
        settings[0],
        DestinationSettings {
            key: "aws_s3".into(),
            enabled: true,
            bucket: Some("backups".into()),
            root: Some(PathBuf::from("/home/u/mnt/s3")),
        }
    );
    assert!(!settings[1].enabled);
    assert_eq!(settings[1].bucket, None);
}

fn test_config(root: &Path) -> DaemonConfig {
    DaemonConfig {
        db_path: root.join("state/state.db"),
        source_root: root.join("drive"),
        source_root_name: "My Drive".into(),
        scratch_root: root.join("scratch"),
        namespace: "google-drive".into(),
        root_aliases: vec!["My Drive".into()],
        sync_interval: Duration::from_secs(60),
        pause_poll: Duration::from_millis(20),
        idle_poll: Duration::from_millis(20),
        stop_timeout: Duration::from_secs(2),
        sync_workers: 2,
        transfer_limits: TransferLimits {
            download_concurrency: 2,
            upload_concurrency: 2,
        },
        auto_start: false,
        destinations: vec![
            DestinationSettings {
                key: "aws_s3".into(),
                enabled: true,
                bucket: Some("s3-backups".into()),
                root: Some(root.join("buckets/s3")),
            },
            DestinationSettings {
                key: "backblaze_b2".into(),
                enabled: true,
                bucket: Some("b2-backups".into()),
                root: Some(root.join("buckets/b2")),
            },
            DestinationSettings {
                key: "scaleway".into(),
                enabled: true,
                bucket: None,
                root: None,
            },
        ],
    }
}

#[tokio::test]
async fn bootstrap_excludes_misconfigured_destinations() {
    let dir = tempdir().unwrap();
    let runtime = DaemonRuntime::bootstrap(test_config(dir.path()))
        .await
        .unwrap();
    let control = runtime.control();
    assert_eq!(
        control.available_destinations(),
        vec!["aws_s3".to_string(), "backblaze_b2".to_string()]
    );
    let info = control.destination_info().await;
    assert_eq!(info.len(), 3);
    assert!(!info[2].available);
    assert!(dir.path().join("state/state.db").exists());
}

#[tokio::test]
async fn filesystem_pass_backs_up_selected_folder() {
    let dir = tempdir().unwrap();
    let report = dir.path().join("drive/F/report.pdf");
    std::fs::create_dir_all(report.parent().unwrap()).unwrap();
    std::fs::write(&report, vec![7u8; 1000]).unwrap();

    let runtime = DaemonRuntime::bootstrap(test_config(dir.path()))
        .await
        .unwrap();
    let control = runtime.control();
    let both = vec!["aws_s3".to_string(), "backblaze_b2".to_string()];
    control
        .set_policy("F", "F", "My Drive/F", &both)
        .await
        .unwrap();
    control.add_selection("F", "F", true).await.unwrap();

    let batch = control.run_once().await.unwrap();
    assert_eq!(batch.total, 1);
    assert_eq!(batch.items[0].status, ItemStatus::Synced);
    for bucket in ["s3", "b2"] {
        let copy = dir
            .path()
            .join("buckets")
            .join(bucket)
            .join("google-drive/My Drive/F/report.pdf");
        assert_eq!(std::fs::metadata(copy).unwrap().len(), 1000);
    }
    let synced = control.list_by_status(TransferStatus::Synced).await.unwrap();
    assert_eq!(synced.len(), 2);
    assert!(synced.iter().all(|record| record.size == Some(1000)));

    let again = control.run_once().await.unwrap();
    assert_eq!(again.deduplicated, 1);
    assert_eq!(again.bytes_saved, 1000);
}
