//! Daemon start/stop behavior without the notification path: initial sync
//! at start-up, the periodic resync timer, and a clean drain on shutdown.

mod common;

use std::num::NonZeroU32;
use std::time::Duration;

use camino::Utf8Path;
use tokio_util::sync::CancellationToken;

use s3mirror::config::{LogLevel, MirrorConfig};
use s3mirror::daemon;

use common::{tree, wait_until, write_file};

fn sync_only_config(remote_root: &Utf8Path, mirror_root: &Utf8Path) -> MirrorConfig {
    MirrorConfig {
        bucket: "mirror-bucket".to_owned(),
        root_dir: mirror_root.to_path_buf(),
        region: "us-east-1".to_owned(),
        s3_endpoint_url: None,
        local_store: Some(remote_root.to_path_buf()),
        tmp_suffix: ".tmp".to_owned(),
        tmp_dir: None,
        remove: true,
        prefix: None,
        suffix: None,
        normalization_form: None,
        ignore_key_platform_dir_char_replacement: false,
        ignore_key_root_char_replacement: false,
        max_concurrency: 8,
        max_keys: NonZeroU32::new(1000).unwrap(),
        skip_initial_sync: false,
        resync_interval: Some(Duration::from_millis(250)),
        host: "127.0.0.1".to_owned(),
        port: None,
        https_cert_path: None,
        https_cert_key_path: None,
        http_path: None,
        topic_arn: None,
        endpoint: None,
        ignore_unsubscribe_on_shutdown: false,
        ignore_message_validation: true,
        prune_empty_dirs: false,
        task_timeout: Duration::from_secs(60),
        shutdown_timeout: Duration::from_secs(10),
        log: LogLevel::None,
    }
}

#[tokio::test]
async fn initial_sync_then_resync_timer_catches_changes() {
    let remote = camino_tempfile::tempdir().unwrap();
    let mirror = camino_tempfile::tempdir().unwrap();
    write_file(remote.path(), "a.txt", b"from start-up");

    let shutdown = CancellationToken::new();
    let daemon_task = tokio::spawn(daemon::run_with_control(
        sync_only_config(remote.path(), mirror.path()),
        None,
        shutdown.clone(),
    ));

    // Initial sync.
    wait_until("initial sync to land", || {
        mirror.path().join("a.txt").exists()
    })
    .await;

    // Changes on the remote side are picked up by the timer alone.
    write_file(remote.path(), "b.txt", b"from resync");
    std::fs::remove_file(remote.path().join("a.txt")).unwrap();
    wait_until("resync to land", || {
        mirror.path().join("b.txt").exists() && !mirror.path().join("a.txt").exists()
    })
    .await;
    assert_eq!(
        std::fs::read(mirror.path().join("b.txt")).unwrap(),
        b"from resync"
    );

    shutdown.cancel();
    daemon_task.await.unwrap().unwrap();
    assert_eq!(tree(mirror.path()), vec!["b.txt"]);
}

#[tokio::test]
async fn skip_initial_sync_leaves_the_mirror_alone() {
    let remote = camino_tempfile::tempdir().unwrap();
    let mirror = camino_tempfile::tempdir().unwrap();
    write_file(remote.path(), "a.txt", b"remote");
    write_file(mirror.path(), "stale.txt", b"local");

    let mut config = sync_only_config(remote.path(), mirror.path());
    config.skip_initial_sync = true;
    config.resync_interval = None;

    let shutdown = CancellationToken::new();
    let daemon_task = tokio::spawn(daemon::run_with_control(config, None, shutdown.clone()));

    // Give the daemon a moment to do anything it wrongly wanted to do.
    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.cancel();
    daemon_task.await.unwrap().unwrap();

    assert_eq!(tree(mirror.path()), vec!["stale.txt"]);
}

#[tokio::test]
async fn invalid_configuration_fails_startup() {
    let remote = camino_tempfile::tempdir().unwrap();
    let mirror = camino_tempfile::tempdir().unwrap();

    let mut config = sync_only_config(remote.path(), mirror.path());
    config.topic_arn = Some("arn:aws:sns:us-east-1:1:topic".to_owned());
    // topic-arn without endpoint: must abort before doing anything.

    let result =
        daemon::run_with_control(config, None, CancellationToken::new()).await;
    assert!(result.is_err());
    assert_eq!(tree(mirror.path()), Vec::<String>::new());
}
