//! Full-sync behavior against a local store: reconciliation runs end to
//! end through the queue and the file-system layer, and the mirror tree is
//! inspected afterwards.

mod common;

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use tokio_util::sync::CancellationToken;

use remote_store::{GenericObjectStore, LocalFsStore};
use s3mirror::action::ActionContext;
use s3mirror::queue::OpQueue;
use s3mirror::sync::{run_full_sync, ReconcileSummary, SyncParams};
use s3mirror::transform::{KeyTransform, PlatformProfile, TransformPipeline, UnicodeForm};

use common::{tree, wait_until, write_file};

struct Harness {
    queue: Arc<OpQueue>,
    ctx: Arc<ActionContext>,
    params: SyncParams,
    reaper_cancel: CancellationToken,
}

impl Harness {
    fn new(remote_root: &Utf8Path, mirror_root: &Utf8Path, remove: bool) -> Self {
        Self::with_pipeline(
            remote_root,
            mirror_root,
            remove,
            TransformPipeline::new(vec![
                KeyTransform::StripRootPrefix,
                KeyTransform::NormalizeSeparators(PlatformProfile::host()),
            ]),
        )
    }

    fn with_pipeline(
        remote_root: &Utf8Path,
        mirror_root: &Utf8Path,
        remove: bool,
        pipeline: TransformPipeline,
    ) -> Self {
        let reaper_cancel = CancellationToken::new();
        let queue = OpQueue::new(8, Duration::from_millis(100), &reaper_cancel);
        let ctx = Arc::new(ActionContext {
            store: GenericObjectStore::LocalFs(
                LocalFsStore::new(remote_root.to_path_buf()).unwrap(),
            ),
            root: mirror_root.to_path_buf(),
            tmp_dir: None,
            tmp_suffix: ".tmp".to_owned(),
            prune_empty_dirs: false,
            task_timeout: Duration::from_secs(60),
            cancel: CancellationToken::new(),
            fatal: CancellationToken::new(),
        });
        let params = SyncParams {
            prefix: None,
            suffix: None,
            max_keys: NonZeroU32::new(2).unwrap(),
            remove,
            pipeline,
        };
        Self {
            queue,
            ctx,
            params,
            reaper_cancel,
        }
    }

    async fn sync_and_drain(&self) -> ReconcileSummary {
        let summary = run_full_sync(&self.queue, &self.ctx, &self.params)
            .await
            .unwrap();
        wait_until("queue to go idle", || self.queue.is_idle()).await;
        summary
    }

    fn finish(self) {
        self.reaper_cancel.cancel();
    }
}

#[tokio::test]
async fn add_only_initial_sync() {
    let remote = camino_tempfile::tempdir().unwrap();
    let mirror = camino_tempfile::tempdir().unwrap();
    for name in ["0.txt", "whatever.txt", "zzz.txt"] {
        write_file(remote.path(), name, b"");
    }

    let harness = Harness::new(remote.path(), mirror.path(), false);
    let summary = harness.sync_and_drain().await;

    assert_eq!(summary.writes, 3);
    assert_eq!(summary.file_removals + summary.dir_removals, 0);
    assert_eq!(tree(mirror.path()), vec!["0.txt", "whatever.txt", "zzz.txt"]);
    harness.finish();
}

#[tokio::test]
async fn mixed_sync_with_removals() {
    let remote = camino_tempfile::tempdir().unwrap();
    let mirror = camino_tempfile::tempdir().unwrap();

    write_file(remote.path(), "0.txt", b"zero");
    write_file(remote.path(), "whatever.txt", b"whatever");
    write_file(remote.path(), "dir1/dir1_1/aa.txt", b"aa with eleven more bytes");
    write_file(remote.path(), "z.txt", b"AAAAA");

    // Local entries created after the remote ones: equal-size files with a
    // newer local mtime count as unchanged.
    tokio::time::sleep(Duration::from_millis(50)).await;
    write_file(mirror.path(), "1.txt", b"stale");
    write_file(mirror.path(), "a.txt", b"stale");
    write_file(mirror.path(), "dir1/2.txt", b"stale");
    write_file(mirror.path(), "dir1/22.txt", b"stale");
    write_file(mirror.path(), "dir1/dir1_1/aa.txt", b"aa short");
    std::fs::create_dir(mirror.path().join("dir2")).unwrap();
    write_file(mirror.path(), "z.txt", b"BBBBB");
    write_file(mirror.path(), "ñ.txt", b"stale");

    let harness = Harness::new(remote.path(), mirror.path(), true);
    let summary = harness.sync_and_drain().await;

    assert_eq!(summary.writes, 3, "0.txt, whatever.txt, aa.txt");
    assert_eq!(summary.file_removals, 5, "1.txt, a.txt, dir1/2.txt, dir1/22.txt, ñ.txt");
    assert_eq!(summary.dir_removals, 1, "dir2/");
    assert_eq!(
        tree(mirror.path()),
        vec![
            "0.txt",
            "dir1/",
            "dir1/dir1_1/",
            "dir1/dir1_1/aa.txt",
            "whatever.txt",
            "z.txt",
        ]
    );
    // z.txt matched by size with an older remote copy: untouched.
    assert_eq!(std::fs::read(mirror.path().join("z.txt")).unwrap(), b"BBBBB");
    assert_eq!(
        std::fs::read(mirror.path().join("dir1/dir1_1/aa.txt")).unwrap(),
        b"aa with eleven more bytes"
    );
    harness.finish();
}

#[tokio::test]
async fn second_sync_is_a_no_op() {
    let remote = camino_tempfile::tempdir().unwrap();
    let mirror = camino_tempfile::tempdir().unwrap();
    write_file(remote.path(), "1.txt", b"contents");
    write_file(remote.path(), "sub/2.txt", b"more");

    let harness = Harness::new(remote.path(), mirror.path(), true);
    let first = harness.sync_and_drain().await;
    assert_eq!(first.writes, 2);

    let second = harness.sync_and_drain().await;
    assert_eq!(second, ReconcileSummary::default());
    harness.finish();
}

#[tokio::test]
async fn unicode_collision_under_nfc() {
    let remote = camino_tempfile::tempdir().unwrap();
    let mirror = camino_tempfile::tempdir().unwrap();
    // Remote name decomposed, local name composed; same contents.
    write_file(remote.path(), "n\u{0303}.txt", b"same");
    tokio::time::sleep(Duration::from_millis(50)).await;
    write_file(mirror.path(), "ñ.txt", b"same");

    let nfc_pipeline = TransformPipeline::new(vec![
        KeyTransform::StripRootPrefix,
        KeyTransform::NormalizeSeparators(PlatformProfile::host()),
        KeyTransform::UnicodeNormalize(UnicodeForm::Nfc),
    ]);
    let harness =
        Harness::with_pipeline(remote.path(), mirror.path(), false, nfc_pipeline);
    let normalized = harness.sync_and_drain().await;
    assert_eq!(normalized, ReconcileSummary::default());
    harness.finish();

    // Without normalization the same pair does not line up.
    let harness = Harness::new(remote.path(), mirror.path(), false);
    let raw = harness.sync_and_drain().await;
    assert_eq!(raw.writes, 1);
    harness.finish();
}

/// With removals enabled, a drained sync must leave the mirror exactly
/// equal to the projection of the remote listing, whatever the two trees
/// looked like beforehand.
#[tokio::test]
async fn removal_sync_converges_to_remote_projection() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;

    const SEGMENTS: &[&str] = &["a", "b", "dir1", "dir2", "x", "ñ"];
    let mut rng = StdRng::seed_from_u64(20240801);

    let mut remote_keys: BTreeSet<String> = BTreeSet::new();
    while remote_keys.len() < 30 {
        let depth = rng.gen_range(1..=3);
        let mut parts: Vec<String> = (0..depth)
            .map(|_| {
                format!(
                    "{}{}",
                    SEGMENTS[rng.gen_range(0..SEGMENTS.len())],
                    rng.gen_range(0..3)
                )
            })
            .collect();
        parts.last_mut().unwrap().push_str(".txt");
        remote_keys.insert(parts.join("/"));
    }

    let remote = camino_tempfile::tempdir().unwrap();
    let mirror = camino_tempfile::tempdir().unwrap();
    for key in &remote_keys {
        write_file(remote.path(), key, key.as_bytes());
    }

    // Local state: per remote key either absent, identical, or stale with
    // a different size; plus entries with no remote counterpart at all.
    tokio::time::sleep(Duration::from_millis(50)).await;
    for key in &remote_keys {
        match rng.gen_range(0..3) {
            0 => {}
            1 => write_file(mirror.path(), key, key.as_bytes()),
            _ => write_file(mirror.path(), key, format!("{key}-stale-padding").as_bytes()),
        }
    }
    write_file(mirror.path(), "only/local/deep.txt", b"doomed");
    write_file(mirror.path(), "zzz_local.txt", b"doomed");
    let shared_dir_stray = remote_keys
        .iter()
        .find_map(|key| Some(format!("{}/stray_local.bin", key.rsplit_once('/')?.0)))
        .unwrap();
    write_file(mirror.path(), &shared_dir_stray, b"doomed");

    let harness = Harness::new(remote.path(), mirror.path(), true);
    harness.sync_and_drain().await;
    harness.finish();

    let mut expected: BTreeSet<String> = BTreeSet::new();
    for key in &remote_keys {
        expected.insert(key.clone());
        let mut ancestor = String::new();
        let parts: Vec<&str> = key.split('/').collect();
        for part in &parts[..parts.len() - 1] {
            ancestor.push_str(part);
            ancestor.push('/');
            expected.insert(ancestor.clone());
        }
    }
    assert_eq!(
        tree(mirror.path()),
        expected.into_iter().collect::<Vec<_>>()
    );
    for key in &remote_keys {
        assert_eq!(
            std::fs::read(mirror.path().join(key)).unwrap(),
            key.as_bytes(),
            "contents of {key:?} do not match the remote"
        );
    }
}

#[tokio::test]
async fn no_staging_residue_after_sync() {
    let remote = camino_tempfile::tempdir().unwrap();
    let mirror = camino_tempfile::tempdir().unwrap();
    for i in 0..20 {
        write_file(remote.path(), &format!("f{i:02}.bin"), &vec![i as u8; 1024]);
    }

    let harness = Harness::new(remote.path(), mirror.path(), true);
    harness.sync_and_drain().await;

    assert!(
        tree(mirror.path()).iter().all(|p| !p.contains(".tmp")),
        "staging residue in {:?}",
        tree(mirror.path())
    );
    harness.finish();
}
