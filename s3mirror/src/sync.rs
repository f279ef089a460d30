//! Full synchronization: enumerate the remote bucket and the local mirror
//! tree as two sorted streams, merge-compare them, and queue the actions
//! that make the local side match the remote one.

use std::collections::HashMap;
use std::iter::Peekable;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use camino::Utf8Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use remote_store::GenericObjectStore;

use crate::action::{self, ActionContext, FileAction};
use crate::fs_ops::{self, LocalEntry};
use crate::ordering::cmp_utf8;
use crate::queue::OpQueue;
use crate::transform::TransformPipeline;

/// A remote object that survived filtering and transformation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Original opaque key, used for fetching.
    pub key: String,
    /// Key after the transformer pipeline: the relative path under the
    /// mirror root and the queue partition key.
    pub transformed_key: String,
    pub last_modified: SystemTime,
    pub size: u64,
}

/// Knobs of one synchronization pass.
#[derive(Debug, Clone)]
pub struct SyncParams {
    /// Server-side key filter, passed to the listing call.
    pub prefix: Option<String>,
    /// Client-side suffix filter, applied to raw keys.
    pub suffix: Option<String>,
    pub max_keys: NonZeroU32,
    /// Whether reconciliation may delete local entries with no remote
    /// counterpart.
    pub remove: bool,
    pub pipeline: TransformPipeline,
}

/// Enumerates the whole bucket.
///
/// Pages are requested ahead: the next listing call is started before the
/// previous page's contents are filtered and transformed, overlapping
/// network latency with CPU work. The full result is materialized and
/// re-sorted because transformation may re-order keys relative to the
/// provider's returned order.
pub async fn list_remote(
    store: &GenericObjectStore,
    params: &SyncParams,
    cancel: &CancellationToken,
) -> anyhow::Result<Vec<RemoteObject>> {
    let fetch = |token: Option<String>| {
        let store = store.clone();
        let cancel = cancel.clone();
        let prefix = params.prefix.clone();
        let max_keys = params.max_keys;
        tokio::spawn(async move {
            store
                .list_page(prefix.as_deref(), max_keys, token, &cancel)
                .await
        })
    };

    let mut objects: HashMap<String, RemoteObject> = HashMap::new();
    let mut page_task = fetch(None);
    loop {
        let page = page_task
            .await
            .context("listing task panicked")?
            .context("list remote objects")?;
        let next_task = page.next_continuation_token.clone().map(|token| fetch(Some(token)));

        for meta in page.items {
            if let Some(suffix) = &params.suffix {
                if !meta.key.ends_with(suffix.as_str()) {
                    continue;
                }
            }
            let transformed_key = params.pipeline.apply(&meta.key);
            if TransformPipeline::is_dropped(&transformed_key) {
                debug!("key {:?} reduces to nothing after transformation, dropped", meta.key);
                continue;
            }
            let object = RemoteObject {
                key: meta.key.clone(),
                transformed_key: transformed_key.clone(),
                last_modified: meta.last_modified,
                size: meta.size,
            };
            if let Some(previous) = objects.insert(transformed_key, object) {
                warn!(
                    "transformed key collision: {:?} overwrites {:?}",
                    meta.key, previous.key
                );
            }
        }

        match next_task {
            Some(task) => page_task = task,
            None => break,
        }
    }

    let mut list: Vec<RemoteObject> = objects.into_values().collect();
    list.sort_unstable_by(|a, b| cmp_utf8(&a.transformed_key, &b.transformed_key));
    Ok(list)
}

/// Lists the mirror tree and runs local names through the same pipeline the
/// remote keys went through, so both merge inputs agree on normalization.
pub async fn list_local(
    root: &Utf8Path,
    pipeline: &TransformPipeline,
) -> anyhow::Result<Vec<LocalEntry>> {
    let mut entries = fs_ops::list_dir(root).await?;
    for entry in &mut entries {
        entry.relative_path = pipeline.apply(&entry.relative_path);
    }
    entries.retain(|entry| !TransformPipeline::is_dropped(&entry.relative_path));
    entries.sort_unstable_by(|a, b| cmp_utf8(&a.relative_path, &b.relative_path));
    Ok(entries)
}

/// What one reconciliation pass decided to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub writes: usize,
    pub mkdirs: usize,
    pub file_removals: usize,
    pub dir_removals: usize,
}

enum Step {
    /// The remote cursor names something the local side lacks (or lags).
    RemoteOnly,
    /// The local cursor names something the remote side lacks (or lags).
    /// `remote_nested` is set when the local entry is a directory that the
    /// current remote key is nested inside.
    LocalOnly { remote_nested: bool },
    /// Both cursors name the same path.
    Matched,
}

/// Single-cursor merge over the two sorted streams, producing actions in a
/// deterministic order.
///
/// The local cursor always advances in its branch, including when
/// `remove` is false and the entry is simply skipped. When a directory is
/// removed recursively, all of its descendants in the local stream are
/// consumed to keep the cursors aligned.
pub fn plan(
    remote: Vec<RemoteObject>,
    local: Vec<LocalEntry>,
    remove: bool,
) -> Vec<FileAction> {
    let mut remote = remote.into_iter().peekable();
    let mut local = local.into_iter().peekable();
    let mut actions = Vec::new();

    loop {
        let step = match (remote.peek(), local.peek()) {
            (None, None) => break,
            (Some(_), None) => Step::RemoteOnly,
            (None, Some(_)) => Step::LocalOnly {
                remote_nested: false,
            },
            (Some(r), Some(l)) => match cmp_utf8(&l.relative_path, &r.transformed_key) {
                std::cmp::Ordering::Less => Step::LocalOnly {
                    remote_nested: l.is_dir && r.transformed_key.starts_with(&l.relative_path),
                },
                std::cmp::Ordering::Equal => Step::Matched,
                std::cmp::Ordering::Greater => Step::RemoteOnly,
            },
        };

        match step {
            Step::RemoteOnly => {
                let r = remote.next().expect("peeked");
                actions.push(FileAction::for_remote_object(r.key, r.transformed_key));
            }
            Step::LocalOnly { remote_nested } => {
                let l = local.next().expect("peeked");
                if !remove {
                    continue;
                }
                if l.is_dir {
                    if remote_nested {
                        // The directory shelters upcoming remote keys;
                        // its stray descendants are judged one by one.
                        continue;
                    }
                    skip_prefixed(&mut local, &l.relative_path);
                    actions.push(FileAction::RemoveDirRecursive {
                        relative_path: l.relative_path,
                    });
                } else {
                    actions.push(FileAction::RemoveFile {
                        relative_path: l.relative_path,
                    });
                }
            }
            Step::Matched => {
                let l = local.next().expect("peeked");
                let r = remote.next().expect("peeked");
                if !l.is_dir && (r.last_modified > l.mtime || r.size != l.size) {
                    actions.push(FileAction::for_remote_object(r.key, r.transformed_key));
                }
            }
        }
    }

    actions
}

fn skip_prefixed(
    local: &mut Peekable<impl Iterator<Item = LocalEntry>>,
    prefix: &str,
) {
    while local
        .peek()
        .is_some_and(|entry| entry.relative_path.starts_with(prefix))
    {
        local.next();
    }
}

/// Plans and submits one reconciliation pass.
pub fn reconcile(
    queue: &Arc<OpQueue>,
    ctx: &Arc<ActionContext>,
    remote: Vec<RemoteObject>,
    local: Vec<LocalEntry>,
    remove: bool,
) -> anyhow::Result<ReconcileSummary> {
    let mut summary = ReconcileSummary::default();
    for planned in plan(remote, local, remove) {
        match &planned {
            FileAction::WriteObject { .. } => summary.writes += 1,
            FileAction::Mkdir { .. } => summary.mkdirs += 1,
            FileAction::RemoveFile { .. } => summary.file_removals += 1,
            FileAction::RemoveDirRecursive { .. } => summary.dir_removals += 1,
        }
        action::submit(queue, ctx, planned).context("queue refused reconciliation action")?;
    }
    Ok(summary)
}

/// One full list-and-compare pass: snapshot both sides, merge, submit.
pub async fn run_full_sync(
    queue: &Arc<OpQueue>,
    ctx: &Arc<ActionContext>,
    params: &SyncParams,
) -> anyhow::Result<ReconcileSummary> {
    let (remote, local) = tokio::try_join!(
        list_remote(&ctx.store, params, &ctx.cancel),
        list_local(&ctx.root, &params.pipeline),
    )?;
    let (remote_len, local_len) = (remote.len(), local.len());
    let summary = reconcile(queue, ctx, remote, local, params.remove)?;
    info!(
        remote = remote_len,
        local = local_len,
        writes = summary.writes,
        mkdirs = summary.mkdirs,
        file_removals = summary.file_removals,
        dir_removals = summary.dir_removals,
        "full sync planned"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{KeyTransform, PlatformProfile, UnicodeForm};
    use remote_store::LocalFsStore;
    use std::time::Duration;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn obj(key: &str, mtime: u64, size: u64) -> RemoteObject {
        RemoteObject {
            key: key.to_owned(),
            transformed_key: key.to_owned(),
            last_modified: at(mtime),
            size,
        }
    }

    fn file(path: &str, mtime: u64, size: u64) -> LocalEntry {
        LocalEntry {
            relative_path: path.to_owned(),
            mtime: at(mtime),
            size,
            is_dir: false,
        }
    }

    fn dir(path: &str) -> LocalEntry {
        LocalEntry {
            relative_path: path.to_owned(),
            mtime: at(0),
            size: 0,
            is_dir: true,
        }
    }

    fn write_targets(actions: &[FileAction]) -> Vec<&str> {
        actions
            .iter()
            .filter_map(|action| match action {
                FileAction::WriteObject {
                    transformed_key, ..
                } => Some(transformed_key.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn add_only_initial_sync_writes_in_sorted_order() {
        let remote = vec![
            obj("0.txt", 10, 0),
            obj("whatever.txt", 10, 0),
            obj("zzz.txt", 10, 0),
        ];
        let actions = plan(remote, Vec::new(), true);
        assert_eq!(
            write_targets(&actions),
            vec!["0.txt", "whatever.txt", "zzz.txt"]
        );
        assert_eq!(actions.len(), 3);
    }

    #[test]
    fn mixed_sync_with_removals() {
        let remote = vec![
            obj("0.txt", 10, 1),
            obj("dir1/dir1_1/aa.txt", 10, 22),
            obj("whatever.txt", 10, 1),
            obj("z.txt", 10, 5),
        ];
        let local = vec![
            file("1.txt", 10, 1),
            file("a.txt", 10, 1),
            dir("dir1/"),
            file("dir1/2.txt", 10, 1),
            file("dir1/22.txt", 10, 1),
            dir("dir1/dir1_1/"),
            file("dir1/dir1_1/aa.txt", 10, 11),
            dir("dir2/"),
            file("z.txt", 10, 5),
            file("ñ.txt", 10, 1),
        ];

        let actions = plan(remote, local, true);
        assert_eq!(
            actions,
            vec![
                FileAction::WriteObject {
                    key: "0.txt".into(),
                    transformed_key: "0.txt".into()
                },
                FileAction::RemoveFile {
                    relative_path: "1.txt".into()
                },
                FileAction::RemoveFile {
                    relative_path: "a.txt".into()
                },
                FileAction::RemoveFile {
                    relative_path: "dir1/2.txt".into()
                },
                FileAction::RemoveFile {
                    relative_path: "dir1/22.txt".into()
                },
                FileAction::WriteObject {
                    key: "dir1/dir1_1/aa.txt".into(),
                    transformed_key: "dir1/dir1_1/aa.txt".into()
                },
                FileAction::RemoveDirRecursive {
                    relative_path: "dir2/".into()
                },
                FileAction::WriteObject {
                    key: "whatever.txt".into(),
                    transformed_key: "whatever.txt".into()
                },
                FileAction::RemoveFile {
                    relative_path: "ñ.txt".into()
                },
            ]
        );
    }

    #[test]
    fn unchanged_entries_produce_no_actions() {
        let remote = vec![obj("1.txt", 10, 7)];
        let local = vec![file("1.txt", 10, 7)];
        assert!(plan(remote, local, true).is_empty());
    }

    #[test]
    fn newer_remote_mtime_or_size_change_triggers_write() {
        let local = vec![file("1.txt", 10, 7)];
        let newer = plan(vec![obj("1.txt", 11, 7)], local.clone(), true);
        assert_eq!(write_targets(&newer), vec!["1.txt"]);

        let resized = plan(vec![obj("1.txt", 10, 8)], local.clone(), true);
        assert_eq!(write_targets(&resized), vec!["1.txt"]);

        // An older remote copy is left alone.
        let older = plan(vec![obj("1.txt", 9, 7)], local, true);
        assert!(older.is_empty());
    }

    #[test]
    fn remove_false_skips_local_only_entries_but_advances() {
        let remote = vec![obj("b.txt", 10, 1)];
        let local = vec![
            file("a.txt", 10, 1),
            file("b.txt", 10, 1),
            dir("c/"),
            file("c/x.txt", 10, 1),
        ];
        assert!(plan(remote, local, false).is_empty());
    }

    #[test]
    fn removed_directory_consumes_its_descendants() {
        let remote = vec![obj("z.txt", 10, 1)];
        let local = vec![
            dir("gone/"),
            dir("gone/deeper/"),
            file("gone/deeper/x.txt", 10, 1),
            file("gone/y.txt", 10, 1),
            file("z.txt", 10, 1),
        ];
        let actions = plan(remote, local, true);
        assert_eq!(
            actions,
            vec![FileAction::RemoveDirRecursive {
                relative_path: "gone/".into()
            }]
        );
    }

    #[test]
    fn sheltering_directory_survives_when_remote_is_nested() {
        let remote = vec![obj("dir/keep.txt", 10, 1)];
        let local = vec![
            dir("dir/"),
            file("dir/keep.txt", 10, 1),
            file("dir/stray.txt", 10, 1),
        ];
        let actions = plan(remote, local, true);
        assert_eq!(
            actions,
            vec![FileAction::RemoveFile {
                relative_path: "dir/stray.txt".into()
            }]
        );
    }

    #[test]
    fn directory_keys_plan_mkdir() {
        let mut remote = vec![obj("dir/", 10, 0)];
        remote[0].transformed_key = "dir/".to_owned();
        let actions = plan(remote, Vec::new(), true);
        assert_eq!(
            actions,
            vec![FileAction::Mkdir {
                relative_path: "dir/".into()
            }]
        );
    }

    fn nfc_params() -> SyncParams {
        SyncParams {
            prefix: None,
            suffix: None,
            max_keys: NonZeroU32::new(2).unwrap(),
            remove: true,
            pipeline: TransformPipeline::new(vec![
                KeyTransform::StripRootPrefix,
                KeyTransform::NormalizeSeparators(PlatformProfile::posix()),
                KeyTransform::UnicodeNormalize(UnicodeForm::Nfc),
            ]),
        }
    }

    #[tokio::test]
    async fn remote_listing_transforms_filters_and_sorts() -> anyhow::Result<()> {
        let remote_dir = camino_tempfile::tempdir()?;
        for name in ["b.txt", "a.txt", "skip.log", "nested/c.txt"] {
            let path = remote_dir.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap())?;
            std::fs::write(path, b"x")?;
        }
        let store =
            GenericObjectStore::LocalFs(LocalFsStore::new(remote_dir.path().to_path_buf())?);

        let mut params = nfc_params();
        params.suffix = Some(".txt".to_owned());
        let cancel = CancellationToken::new();
        let listed = list_remote(&store, &params, &cancel).await?;
        let keys: Vec<_> = listed
            .iter()
            .map(|object| object.transformed_key.as_str())
            .collect();
        assert_eq!(keys, vec!["a.txt", "b.txt", "nested/c.txt"]);
        Ok(())
    }

    #[tokio::test]
    async fn colliding_transformed_keys_keep_one_winner() -> anyhow::Result<()> {
        let remote_dir = camino_tempfile::tempdir()?;
        // Same name in NFC and NFD form: distinct raw keys, one transformed key.
        std::fs::write(remote_dir.path().join("ñ.txt"), b"composed")?;
        std::fs::write(remote_dir.path().join("n\u{0303}.txt"), b"decomposed")?;
        let store =
            GenericObjectStore::LocalFs(LocalFsStore::new(remote_dir.path().to_path_buf())?);

        let listed = list_remote(&store, &nfc_params(), &CancellationToken::new()).await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].transformed_key, "ñ.txt");
        // Accumulation is in raw-key byte order, and the last key seen wins.
        assert_eq!(listed[0].key, "ñ.txt");
        Ok(())
    }
}
