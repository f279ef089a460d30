//! File-system side effects against the mirror tree.
//!
//! All of these run inside queued tasks keyed by the absolute target path,
//! so per-path there is never more than one mutation in flight. Rename is
//! the only externally-visible mutation of a target file: writers stage the
//! body next to (or in a configured staging directory away from) the target
//! and promote it atomically.

use std::io::ErrorKind;
use std::time::SystemTime;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use remote_store::DownloadStream;

use crate::ordering::cmp_utf8;

/// One entry of the local mirror tree, relative to the mirror root.
/// Directories carry a trailing separator in `relative_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub relative_path: String,
    pub mtime: SystemTime,
    pub size: u64,
    pub is_dir: bool,
}

fn ignore_not_found(e: std::io::Error) -> std::io::Result<()> {
    if e.kind() == ErrorKind::NotFound {
        Ok(())
    } else {
        Err(e)
    }
}

/// Resolves `relative_path` under `root`, refusing anything that could
/// name a target outside the mirror tree: a `..` segment, or an absolute
/// path (which `join` would substitute for the root wholesale). The
/// transformer pipeline already drops such keys, but the mutating layer
/// must not rely on every caller having run it.
fn target_under_root(root: &Utf8Path, relative_path: &str) -> anyhow::Result<Utf8PathBuf> {
    anyhow::ensure!(
        !relative_path
            .split(['/', '\\'])
            .any(|segment| segment == ".."),
        "path {relative_path:?} escapes the mirror root"
    );
    let target = root.join(relative_path);
    anyhow::ensure!(
        target.strip_prefix(root).is_ok(),
        "path {relative_path:?} escapes the mirror root"
    );
    Ok(target)
}

/// Creates the directory named by a transformed key, recursively, staying
/// inside the mirror root.
pub async fn mkdir(root: &Utf8Path, relative_path: &str) -> anyhow::Result<()> {
    let target = target_under_root(root, relative_path)?;
    ensure_dir(&target).await
}

/// Recursive create; succeeding when the directory already exists.
pub async fn ensure_dir(path: &Utf8Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .or_else(|e| {
            if e.kind() == ErrorKind::AlreadyExists {
                Ok(())
            } else {
                Err(e)
            }
        })
        .with_context(|| format!("create directory {path:?}"))
}

/// Materializes an object at `root/transformed_key` by writing the full
/// body to a staging file and renaming it over the target.
///
/// The staging name carries a random component: two writers for the same
/// key cannot overlap inside one queue, but a notification-driven write and
/// a resync-driven write may be queued back to back, and an abandoned
/// (timed-out) predecessor may still be flushing its staging file.
///
/// Rename is atomic only within one file system. When `tmp_dir` is on a
/// different mount the promotion degrades to copy-then-delete, which
/// external watchers can observe mid-copy; documented behavior.
pub async fn atomic_write(
    root: &Utf8Path,
    tmp_dir: Option<&Utf8Path>,
    tmp_suffix: &str,
    transformed_key: &str,
    body: DownloadStream,
) -> anyhow::Result<u64> {
    let target = target_under_root(root, transformed_key)?;
    let tmp_name = format!(
        "{transformed_key}.{:08x}{tmp_suffix}",
        rand::random::<u32>()
    );
    let tmp_path = tmp_dir.unwrap_or(root).join(tmp_name);

    if let Some(parent) = target.parent() {
        ensure_dir(parent).await?;
    }
    if let Some(parent) = tmp_path.parent() {
        ensure_dir(parent).await?;
    }

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("create staging file {tmp_path:?}"))?;
    let mut reader = StreamReader::new(body);
    let written = match tokio::io::copy_buf(&mut reader, &mut file).await {
        Ok(written) => written,
        Err(e) => {
            // Remove the partial staging file; the target is untouched.
            drop(file);
            tokio::fs::remove_file(&tmp_path)
                .await
                .or_else(ignore_not_found)
                .ok();
            return Err(anyhow::Error::new(e).context(format!("write object body to {tmp_path:?}")));
        }
    };
    file.flush()
        .await
        .with_context(|| format!("flush {tmp_path:?}"))?;
    drop(file);

    promote(&tmp_path, &target, tmp_dir.is_some()).await?;
    Ok(written)
}

async fn promote(tmp_path: &Utf8Path, target: &Utf8Path, may_cross_fs: bool) -> anyhow::Result<()> {
    match tokio::fs::rename(tmp_path, target).await {
        Ok(()) => Ok(()),
        Err(e) if may_cross_fs => {
            // A staging directory on another mount cannot be renamed into
            // the mirror; fall back to a non-atomic copy.
            debug!("rename {tmp_path:?} -> {target:?} failed ({e}), copying instead");
            tokio::fs::copy(tmp_path, target)
                .await
                .with_context(|| format!("copy {tmp_path:?} to {target:?}"))?;
            tokio::fs::remove_file(tmp_path)
                .await
                .or_else(ignore_not_found)
                .with_context(|| format!("remove staging file {tmp_path:?}"))?;
            Ok(())
        }
        Err(e) => {
            Err(anyhow::Error::new(e).context(format!("rename {tmp_path:?} to {target:?}")))
        }
    }
}

/// Unlinks `root/relative_path`. A missing file is not an error: removals
/// race against notifications that may already have done the work.
///
/// With `prune_empty_parent`, an emptied parent directory is removed as
/// well, unless it is the mirror root.
pub async fn remove_file(
    root: &Utf8Path,
    relative_path: &str,
    prune_empty_parent: bool,
) -> anyhow::Result<()> {
    let target = target_under_root(root, relative_path)?;
    match tokio::fs::remove_file(&target).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("{target:?} already absent");
            return Ok(());
        }
        Err(e) => return Err(anyhow::Error::new(e).context(format!("unlink {target:?}"))),
    }

    if prune_empty_parent {
        if let Some(parent) = target.parent() {
            if parent != root && dir_is_empty(parent).await? {
                // Another task may create a file here between the check and
                // the removal; the not-empty failure is then acceptable.
                if let Err(e) = tokio::fs::remove_dir(parent).await {
                    debug!("could not prune {parent:?}: {e}");
                }
            }
        }
    }
    Ok(())
}

async fn dir_is_empty(path: &Utf8Path) -> anyhow::Result<bool> {
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(anyhow::Error::new(e).context(format!("read_dir {path:?}"))),
    };
    Ok(entries
        .next_entry()
        .await
        .with_context(|| format!("read_dir {path:?}"))?
        .is_none())
}

/// Removes the subtree at `root/relative_path`. Refuses the mirror root
/// itself, any file-system root, and any path reaching outside the root:
/// a reconciler bug must not be able to wipe more than the mirrored
/// subtree it targeted.
pub async fn remove_dir_recursive(root: &Utf8Path, relative_path: &str) -> anyhow::Result<()> {
    let trimmed = relative_path
        .trim_end_matches(['/', '\\'])
        .trim_start_matches(['/', '\\']);
    anyhow::ensure!(
        !trimmed.is_empty(),
        "refusing recursive removal of the mirror root"
    );
    let target = target_under_root(root, trimmed)?;
    anyhow::ensure!(
        target != *root && target.parent().is_some(),
        "refusing recursive removal of {target:?}"
    );

    match tokio::fs::remove_dir_all(&target).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("{target:?} already absent");
            Ok(())
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("remove subtree {target:?}"))),
    }
}

/// Recursively lists the mirror tree.
///
/// Directory entries are reported with a trailing separator and, thanks to
/// the byte-wise sort, come immediately before their descendants. The walk
/// runs on the blocking pool; mirror trees can be large.
pub async fn list_dir(root: &Utf8Path) -> anyhow::Result<Vec<LocalEntry>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || list_dir_blocking(&root))
        .await
        .context("listing task panicked")?
}

fn list_dir_blocking(root: &Utf8PathBuf) -> anyhow::Result<Vec<LocalEntry>> {
    let mut entries = Vec::new();
    for entry in walkdir::WalkDir::new(root.as_std_path()).min_depth(1) {
        let entry = entry.context("directory walk")?;
        let path = Utf8Path::from_path(entry.path())
            .with_context(|| format!("non-utf8 path {:?}", entry.path()))?;
        let relative = path
            .strip_prefix(root)
            .expect("walkdir yields paths under its root");
        let is_dir = entry.file_type().is_dir();
        let mut relative_path = relative.as_str().to_owned();
        if is_dir {
            relative_path.push(std::path::MAIN_SEPARATOR);
        }
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e)
                if e.io_error()
                    .is_some_and(|io| io.kind() == ErrorKind::NotFound) =>
            {
                // Deleted under our feet mid-walk; skip it rather than fail
                // the whole listing.
                warn!("{path:?} vanished during listing");
                continue;
            }
            Err(e) => return Err(anyhow::Error::new(e).context(format!("stat {path:?}"))),
        };
        entries.push(LocalEntry {
            relative_path,
            mtime: metadata.modified().context("file mtime")?,
            size: metadata.len(),
            is_dir,
        });
    }
    entries.sort_unstable_by(|a, b| cmp_utf8(&a.relative_path, &b.relative_path));
    Ok(entries)
}
