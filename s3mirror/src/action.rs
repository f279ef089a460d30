//! Queue submissions: turning a [`FileAction`] into a queued task keyed by
//! the absolute target path, and executing it against the store and the
//! mirror tree.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use remote_store::{GenericObjectStore, StoreError};

use crate::fs_ops;
use crate::queue::{OpQueue, QueueStopped};

/// A mutation of the mirror tree. Both the reconciler and the notification
/// ingress reduce their inputs to these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileAction {
    /// Fetch the object at `key` and materialize it at `transformed_key`.
    WriteObject { key: String, transformed_key: String },
    RemoveFile { relative_path: String },
    RemoveDirRecursive { relative_path: String },
    Mkdir { relative_path: String },
}

impl FileAction {
    /// The right action for a listed remote object: keys ending in a
    /// separator denote directories and get no body fetch.
    pub fn for_remote_object(key: String, transformed_key: String) -> Self {
        if transformed_key.ends_with(['/', '\\']) {
            FileAction::Mkdir {
                relative_path: transformed_key,
            }
        } else {
            FileAction::WriteObject {
                key,
                transformed_key,
            }
        }
    }

    /// Path under the mirror root this action mutates.
    pub fn target(&self) -> &str {
        match self {
            FileAction::WriteObject {
                transformed_key, ..
            } => transformed_key,
            FileAction::RemoveFile { relative_path }
            | FileAction::RemoveDirRecursive { relative_path }
            | FileAction::Mkdir { relative_path } => relative_path,
        }
    }
}

/// Everything a queued action needs to run. Shared by the reconciler and
/// the ingress; both submit through [`submit`].
pub struct ActionContext {
    pub store: GenericObjectStore,
    pub root: Utf8PathBuf,
    pub tmp_dir: Option<Utf8PathBuf>,
    pub tmp_suffix: String,
    pub prune_empty_dirs: bool,
    pub task_timeout: Duration,
    /// Cancels in-flight store requests on shutdown.
    pub cancel: CancellationToken,
    /// Tripped when an unrecoverable remote error is seen; the daemon shuts
    /// down on it.
    pub fatal: CancellationToken,
}

impl ActionContext {
    /// Queue partition key: the absolute target path, so that only one
    /// mutation per path is ever in flight.
    fn partition_key(&self, action: &FileAction) -> String {
        self.root.join(action.target()).to_string()
    }
}

/// Submits `action` to the queue under its target-path partition key.
pub fn submit(
    queue: &Arc<OpQueue>,
    ctx: &Arc<ActionContext>,
    action: FileAction,
) -> Result<(), QueueStopped> {
    let partition_key = ctx.partition_key(&action);
    let timeout = ctx.task_timeout;
    let ctx = Arc::clone(ctx);
    queue.submit(
        partition_key,
        Some(timeout),
        Box::pin(async move {
            match perform(&ctx, &action).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    let permanent = e.chain().any(|cause| {
                        cause
                            .downcast_ref::<StoreError>()
                            .is_some_and(StoreError::is_permanent)
                    });
                    if permanent {
                        error!("unrecoverable remote failure, requesting shutdown: {e:#}");
                        ctx.fatal.cancel();
                    }
                    Err(e)
                }
            }
        }),
    )
}

/// Executes one action. Acceptable conditions (object or path already
/// absent) are logged and succeed; everything else propagates.
pub async fn perform(ctx: &ActionContext, action: &FileAction) -> anyhow::Result<()> {
    match action {
        FileAction::WriteObject {
            key,
            transformed_key,
        } => {
            let body = match ctx.store.get(key, &ctx.cancel).await {
                Ok(body) => body,
                Err(StoreError::NotFound) => {
                    // Listed or notified, then deleted remotely before we
                    // fetched it; the next event or resync settles it.
                    warn!("object {key:?} is gone from the remote, skipping write");
                    return Ok(());
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e).context(format!("fetch object {key:?}")))
                }
            };
            let written = fs_ops::atomic_write(
                &ctx.root,
                ctx.tmp_dir.as_deref(),
                &ctx.tmp_suffix,
                transformed_key,
                body.download_stream,
            )
            .await?;
            debug!("wrote {transformed_key:?} ({written} bytes)");
            Ok(())
        }
        FileAction::RemoveFile { relative_path } => {
            fs_ops::remove_file(&ctx.root, relative_path, ctx.prune_empty_dirs).await?;
            debug!("removed {relative_path:?}");
            Ok(())
        }
        FileAction::RemoveDirRecursive { relative_path } => {
            fs_ops::remove_dir_recursive(&ctx.root, relative_path).await?;
            debug!("removed subtree {relative_path:?}");
            Ok(())
        }
        FileAction::Mkdir { relative_path } => fs_ops::mkdir(&ctx.root, relative_path).await,
    }
}
