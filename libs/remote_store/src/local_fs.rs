//! Local-directory implementation of [`ObjectStore`], for tests and offline
//! runs. Regular files below the root are exposed as objects whose keys are
//! `/`-separated relative paths; directories themselves are not listed,
//! matching object-store semantics.

use std::num::NonZeroU32;
use std::time::SystemTime;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::{ListPage, ObjectBody, ObjectStore, RemoteObjectMeta, StoreError, KEY_SEPARATOR};

#[derive(Debug, Clone)]
pub struct LocalFsStore {
    root: Utf8PathBuf,
}

impl LocalFsStore {
    /// Attempts to create local FS storage, along with its root directory.
    pub fn new(root: Utf8PathBuf) -> anyhow::Result<Self> {
        if !root.exists() {
            std::fs::create_dir_all(&root)
                .with_context(|| format!("Failed to create all directories in the given path {root:?}"))?;
        }
        Ok(Self { root })
    }

    fn key_to_path(&self, key: &str) -> Utf8PathBuf {
        let relative: Utf8PathBuf = key.split(KEY_SEPARATOR).collect();
        self.root.join(relative)
    }

    fn list_all_sorted(&self) -> anyhow::Result<Vec<RemoteObjectMeta>> {
        let mut entries = Vec::new();
        for entry in walkdir::WalkDir::new(self.root.as_std_path()) {
            let entry = entry.context("directory walk")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = Utf8Path::from_path(entry.path())
                .with_context(|| format!("non-utf8 path {:?}", entry.path()))?;
            let relative = path
                .strip_prefix(&self.root)
                .expect("walkdir yields paths under its root");
            let key = relative
                .components()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join("/");
            let metadata = entry.metadata().context("file metadata")?;
            entries.push(RemoteObjectMeta {
                key,
                last_modified: metadata.modified().context("file mtime")?,
                size: metadata.len(),
            });
        }
        entries.sort_unstable_by(|a, b| a.key.as_bytes().cmp(b.key.as_bytes()));
        Ok(entries)
    }
}

impl ObjectStore for LocalFsStore {
    async fn list_page(
        &self,
        prefix: Option<&str>,
        max_keys: NonZeroU32,
        continuation_token: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<ListPage, StoreError> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        let this = self.clone();
        let all = tokio::task::spawn_blocking(move || this.list_all_sorted())
            .await
            .context("listing task panicked")??;

        let prefix = prefix.unwrap_or("");
        let mut matching = all
            .into_iter()
            .filter(|object| object.key.starts_with(prefix))
            // A continuation token is the last key of the previous page;
            // keys are listed in ascending byte order, like S3 does.
            .skip_while(|object| match &continuation_token {
                Some(token) => object.key.as_str() <= token.as_str(),
                None => false,
            });

        let mut items = Vec::with_capacity(max_keys.get() as usize);
        for object in matching.by_ref() {
            items.push(object);
            if items.len() == max_keys.get() as usize {
                break;
            }
        }
        let next_continuation_token = if matching.next().is_some() {
            items.last().map(|object| object.key.clone())
        } else {
            None
        };

        Ok(ListPage {
            items,
            next_continuation_token,
        })
    }

    async fn get(&self, key: &str, cancel: &CancellationToken) -> Result<ObjectBody, StoreError> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        let path = self.key_to_path(key);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound)
            }
            Err(e) => {
                return Err(StoreError::Other(
                    anyhow::Error::new(e).context(format!("open {path:?}")),
                ))
            }
        };
        let metadata = file
            .metadata()
            .await
            .with_context(|| format!("metadata of {path:?}"))?;
        if metadata.is_dir() {
            return Err(StoreError::NotFound);
        }

        Ok(ObjectBody {
            download_stream: Box::pin(ReaderStream::new(file)),
            last_modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size: metadata.len(),
        })
    }
}
