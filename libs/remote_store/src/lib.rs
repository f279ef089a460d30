//! Clients for the remote side of the mirror: a generic object-store
//! abstraction with a few implementations, and the pub/sub control plane used
//! to manage push-notification subscriptions.
//!
//! [`ObjectStore`] is a read-only listing/fetching abstraction with two
//! implementations:
//!   * [`s3_store`] uses an AWS S3 bucket as the remote storage
//!   * [`local_fs`] exposes a local directory through the same interface,
//!     for tests and offline operation
#![deny(unsafe_code)]
#![deny(clippy::undocumented_unsafe_blocks)]

mod config;
mod error;
mod local_fs;
mod notify;
mod s3_store;

use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use futures::stream::Stream;
use tokio_util::sync::CancellationToken;

pub use self::config::S3Config;
pub use self::error::StoreError;
pub use self::local_fs::LocalFsStore;
pub use self::notify::{ControlCall, RecordingControl, SnsControl, SubscriptionControl};
pub use self::s3_store::S3Store;

/// Separator used in object keys, regardless of the host platform.
pub const KEY_SEPARATOR: char = '/';

/// One object as reported by a listing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObjectMeta {
    /// Opaque key, exactly as the store reports it.
    pub key: String,
    pub last_modified: SystemTime,
    pub size: u64,
}

/// A single page of a paginated listing.
#[derive(Debug, Default)]
pub struct ListPage {
    pub items: Vec<RemoteObjectMeta>,
    /// Token to pass to the next [`ObjectStore::list_page`] call; `None`
    /// when this was the last page.
    pub next_continuation_token: Option<String>,
}

/// Object contents, yielded as `std::io::Result<Bytes>` to be compatible
/// with `tokio::io::copy_buf` via `StreamReader`.
pub type DownloadStream =
    Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static>>;

pub struct ObjectBody {
    pub download_stream: DownloadStream,
    /// The last time the object was modified (`last-modified` header).
    pub last_modified: SystemTime,
    pub size: u64,
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBody")
            .field("last_modified", &self.last_modified)
            .field("size", &self.size)
            .finish()
    }
}

/// Read-only object store API, sufficient for mirroring: paginated listing
/// and whole-object fetch.
#[allow(async_fn_in_trait)]
pub trait ObjectStore: Send + Sync + 'static {
    /// List one page of objects, with semantics matching AWS S3's
    /// ListObjectsV2 (see
    /// `<https://docs.aws.amazon.com/AmazonS3/latest/API/API_ListObjectsV2.html>`).
    ///
    /// `prefix` is matched against raw keys server-side. `max_keys` bounds
    /// the page size; a `next_continuation_token` in the result means more
    /// pages remain.
    async fn list_page(
        &self,
        prefix: Option<&str>,
        max_keys: NonZeroU32,
        continuation_token: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<ListPage, StoreError>;

    /// Streams the contents of one object.
    ///
    /// Returns [`StoreError::NotFound`] when the key does not exist: callers
    /// are expected to race against deletions and treat that as a no-op.
    async fn get(&self, key: &str, cancel: &CancellationToken)
        -> Result<ObjectBody, StoreError>;
}

/// Every store currently supported. Serves as a simple way to pass around an
/// [`ObjectStore`] without dealing with generics.
#[derive(Clone)]
pub enum GenericObjectStore {
    AwsS3(Arc<S3Store>),
    LocalFs(LocalFsStore),
}

impl GenericObjectStore {
    /// See [`ObjectStore::list_page`]
    pub async fn list_page(
        &self,
        prefix: Option<&str>,
        max_keys: NonZeroU32,
        continuation_token: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<ListPage, StoreError> {
        match self {
            Self::AwsS3(s) => {
                s.list_page(prefix, max_keys, continuation_token, cancel)
                    .await
            }
            Self::LocalFs(s) => {
                s.list_page(prefix, max_keys, continuation_token, cancel)
                    .await
            }
        }
    }

    /// See [`ObjectStore::get`]
    pub async fn get(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<ObjectBody, StoreError> {
        match self {
            Self::AwsS3(s) => s.get(key, cancel).await,
            Self::LocalFs(s) => s.get(key, cancel).await,
        }
    }
}
