//! AWS S3 implementation of [`ObjectStore`].
//!
//! Listing calls are retried in a bounded loop since a full-sync pass should
//! survive transient throttling; object fetches are single-shot and leave
//! retrying to the caller, which may have newer information by then.

use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use anyhow::Context as _;
use aws_config::{
    environment::credentials::EnvironmentVariableCredentialsProvider,
    imds::credentials::ImdsCredentialsProvider,
    meta::credentials::CredentialsProviderChain,
    profile::ProfileFileCredentialsProvider,
    provider_config::ProviderConfig,
    retry::{RetryConfigBuilder, RetryMode},
    web_identity_token::WebIdentityTokenCredentialsProvider,
    BehaviorVersion,
};
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_s3::{
    config::{AsyncSleep, Builder, IdentityCache, Region, SharedAsyncSleep},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    operation::{get_object::GetObjectError, list_objects_v2::ListObjectsV2Error},
    Client,
};
use aws_smithy_async::rt::sleep::TokioSleep;
use bytes::Bytes;
use futures::stream::Stream;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{ListPage, ObjectBody, ObjectStore, RemoteObjectMeta, S3Config, StoreError};

/// Transient listing failures are retried this many times before the error
/// is surfaced to the caller.
const LIST_MAX_RETRIES: usize = 8;
const LIST_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// AWS S3 bucket client.
pub struct S3Store {
    client: Client,
    bucket_name: String,
    // Every request to S3 can be throttled or cancelled, if a certain number
    // of requests per second is exceeded. The semaphore keeps us below the
    // thresholds.
    concurrency_limiter: Arc<Semaphore>,
    request_timeout: Duration,
}

impl S3Store {
    /// Creates the S3 storage, errors if incorrect AWS S3 configuration provided.
    pub fn new(conf: &S3Config) -> anyhow::Result<Self> {
        tracing::debug!("Creating s3 client for bucket {}", conf.bucket_name);

        let region = Some(Region::new(conf.bucket_region.clone()));

        let provider_conf = ProviderConfig::without_region().with_region(region.clone());

        let credentials_provider = {
            // uses "AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"
            CredentialsProviderChain::first_try(
                "env",
                EnvironmentVariableCredentialsProvider::new(),
            )
            // uses "AWS_PROFILE" / `aws sso login --profile <profile>`
            .or_else(
                "profile-sso",
                ProfileFileCredentialsProvider::builder()
                    .configure(&provider_conf)
                    .build(),
            )
            // uses "AWS_WEB_IDENTITY_TOKEN_FILE", "AWS_ROLE_ARN", "AWS_ROLE_SESSION_NAME"
            .or_else(
                "token",
                WebIdentityTokenCredentialsProvider::builder()
                    .configure(&provider_conf)
                    .build(),
            )
            // uses imds v2
            .or_else("imds", ImdsCredentialsProvider::builder().build())
        };

        // AWS SDK requires us to specify how the RetryConfig should sleep when it wants to back off
        let sleep_impl: Arc<dyn AsyncSleep> = Arc::new(TokioSleep::new());

        // We do our own retries for listing. However, for the AWS SDK to
        // enable rate limiting in response to throttling responses (e.g. 429
        // on too many ListObjectsV2 requests), we must provide a retry
        // config. We set it to use at most one attempt, and enable
        // 'Adaptive' mode, which causes rate limiting to be enabled.
        let mut retry_config = RetryConfigBuilder::new();
        retry_config
            .set_max_attempts(Some(1))
            .set_mode(Some(RetryMode::Adaptive));

        let mut config_builder = Builder::default()
            .behavior_version(BehaviorVersion::v2023_11_09())
            .region(region)
            .identity_cache(IdentityCache::lazy().build())
            .credentials_provider(SharedCredentialsProvider::new(credentials_provider))
            .retry_config(retry_config.build())
            .sleep_impl(SharedAsyncSleep::from(sleep_impl));

        if let Some(custom_endpoint) = conf.endpoint.clone() {
            config_builder = config_builder
                .endpoint_url(custom_endpoint)
                .force_path_style(true);
        }

        let client = Client::from_conf(config_builder.build());

        Ok(Self {
            client,
            bucket_name: conf.bucket_name.clone(),
            concurrency_limiter: Arc::new(Semaphore::new(conf.concurrency_limit.get())),
            request_timeout: conf.request_timeout,
        })
    }

    async fn permit(
        &self,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::SemaphorePermit<'_>, StoreError> {
        tokio::select! {
            permit = self.concurrency_limiter.acquire() => {
                Ok(permit.expect("semaphore is never closed"))
            }
            _ = cancel.cancelled() => Err(StoreError::Cancelled),
        }
    }

    async fn list_page_once(
        &self,
        prefix: Option<&str>,
        max_keys: NonZeroU32,
        continuation_token: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<ListPage, StoreError> {
        let _permit = self.permit(cancel).await?;

        let request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket_name)
            .set_prefix(prefix.map(str::to_owned))
            .max_keys(max_keys.get() as i32)
            .set_continuation_token(continuation_token)
            .send();

        let response = tokio::select! {
            response = request => response,
            _ = tokio::time::sleep(self.request_timeout) => return Err(StoreError::Timeout),
            _ = cancel.cancelled() => return Err(StoreError::Cancelled),
        };

        let response = match response {
            Ok(response) => response,
            Err(SdkError::ServiceError(e))
                if matches!(e.err(), ListObjectsV2Error::NoSuchBucket(_)) =>
            {
                return Err(StoreError::BucketNotFound);
            }
            Err(e) if is_access_denied(&e) => return Err(StoreError::AccessDenied),
            Err(e) => {
                return Err(StoreError::Other(
                    anyhow::Error::new(e).context("list s3 objects"),
                ));
            }
        };

        let items = response
            .contents
            .unwrap_or_default()
            .into_iter()
            .filter_map(|object| {
                // Objects without a key or mtime have no place in a mirror;
                // S3 always reports both.
                let key = object.key?;
                let last_modified = object
                    .last_modified
                    .and_then(|t| SystemTime::try_from(t).ok())?;
                Some(RemoteObjectMeta {
                    key,
                    last_modified,
                    size: object.size.unwrap_or(0).max(0) as u64,
                })
            })
            .collect();

        Ok(ListPage {
            items,
            next_continuation_token: response.next_continuation_token,
        })
    }
}

impl ObjectStore for S3Store {
    async fn list_page(
        &self,
        prefix: Option<&str>,
        max_keys: NonZeroU32,
        continuation_token: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<ListPage, StoreError> {
        for trial in 0..LIST_MAX_RETRIES {
            match self
                .list_page_once(prefix, max_keys, continuation_token.clone(), cancel)
                .await
            {
                Ok(page) => return Ok(page),
                Err(
                    e @ (StoreError::Cancelled
                    | StoreError::BucketNotFound
                    | StoreError::AccessDenied),
                ) => return Err(e),
                Err(e) if trial + 1 == LIST_MAX_RETRIES => return Err(e),
                Err(e) => {
                    warn!(
                        "list_objects_v2 failed: bucket={}, prefix={:?}, error={e}",
                        self.bucket_name, prefix,
                    );
                    tokio::time::sleep(LIST_RETRY_PAUSE).await;
                }
            }
        }
        Err(StoreError::Other(anyhow::anyhow!(
            "unreachable unless LIST_MAX_RETRIES==0"
        )))
    }

    async fn get(&self, key: &str, cancel: &CancellationToken) -> Result<ObjectBody, StoreError> {
        let _permit = self.permit(cancel).await?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket_name)
            .key(key)
            .send();

        let response = tokio::select! {
            response = request => response,
            _ = tokio::time::sleep(self.request_timeout) => return Err(StoreError::Timeout),
            _ = cancel.cancelled() => return Err(StoreError::Cancelled),
        };

        let output = match response {
            Ok(output) => output,
            Err(SdkError::ServiceError(e)) if matches!(e.err(), GetObjectError::NoSuchKey(_)) => {
                // Not an error: the object may have been removed after it
                // was listed, or the notification may be stale.
                return Err(StoreError::NotFound);
            }
            Err(e) if is_access_denied(&e) => return Err(StoreError::AccessDenied),
            Err(e) => {
                tracing::error!("GetObject {key} failed: {}", DisplayErrorContext(&e));
                return Err(StoreError::Other(
                    anyhow::Error::new(e).context("download s3 object"),
                ));
            }
        };

        let last_modified = output
            .last_modified
            .and_then(|t| SystemTime::try_from(t).ok())
            .context("GetObject response without last-modified")?;
        let size = output.content_length.unwrap_or(0).max(0) as u64;

        Ok(ObjectBody {
            download_stream: Box::pin(ByteStreamAsStream::from(output.body)),
            last_modified,
            size,
        })
    }
}

fn is_access_denied<E: ProvideErrorMetadata, R>(err: &SdkError<E, R>) -> bool {
    matches!(err, SdkError::ServiceError(_)) && err.meta().code() == Some("AccessDenied")
}

pin_project_lite::pin_project! {
    struct ByteStreamAsStream {
        #[pin]
        inner: aws_smithy_types::byte_stream::ByteStream
    }
}

impl From<aws_smithy_types::byte_stream::ByteStream> for ByteStreamAsStream {
    fn from(inner: aws_smithy_types::byte_stream::ByteStream) -> Self {
        ByteStreamAsStream { inner }
    }
}

impl Stream for ByteStreamAsStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // this does the std::io::ErrorKind::Other conversion
        self.project().inner.poll_next(cx).map_err(|x| x.into())
    }
}
