use std::num::NonZeroUsize;
use std::time::Duration;

/// AWS S3 bucket coordinates and client knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    /// Name of the bucket to mirror from.
    pub bucket_name: String,
    /// The region where the bucket is located at.
    pub bucket_region: String,
    /// A base URL to send S3 requests to.
    /// By default, the endpoint is derived from a region name, assuming it's
    /// a real S3 bucket. Set this to point the client at MinIO or another
    /// S3-compatible service instead.
    pub endpoint: Option<String>,
    /// Concurrency limit to apply to the client's requests, to stay below
    /// the provider's requests-per-second thresholds.
    pub concurrency_limit: NonZeroUsize,
    /// Per-request timeout for GetObject calls.
    pub request_timeout: Duration,
}

impl S3Config {
    pub fn new(bucket_name: String, bucket_region: String) -> Self {
        Self {
            bucket_name,
            bucket_region,
            endpoint: None,
            concurrency_limit: NonZeroUsize::new(100).unwrap(),
            request_timeout: Duration::from_secs(60),
        }
    }
}
