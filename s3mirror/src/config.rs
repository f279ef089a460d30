//! Daemon configuration: everything the command line can set, validated
//! once at start-up. Option interdependencies are fatal here rather than
//! surprising later.

use std::num::NonZeroU32;
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::transform::{KeyTransform, PlatformProfile, TransformPipeline, UnicodeForm};

/// Verbosity surfaced as `--log`; `RUST_LOG` overrides it when set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    None,
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::None => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LogLevel::None => "none",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        })
    }
}

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Remote bucket to mirror.
    pub bucket: String,
    /// Local mirror root.
    pub root_dir: Utf8PathBuf,
    pub region: String,
    /// Custom S3-compatible endpoint (MinIO, localstack). Also used for the
    /// pub/sub control plane when subscribing.
    pub s3_endpoint_url: Option<String>,
    /// Serve objects from a local directory instead of S3.
    pub local_store: Option<Utf8PathBuf>,
    pub tmp_suffix: String,
    pub tmp_dir: Option<Utf8PathBuf>,
    /// Permit deletions during reconciliation.
    pub remove: bool,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub normalization_form: Option<UnicodeForm>,
    pub ignore_key_platform_dir_char_replacement: bool,
    pub ignore_key_root_char_replacement: bool,
    pub max_concurrency: usize,
    pub max_keys: NonZeroU32,
    pub skip_initial_sync: bool,
    /// `None` disables the periodic resync timer.
    pub resync_interval: Option<Duration>,
    pub host: String,
    /// The ingress server runs only when a port is configured.
    pub port: Option<u16>,
    pub https_cert_path: Option<Utf8PathBuf>,
    pub https_cert_key_path: Option<Utf8PathBuf>,
    /// When set, the ingress accepts POSTs on this path only.
    pub http_path: Option<String>,
    pub topic_arn: Option<String>,
    /// Public URL of this mirror's ingress, handed to Subscribe.
    pub endpoint: Option<String>,
    pub ignore_unsubscribe_on_shutdown: bool,
    pub ignore_message_validation: bool,
    pub prune_empty_dirs: bool,
    pub task_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub log: LogLevel,
}

impl MirrorConfig {
    /// Fatal configuration checks, run before anything is started.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.bucket.is_empty(), "bucket must not be empty");
        anyhow::ensure!(
            !self.tmp_suffix.is_empty(),
            "tmp-suffix must not be empty: staging files would collide with targets"
        );
        anyhow::ensure!(
            self.topic_arn.is_some() == self.endpoint.is_some(),
            "topic-arn and endpoint must be set together"
        );
        anyhow::ensure!(
            self.topic_arn.is_none() || self.port.is_some(),
            "subscribing requires the ingress server: set --port"
        );
        anyhow::ensure!(
            self.https_cert_path.is_some() == self.https_cert_key_path.is_some(),
            "https-cert-path and https-cert-key-path must be set together"
        );
        if let Some(path) = &self.http_path {
            anyhow::ensure!(
                path.starts_with('/'),
                "http-path must start with '/', got {path:?}"
            );
        }
        Ok(())
    }

    /// The configuration-bound transformer pipeline, in its fixed order:
    /// root stripping, separator normalization, Unicode normalization.
    pub fn pipeline(&self) -> TransformPipeline {
        let mut transforms = Vec::new();
        if !self.ignore_key_root_char_replacement {
            transforms.push(KeyTransform::StripRootPrefix);
        }
        if !self.ignore_key_platform_dir_char_replacement {
            transforms.push(KeyTransform::NormalizeSeparators(PlatformProfile::host()));
        }
        if let Some(form) = self.normalization_form {
            transforms.push(KeyTransform::UnicodeNormalize(form));
        }
        TransformPipeline::new(transforms)
    }

    pub fn ingress_enabled(&self) -> bool {
        self.port.is_some()
    }

    /// Protocol named in the Subscribe call, matching the endpoint URL.
    pub fn subscribe_protocol(&self) -> &'static str {
        match &self.endpoint {
            Some(endpoint) if endpoint.starts_with("https://") => "https",
            _ => "http",
        }
    }
}
