use std::num::NonZeroU32;

use camino::Utf8PathBuf;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use s3mirror::config::{LogLevel, MirrorConfig};
use s3mirror::daemon;
use s3mirror::transform::UnicodeForm;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help(true))]
struct Cli {
    /// Remote bucket to mirror
    #[arg(long)]
    bucket: String,

    /// Local directory the bucket is mirrored into
    #[arg(long)]
    root_dir: Utf8PathBuf,

    /// Bucket region
    #[arg(long, default_value = "us-east-1")]
    region: String,

    /// Custom S3-compatible endpoint URL (MinIO, localstack)
    #[arg(long)]
    s3_endpoint_url: Option<String>,

    /// Serve objects from this local directory instead of S3 (testing)
    #[arg(long)]
    local_store: Option<Utf8PathBuf>,

    /// Suffix of staging files written next to their targets
    #[arg(long, default_value = ".tmp")]
    tmp_suffix: String,

    /// Staging directory; defaults to the mirror root. Staging on another
    /// file system loses rename atomicity.
    #[arg(long)]
    tmp_dir: Option<Utf8PathBuf>,

    /// Permit deletion of local entries that have no remote counterpart
    #[arg(long, default_value_t = false)]
    remove: bool,

    /// Only mirror keys with this prefix (server-side filter)
    #[arg(long)]
    prefix: Option<String>,

    /// Only mirror keys with this suffix (client-side filter)
    #[arg(long)]
    suffix: Option<String>,

    /// Unicode-normalize keys and local names before comparing
    #[arg(long, value_enum)]
    normalization_form: Option<UnicodeForm>,

    /// Keep foreign directory separators in keys as-is
    #[arg(long, default_value_t = false)]
    ignore_key_platform_dir_char_replacement: bool,

    /// Keep leading separators / drive prefixes in keys as-is
    #[arg(long, default_value_t = false)]
    ignore_key_root_char_replacement: bool,

    /// Maximum number of distinct target paths mutated concurrently
    #[arg(long, default_value_t = 300)]
    max_concurrency: usize,

    /// Listing page size
    #[arg(long, default_value_t = NonZeroU32::new(1000).unwrap())]
    max_keys: NonZeroU32,

    /// Do not run the full synchronization at start-up
    #[arg(long, default_value_t = false)]
    skip_initial_sync: bool,

    /// Re-run the full synchronization at this interval; 0 disables it
    #[arg(long, default_value = "0s")]
    resync_interval: humantime::Duration,

    /// Ingress bind address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Ingress port; the notification server only runs when set
    #[arg(long)]
    port: Option<u16>,

    /// PEM certificate chain; enables TLS together with the key
    #[arg(long)]
    https_cert_path: Option<Utf8PathBuf>,

    /// PEM private key; enables TLS together with the certificate
    #[arg(long)]
    https_cert_key_path: Option<Utf8PathBuf>,

    /// Restrict the ingress to POSTs on this path
    #[arg(long)]
    http_path: Option<String>,

    /// Topic to subscribe to at start-up (requires --endpoint)
    #[arg(long)]
    topic_arn: Option<String>,

    /// Public URL of this mirror's ingress, handed to Subscribe
    #[arg(long)]
    endpoint: Option<String>,

    /// Leave the subscription in place on shutdown
    #[arg(long, default_value_t = false)]
    ignore_unsubscribe_on_shutdown: bool,

    /// Skip push-message signature validation
    #[arg(long, default_value_t = false)]
    ignore_message_validation: bool,

    /// Remove a parent directory that a file removal left empty
    #[arg(long, default_value_t = false)]
    prune_empty_dirs: bool,

    /// Per-task timeout after which a target path is released
    #[arg(long, default_value = "60s")]
    task_timeout: humantime::Duration,

    /// How long shutdown waits for queued work before discarding it
    #[arg(long, default_value = "30s")]
    shutdown_timeout: humantime::Duration,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log: LogLevel,
}

impl Cli {
    fn into_config(self) -> MirrorConfig {
        let resync_interval = match *self.resync_interval {
            interval if interval.is_zero() => None,
            interval => Some(interval),
        };
        MirrorConfig {
            bucket: self.bucket,
            root_dir: self.root_dir,
            region: self.region,
            s3_endpoint_url: self.s3_endpoint_url,
            local_store: self.local_store,
            tmp_suffix: self.tmp_suffix,
            tmp_dir: self.tmp_dir,
            remove: self.remove,
            prefix: self.prefix,
            suffix: self.suffix,
            normalization_form: self.normalization_form,
            ignore_key_platform_dir_char_replacement: self
                .ignore_key_platform_dir_char_replacement,
            ignore_key_root_char_replacement: self.ignore_key_root_char_replacement,
            max_concurrency: self.max_concurrency,
            max_keys: self.max_keys,
            skip_initial_sync: self.skip_initial_sync,
            resync_interval,
            host: self.host,
            port: self.port,
            https_cert_path: self.https_cert_path,
            https_cert_key_path: self.https_cert_key_path,
            http_path: self.http_path,
            topic_arn: self.topic_arn,
            endpoint: self.endpoint,
            ignore_unsubscribe_on_shutdown: self.ignore_unsubscribe_on_shutdown,
            ignore_message_validation: self.ignore_message_validation,
            prune_empty_dirs: self.prune_empty_dirs,
            task_timeout: *self.task_timeout,
            shutdown_timeout: *self.shutdown_timeout,
            log: self.log,
        }
    }
}

fn init_logging(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter_directive()));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::Layer::new()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_config();
    init_logging(config.log);
    daemon::run(config).await
}
