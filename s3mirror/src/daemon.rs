//! Start/stop orchestration: wires the store, queue, ingress and timers
//! together, then waits for a shutdown signal and tears everything down in
//! order: stop intake, stop the timer, unsubscribe, stop the server,
//! drain the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use remote_store::{
    GenericObjectStore, LocalFsStore, S3Config, S3Store, SnsControl, SubscriptionControl,
};

use crate::action::ActionContext;
use crate::config::MirrorConfig;
use crate::fs_ops;
use crate::ingress::signature::MessageValidator;
use crate::ingress::{self, Ingress, IngressConfig};
use crate::queue::{OpQueue, DEFAULT_REAPER_INTERVAL};
use crate::subscription::SubscriptionTracker;
use crate::sync::{self, SyncParams};

/// Runs the mirror until a termination signal arrives or a fatal error is
/// hit. Returns `Err` for unrecoverable failures; the process exits
/// non-zero on those.
pub async fn run(config: MirrorConfig) -> anyhow::Result<()> {
    let control: Option<Arc<dyn SubscriptionControl>> = if config.topic_arn.is_some() {
        Some(Arc::new(
            SnsControl::new(config.region.clone(), config.s3_endpoint_url.clone()).await,
        ))
    } else {
        None
    };

    // Translate unix signals into one cancellation that every other
    // shutdown path in here hangs off.
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match wait_for_signal().await {
                Ok(()) => info!("terminating on signal"),
                Err(e) => error!("signal listener failed: {e:#}"),
            }
            shutdown.cancel();
        }
    });

    run_with_control(config, control, shutdown).await
}

async fn wait_for_signal() -> anyhow::Result<()> {
    let mut sigint = tokio::signal::unix::signal(SignalKind::interrupt())?;
    let mut sigquit = tokio::signal::unix::signal(SignalKind::quit())?;
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// The orchestration proper, with the control plane and the shutdown
/// trigger injected so tests can drive both.
pub async fn run_with_control(
    config: MirrorConfig,
    control: Option<Arc<dyn SubscriptionControl>>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    config.validate()?;
    let pipeline = config.pipeline();

    let store = match &config.local_store {
        Some(path) => {
            info!("using local directory {path:?} as the remote store");
            GenericObjectStore::LocalFs(LocalFsStore::new(path.clone())?)
        }
        None => {
            info!(
                "using s3 bucket {:?} in region {:?} as the remote store, endpoint: {:?}",
                config.bucket, config.region, config.s3_endpoint_url
            );
            let mut s3_config = S3Config::new(config.bucket.clone(), config.region.clone());
            s3_config.endpoint = config.s3_endpoint_url.clone();
            GenericObjectStore::AwsS3(Arc::new(S3Store::new(&s3_config)?))
        }
    };

    fs_ops::ensure_dir(&config.root_dir)
        .await
        .context("create mirror root")?;

    // The reaper must outlive the final drain (draining relies on it to
    // release timed-out slots), so it gets its own token rather than a
    // child of `shutdown`.
    let reaper_cancel = CancellationToken::new();
    let queue = OpQueue::new(config.max_concurrency, DEFAULT_REAPER_INTERVAL, &reaper_cancel);

    let ops_cancel = CancellationToken::new();
    let fatal = CancellationToken::new();
    let ctx = Arc::new(ActionContext {
        store,
        root: config.root_dir.clone(),
        tmp_dir: config.tmp_dir.clone(),
        tmp_suffix: config.tmp_suffix.clone(),
        prune_empty_dirs: config.prune_empty_dirs,
        task_timeout: config.task_timeout,
        cancel: ops_cancel.clone(),
        fatal: fatal.clone(),
    });

    let params = SyncParams {
        prefix: config.prefix.clone(),
        suffix: config.suffix.clone(),
        max_keys: config.max_keys,
        remove: config.remove,
        pipeline: pipeline.clone(),
    };

    let subscription = Arc::new(SubscriptionTracker::new());

    // Ingress server, when a port is configured.
    let server_cancel = CancellationToken::new();
    let mut server_task = None;
    if let Some(port) = config.port {
        let listener = TcpListener::bind((config.host.as_str(), port))
            .await
            .with_context(|| format!("bind ingress listener on {}:{port}", config.host))?;
        let tls = match (&config.https_cert_path, &config.https_cert_key_path) {
            (Some(cert), Some(key)) => Some(ingress::tls_acceptor(cert, key)?),
            _ => None,
        };
        let ingress = Ingress::new(
            IngressConfig {
                http_path: config.http_path.clone(),
                validate_messages: !config.ignore_message_validation,
                bucket: config.bucket.clone(),
                prefix: config.prefix.clone(),
                suffix: config.suffix.clone(),
                min_event_version: (2, 1),
            },
            pipeline.clone(),
            MessageValidator::new(None),
            Arc::clone(&queue),
            Arc::clone(&ctx),
            control.clone(),
            Arc::clone(&subscription),
        );
        info!(
            "ingress listening on {}:{port} ({})",
            config.host,
            if tls.is_some() { "https" } else { "http" }
        );
        server_task = Some(tokio::spawn(ingress::serve(
            ingress,
            listener,
            tls,
            server_cancel.clone(),
        )));
    }

    // Subscribe once the server is up; failure here is a start-up failure.
    if let (Some(topic_arn), Some(endpoint), Some(control)) =
        (&config.topic_arn, &config.endpoint, &control)
    {
        let arn = control
            .subscribe(topic_arn, endpoint, config.subscribe_protocol())
            .await
            .context("Subscribe failed")?;
        info!("subscribed to {topic_arn:?} as {arn:?}");
        subscription.requested(arn);
    }

    if config.skip_initial_sync {
        info!("initial sync skipped by configuration");
    } else {
        sync::run_full_sync(&queue, &ctx, &params)
            .await
            .context("initial full sync")?;
    }

    // Periodic resync, guarded against overlapping passes.
    let mut resync_task = None;
    if let Some(interval) = config.resync_interval {
        let queue = Arc::clone(&queue);
        let ctx = Arc::clone(&ctx);
        let params = params.clone();
        let cancel = shutdown.child_token();
        resync_task = Some(tokio::spawn(async move {
            let sync_running = AtomicBool::new(false);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the immediate first tick; start-up already synced
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if sync_running.swap(true, Ordering::SeqCst) {
                    // Unreachable while ticks and syncs share this task,
                    // but the guard is what makes that assumption safe to
                    // change.
                    warn!("previous resync still running, skipping this tick");
                    continue;
                }
                if let Err(e) = sync::run_full_sync(&queue, &ctx, &params).await {
                    error!("periodic resync failed: {e:#}");
                }
                sync_running.store(false, Ordering::SeqCst);
            }
        }));
    }

    // Up and running. Wait for a reason to stop.
    let fatal_hit = tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = fatal.cancelled() => {
            error!("shutting down after an unrecoverable remote error");
            true
        }
    };

    // Teardown, in order: no new work, no timer, no subscription, no
    // server, then drain what is already queued.
    queue.stop(false);
    shutdown.cancel();
    if let Some(task) = resync_task {
        task.await.ok();
    }

    if !config.ignore_unsubscribe_on_shutdown {
        if let (Some(arn), Some(control)) = (subscription.take_for_unsubscribe(), &control) {
            match control.unsubscribe(&arn).await {
                Ok(()) => info!("unsubscribed {arn:?}"),
                Err(e) => warn!("Unsubscribe failed: {e:#}"),
            }
        }
    }

    server_cancel.cancel();
    if let Some(task) = server_task {
        task.await.ok();
    }

    if queue.drain(config.shutdown_timeout).await {
        info!("queue drained");
    } else {
        warn!("queue did not drain within the shutdown timeout");
    }
    ops_cancel.cancel();
    reaper_cancel.cancel();

    if fatal_hit {
        anyhow::bail!("unrecoverable remote error");
    }
    info!("shutdown complete");
    Ok(())
}
