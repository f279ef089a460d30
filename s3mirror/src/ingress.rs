//! Notification ingress: the HTTP(S) endpoint the pub/sub service pushes
//! object-change messages to.
//!
//! Every request is a JSON envelope tagged by `Type`. Subscription
//! confirmations are answered out of band (the 200 response is not held
//! back for the control-plane call); notifications decode to S3-style event
//! records which are filtered and dispatched into the same operation queue
//! the reconciler uses.

pub mod signature;

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context;
use hyper::body::HttpBody;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use remote_store::SubscriptionControl;

use crate::action::{self, ActionContext, FileAction};
use crate::queue::OpQueue;
use crate::subscription::SubscriptionTracker;
use crate::transform::TransformPipeline;

use self::signature::MessageValidator;

/// Push messages are small (the provider caps them at 256 KiB); anything
/// bigger is rejected before buffering.
const MAX_BODY_BYTES: u64 = 1024 * 1024;

/// Signed push envelope, decoded by its `Type` tag.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Type")]
pub enum Envelope {
    SubscriptionConfirmation(ConfirmationFields),
    UnsubscribeConfirmation(ConfirmationFields),
    Notification(NotificationFields),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmationFields {
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "MessageId")]
    pub message_id: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "TopicArn")]
    pub topic_arn: String,
    #[serde(rename = "Token")]
    pub token: String,
    #[serde(rename = "SubscribeURL")]
    pub subscribe_url: String,
    #[serde(rename = "Signature")]
    pub signature: Option<String>,
    #[serde(rename = "SignatureVersion")]
    pub signature_version: Option<String>,
    #[serde(rename = "SigningCertURL")]
    pub signing_cert_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationFields {
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "MessageId")]
    pub message_id: String,
    #[serde(rename = "Subject")]
    pub subject: Option<String>,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "TopicArn")]
    pub topic_arn: String,
    #[serde(rename = "Signature")]
    pub signature: Option<String>,
    #[serde(rename = "SignatureVersion")]
    pub signature_version: Option<String>,
    #[serde(rename = "SigningCertURL")]
    pub signing_cert_url: Option<String>,
}

impl Envelope {
    pub fn signature(&self) -> Option<&str> {
        match self {
            Envelope::SubscriptionConfirmation(f) | Envelope::UnsubscribeConfirmation(f) => {
                f.signature.as_deref()
            }
            Envelope::Notification(f) => f.signature.as_deref(),
        }
    }

    pub fn signature_version(&self) -> Option<&str> {
        match self {
            Envelope::SubscriptionConfirmation(f) | Envelope::UnsubscribeConfirmation(f) => {
                f.signature_version.as_deref()
            }
            Envelope::Notification(f) => f.signature_version.as_deref(),
        }
    }

    pub fn signing_cert_url(&self) -> Option<&str> {
        match self {
            Envelope::SubscriptionConfirmation(f) | Envelope::UnsubscribeConfirmation(f) => {
                f.signing_cert_url.as_deref()
            }
            Envelope::Notification(f) => f.signing_cert_url.as_deref(),
        }
    }

    /// The canonical string covered by the envelope signature: selected
    /// fields in a fixed order, each as `Name\nValue\n`.
    pub fn string_to_sign(&self) -> String {
        let mut fields: Vec<(&str, &str)> = Vec::with_capacity(8);
        match self {
            Envelope::Notification(f) => {
                fields.push(("Message", &f.message));
                fields.push(("MessageId", &f.message_id));
                if let Some(subject) = &f.subject {
                    fields.push(("Subject", subject));
                }
                fields.push(("Timestamp", &f.timestamp));
                fields.push(("TopicArn", &f.topic_arn));
                fields.push(("Type", "Notification"));
            }
            Envelope::SubscriptionConfirmation(f) | Envelope::UnsubscribeConfirmation(f) => {
                fields.push(("Message", &f.message));
                fields.push(("MessageId", &f.message_id));
                fields.push(("SubscribeURL", &f.subscribe_url));
                fields.push(("Timestamp", &f.timestamp));
                fields.push(("Token", &f.token));
                fields.push(("TopicArn", &f.topic_arn));
                fields.push((
                    "Type",
                    match self {
                        Envelope::SubscriptionConfirmation(_) => "SubscriptionConfirmation",
                        _ => "UnsubscribeConfirmation",
                    },
                ));
            }
        }
        let mut out = String::new();
        for (name, value) in fields {
            out.push_str(name);
            out.push('\n');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

/// The inner `Message` of a `Notification` envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Event {
    #[serde(rename = "Records", default)]
    pub records: Vec<S3EventRecord>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3EventRecord {
    pub event_version: String,
    pub event_name: String,
    pub s3: S3Entity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Entity {
    pub bucket: S3BucketEntity,
    pub object: S3ObjectEntity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3BucketEntity {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3ObjectEntity {
    pub key: String,
    pub size: Option<u64>,
    pub e_tag: Option<String>,
}

/// Static ingress policy, fixed at start-up.
#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// When set, POSTs to any other path are rejected with 404.
    pub http_path: Option<String>,
    pub validate_messages: bool,
    /// Records naming any other bucket are skipped.
    pub bucket: String,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    /// Required event-version major and minimum minor.
    pub min_event_version: (u32, u32),
}

pub struct Ingress {
    config: IngressConfig,
    pipeline: TransformPipeline,
    validator: MessageValidator,
    queue: Arc<OpQueue>,
    ctx: Arc<ActionContext>,
    control: Option<Arc<dyn SubscriptionControl>>,
    subscription: Arc<SubscriptionTracker>,
}

impl Ingress {
    pub fn new(
        config: IngressConfig,
        pipeline: TransformPipeline,
        validator: MessageValidator,
        queue: Arc<OpQueue>,
        ctx: Arc<ActionContext>,
        control: Option<Arc<dyn SubscriptionControl>>,
        subscription: Arc<SubscriptionTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            pipeline,
            validator,
            queue,
            ctx,
            control,
            subscription,
        })
    }

    pub async fn handle_request(self: Arc<Self>, req: Request<Body>) -> Response<Body> {
        if req.method() != Method::POST {
            return status_response(StatusCode::METHOD_NOT_ALLOWED);
        }
        if let Some(expected) = &self.config.http_path {
            if req.uri().path() != expected {
                return status_response(StatusCode::NOT_FOUND);
            }
        }

        let body = match read_body_bounded(req.into_body()).await {
            Ok(body) => body,
            Err(BodyError::TooLarge) => {
                warn!("rejecting oversized notification body");
                return status_response(StatusCode::PAYLOAD_TOO_LARGE);
            }
            Err(BodyError::Read(e)) => {
                warn!("failed to read request body: {e}");
                return status_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        match self.process_message(&body).await {
            Ok(()) => status_response(StatusCode::OK),
            Err(e) => {
                warn!("rejecting notification: {e:#}");
                status_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    async fn process_message(&self, body: &[u8]) -> anyhow::Result<()> {
        let envelope: Envelope =
            serde_json::from_slice(body).context("parse notification envelope")?;

        if self.config.validate_messages {
            self.validator
                .verify(&envelope)
                .await
                .context("message signature validation")?;
        }

        match envelope {
            Envelope::SubscriptionConfirmation(fields) => {
                info!(
                    "subscription confirmation for topic {:?} received",
                    fields.topic_arn
                );
                match &self.control {
                    Some(control) => {
                        // Confirm out of band: the provider expects the 200
                        // response promptly and retries otherwise.
                        let control = Arc::clone(control);
                        let subscription = Arc::clone(&self.subscription);
                        tokio::spawn(async move {
                            match control
                                .confirm_subscription(&fields.topic_arn, &fields.token)
                                .await
                            {
                                Ok(()) => subscription.confirmed(),
                                Err(e) => error!("ConfirmSubscription failed: {e:#}"),
                            }
                        });
                    }
                    None => warn!("no control plane configured, confirmation token ignored"),
                }
            }
            Envelope::UnsubscribeConfirmation(fields) => {
                info!(
                    "unsubscribe confirmation for topic {:?} received",
                    fields.topic_arn
                );
            }
            Envelope::Notification(fields) => {
                let event: S3Event = serde_json::from_str(&fields.message)
                    .context("parse inner notification message")?;
                for record in event.records {
                    if let Some(planned) = plan_record(&self.config, &self.pipeline, &record) {
                        if action::submit(&self.queue, &self.ctx, planned).is_err() {
                            warn!("queue is stopped, dropping notification record");
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Decides what a single event record means for the mirror. Record-level
/// problems are logged and skipped; they never fail the whole request.
pub fn plan_record(
    config: &IngressConfig,
    pipeline: &TransformPipeline,
    record: &S3EventRecord,
) -> Option<FileAction> {
    let (required_major, min_minor) = config.min_event_version;
    match parse_event_version(&record.event_version) {
        Some((major, minor)) if major == required_major && minor >= min_minor => {}
        _ => {
            warn!(
                "unsupported eventVersion {:?}, skipping record",
                record.event_version
            );
            return None;
        }
    }

    if record.s3.bucket.name != config.bucket {
        debug!(
            "record for foreign bucket {:?}, skipping",
            record.s3.bucket.name
        );
        return None;
    }

    // Object keys arrive URL-encoded, with '+' standing in for a space.
    let key = match urlencoding::decode(&record.s3.object.key.replace('+', " ")) {
        Ok(key) => key.into_owned(),
        Err(e) => {
            warn!("undecodable object key {:?}: {e}", record.s3.object.key);
            return None;
        }
    };

    if let Some(prefix) = &config.prefix {
        if !key.starts_with(prefix.as_str()) {
            return None;
        }
    }
    if let Some(suffix) = &config.suffix {
        if !key.ends_with(suffix.as_str()) {
            return None;
        }
    }

    let transformed_key = pipeline.apply(&key);
    if TransformPipeline::is_dropped(&transformed_key) {
        debug!("key {key:?} reduces to nothing after transformation, dropped");
        return None;
    }

    let event_name = record.event_name.as_str();
    if event_name.starts_with("ObjectCreated:") || event_name.starts_with("ObjectRestore:") {
        Some(FileAction::for_remote_object(key, transformed_key))
    } else if event_name.starts_with("ObjectRemoved:") {
        Some(FileAction::RemoveFile {
            relative_path: transformed_key,
        })
    } else {
        info!("unhandled event {event_name:?} for {key:?}, skipping");
        None
    }
}

fn parse_event_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = match parts.next() {
        Some(minor) => minor.parse().ok()?,
        None => 0,
    };
    Some((major, minor))
}

fn status_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("building an empty response cannot fail")
}

enum BodyError {
    TooLarge,
    Read(hyper::Error),
}

async fn read_body_bounded(mut body: Body) -> Result<Vec<u8>, BodyError> {
    if body.size_hint().lower() > MAX_BODY_BYTES {
        return Err(BodyError::TooLarge);
    }
    let mut buffer = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(BodyError::Read)?;
        if buffer.len() as u64 + chunk.len() as u64 > MAX_BODY_BYTES {
            return Err(BodyError::TooLarge);
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer)
}

/// Accept loop. Stops accepting when `cancel` fires; connections already
/// being served run to completion on their own tasks.
pub async fn serve(
    ingress: Arc<Ingress>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        debug!("connection from {peer}");
        tokio::spawn(handle_connection(
            Arc::clone(&ingress),
            stream,
            tls.clone(),
        ));
    }
    info!("ingress stopped accepting connections");
}

async fn handle_connection(
    ingress: Arc<Ingress>,
    stream: tokio::net::TcpStream,
    tls: Option<TlsAcceptor>,
) {
    let service = service_fn(move |req| {
        let ingress = Arc::clone(&ingress);
        async move { Ok::<_, Infallible>(ingress.handle_request(req).await) }
    });

    let served = match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => Http::new().serve_connection(tls_stream, service).await,
            Err(e) => {
                debug!("TLS handshake failed: {e}");
                return;
            }
        },
        None => Http::new().serve_connection(stream, service).await,
    };
    if let Err(e) = served {
        debug!("connection error: {e}");
    }
}

/// Builds the TLS acceptor from PEM certificate chain and key files.
pub fn tls_acceptor(
    cert_path: &camino::Utf8Path,
    key_path: &camino::Utf8Path,
) -> anyhow::Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(cert_path).with_context(|| format!("open {cert_path:?}"))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .with_context(|| format!("read certificates from {cert_path:?}"))?;
    anyhow::ensure!(!certs.is_empty(), "no certificates found in {cert_path:?}");

    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(key_path).with_context(|| format!("open {key_path:?}"))?,
    ))
    .with_context(|| format!("read private key from {key_path:?}"))?
    .with_context(|| format!("no private key found in {key_path:?}"))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("assemble TLS server config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
