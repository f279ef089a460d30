//! Push-message signature validation.
//!
//! Every signed envelope names the X.509 certificate it was signed with via
//! `SigningCertURL`. The URL is only trusted when it is https and its host
//! matches the expected provider pattern; the certificate is fetched once
//! per URL and cached for the lifetime of the process (the provider rotates
//! URLs, not certificate contents).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use ring::signature::{
    UnparsedPublicKey, RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY, RSA_PKCS1_2048_8192_SHA256,
};
use tracing::debug;

use super::Envelope;

/// Hosts allowed to serve signing certificates unless overridden:
/// `sns.<region>.amazonaws.com`, including the China partition.
static DEFAULT_CERT_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^sns\.[a-z0-9-]+\.amazonaws\.com(\.cn)?$").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("envelope carries no signature")]
    MissingSignature,
    #[error("signing certificate URL {0:?} is not acceptable")]
    BadCertUrl(String),
    #[error("failed to fetch signing certificate")]
    CertFetch(#[source] anyhow::Error),
    #[error("failed to parse signing certificate")]
    CertParse(#[source] anyhow::Error),
    #[error("unsupported signature version {0:?}")]
    UnsupportedVersion(String),
    #[error("signature does not verify")]
    BadSignature,
}

pub struct MessageValidator {
    cert_host_pattern: Regex,
    http_client: reqwest::Client,
    /// PEM bodies by certificate URL.
    cert_cache: Mutex<HashMap<String, Arc<Vec<u8>>>>,
}

impl MessageValidator {
    pub fn new(cert_host_pattern: Option<Regex>) -> Self {
        Self {
            cert_host_pattern: cert_host_pattern.unwrap_or_else(|| DEFAULT_CERT_HOST.clone()),
            http_client: reqwest::Client::new(),
            cert_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Verifies the envelope signature against the referenced certificate.
    pub async fn verify(&self, envelope: &Envelope) -> Result<(), ValidationError> {
        let cert_url = envelope
            .signing_cert_url()
            .ok_or(ValidationError::MissingSignature)?;
        self.check_cert_url(cert_url)?;

        let signature_b64 = envelope
            .signature()
            .ok_or(ValidationError::MissingSignature)?;
        let signature =
            base64::decode(signature_b64).map_err(|_| ValidationError::BadSignature)?;

        let algorithm = match envelope.signature_version() {
            Some("1") => &RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
            Some("2") => &RSA_PKCS1_2048_8192_SHA256,
            other => {
                return Err(ValidationError::UnsupportedVersion(
                    other.unwrap_or("<absent>").to_owned(),
                ))
            }
        };

        let pem = self.signing_cert(cert_url).await?;
        let public_key = rsa_public_key(&pem).map_err(ValidationError::CertParse)?;

        UnparsedPublicKey::new(algorithm, public_key)
            .verify(envelope.string_to_sign().as_bytes(), &signature)
            .map_err(|_| ValidationError::BadSignature)
    }

    fn check_cert_url(&self, cert_url: &str) -> Result<(), ValidationError> {
        let bad = || ValidationError::BadCertUrl(cert_url.to_owned());
        let parsed = reqwest::Url::parse(cert_url).map_err(|_| bad())?;
        if parsed.scheme() != "https" {
            return Err(bad());
        }
        let host = parsed.host_str().ok_or_else(bad)?;
        if !self.cert_host_pattern.is_match(host) {
            return Err(bad());
        }
        Ok(())
    }

    async fn signing_cert(&self, cert_url: &str) -> Result<Arc<Vec<u8>>, ValidationError> {
        if let Some(cached) = self.cert_cache.lock().unwrap().get(cert_url) {
            return Ok(Arc::clone(cached));
        }

        debug!("fetching signing certificate from {cert_url}");
        let fetch = async {
            let response = self
                .http_client
                .get(cert_url)
                .send()
                .await
                .context("certificate request")?
                .error_for_status()
                .context("certificate response status")?;
            let body = response.bytes().await.context("certificate body")?;
            anyhow::Ok(Arc::new(body.to_vec()))
        };
        let pem = fetch.await.map_err(ValidationError::CertFetch)?;

        self.cert_cache
            .lock()
            .unwrap()
            .insert(cert_url.to_owned(), Arc::clone(&pem));
        Ok(pem)
    }
}

/// Extracts the raw RSA public key (the SPKI bit string) from a PEM
/// certificate, in the form `ring` expects.
fn rsa_public_key(pem: &[u8]) -> anyhow::Result<Vec<u8>> {
    let (_, parsed_pem) =
        x509_parser::pem::parse_x509_pem(pem).map_err(|e| anyhow::anyhow!("bad PEM: {e}"))?;
    let cert = parsed_pem
        .parse_x509()
        .map_err(|e| anyhow::anyhow!("bad certificate DER: {e}"))?;
    Ok(cert
        .public_key()
        .subject_public_key
        .data
        .as_ref()
        .to_vec())
}
