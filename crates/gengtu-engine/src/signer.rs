//! HMAC-SHA256 request signing for the image service.
//!
//! The remote side rebuilds the exact same canonical request from what it
//! receives and compares signatures, so every byte produced here (query order,
//! header order, trailing newlines) is part of the wire contract.

use std::fmt;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const ALGORITHM: &str = "HMAC-SHA256";
pub const SIGNED_HEADERS: &str = "content-type;host;x-content-sha256;x-date";

const SCOPE_TERMINATOR: &str = "request";
const X_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const DATE_STAMP_FORMAT: &str = "%Y%m%d";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("signing access key is empty")]
    EmptyAccessKey,

    #[error("signing secret key is empty")]
    EmptySecretKey,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignError {
    #[error("HMAC rejected a {len}-byte key")]
    InvalidKey { len: usize },
}

/// Access key + secret. Both halves must be non-empty; there is no way to
/// build a credential that would sign with a blank key.
#[derive(Debug)]
pub struct SigningCredential {
    access_key: String,
    secret_key: SecretString,
}

impl SigningCredential {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        let access_key = access_key.into().trim().to_string();
        let secret_key = secret_key.into().trim().to_string();
        if access_key.is_empty() {
            return Err(CredentialError::EmptyAccessKey);
        }
        if secret_key.is_empty() {
            return Err(CredentialError::EmptySecretKey);
        }
        Ok(Self {
            access_key,
            secret_key: SecretString::from(secret_key),
        })
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }
}

/// The parts of an outgoing request that take part in the signature.
#[derive(Debug, Clone, Copy)]
pub struct SignableRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a [(&'a str, &'a str)],
    pub content_type: &'a str,
    pub host: &'a str,
    pub body: &'a [u8],
}

/// Header values to attach to the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub authorization: String,
    pub content_sha256: String,
    pub x_date: String,
    pub canonical_query: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: String,
    pub signed_headers: &'static str,
    pub payload_hash: String,
}

impl CanonicalRequest {
    pub fn build(request: &SignableRequest<'_>, x_date: &str) -> Self {
        let payload_hash = sha256_hex(request.body);
        let headers = format!(
            "content-type:{}\nhost:{}\nx-content-sha256:{}\nx-date:{}\n",
            request.content_type, request.host, payload_hash, x_date
        );
        Self {
            method: request.method.to_ascii_uppercase(),
            path: request.path.to_string(),
            query: canonical_query(request.query),
            headers,
            signed_headers: SIGNED_HEADERS,
            payload_hash,
        }
    }

    pub fn digest(&self) -> String {
        sha256_hex(self.to_string().as_bytes())
    }
}

impl fmt::Display for CanonicalRequest {
    // `headers` already ends in '\n'; the extra '\n' yields the blank line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.method,
            self.path,
            self.query,
            self.headers,
            self.signed_headers,
            self.payload_hash
        )
    }
}

pub fn sign(
    credential: &SigningCredential,
    timestamp: DateTime<Utc>,
    region: &str,
    service: &str,
    request: &SignableRequest<'_>,
) -> Result<SignedRequest, SignError> {
    let x_date = timestamp.format(X_DATE_FORMAT).to_string();
    let date_stamp = timestamp.format(DATE_STAMP_FORMAT).to_string();

    let canonical = CanonicalRequest::build(request, &x_date);
    let scope = credential_scope(&date_stamp, region, service);
    let to_sign = string_to_sign(&x_date, &scope, &canonical.digest());
    let signing_key = derive_signing_key(
        credential.secret_key.expose_secret(),
        &date_stamp,
        region,
        service,
    )?;
    let signature = hex::encode(hmac_sha256(&signing_key, to_sign.as_bytes())?);
    tracing::debug!(
        credential_scope = %scope,
        canonical_query = %canonical.query,
        payload_hash = %canonical.payload_hash,
        "request signed"
    );

    Ok(SignedRequest {
        authorization: format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
            credential.access_key
        ),
        content_sha256: canonical.payload_hash,
        x_date,
        canonical_query: canonical.query,
    })
}

/// `k=v` pairs sorted by key (then value) and joined with `&`. Values are used
/// as given; callers pass already-normalised parameters.
pub fn canonical_query(params: &[(&str, &str)]) -> String {
    let mut sorted = params.to_vec();
    sorted.sort();
    sorted
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<String>>()
        .join("&")
}

pub fn credential_scope(date_stamp: &str, region: &str, service: &str) -> String {
    format!("{date_stamp}/{region}/{service}/{SCOPE_TERMINATOR}")
}

pub fn string_to_sign(x_date: &str, scope: &str, canonical_digest: &str) -> String {
    format!("{ALGORITHM}\n{x_date}\n{scope}\n{canonical_digest}")
}

/// kDate -> kRegion -> kService -> kSigning.
pub fn derive_signing_key(
    secret: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, SignError> {
    let k_date = hmac_sha256(secret.as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, SCOPE_TERMINATOR.as_bytes())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<Vec<u8>, SignError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| SignError::InvalidKey { len: key.len() })?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}
