use gengtu_contracts::ledger::LedgerError;
use thiserror::Error;

use crate::signer::SignError;

pub const TEXT_SERVICE: &str = "text service";
pub const IMAGE_SERVICE: &str = "image service";

/// Coarse classification used to pick a job transition and a caller response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before (or instead of) doing paid work.
    BusinessRule,
    /// The remote answered, but not in the expected shape.
    UpstreamFormat,
    /// Non-2xx, timeout or connection failure.
    Transport,
    /// Ledger, filesystem or signing failure on our side.
    Storage,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BusinessRule => "business_rule",
            Self::UpstreamFormat => "upstream_format",
            Self::Transport => "transport",
            Self::Storage => "storage",
        }
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("answer must not be empty")]
    MissingAnswer,

    #[error("account not found: {account_id}")]
    UnknownAccount { account_id: String },

    #[error("account {account_id} has no credits left")]
    InsufficientCredits { account_id: String },

    #[error("{service} returned no text")]
    EmptyUpstreamResponse { service: &'static str },

    #[error("prompt response has {found} marked block(s), expected at least 2")]
    MalformedPromptFormat { found: usize },

    #[error("{service} request failed: {detail}")]
    UpstreamHttp {
        service: &'static str,
        status: Option<u16>,
        detail: String,
    },

    #[error("{service} response has no data.binary_data_base64[0]")]
    MissingImageField { service: &'static str },

    #[error("{service} returned a body that is not valid JSON")]
    MalformedUpstreamJson {
        service: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("image payload could not be decoded: {reason}")]
    ImageDecode { reason: String },

    #[error("failed to store image artifact: {0}")]
    Artifact(#[source] std::io::Error),

    #[error("ledger failure: {0}")]
    Ledger(#[source] LedgerError),

    #[error("request signing failed: {0}")]
    Signing(#[from] SignError),
}

impl GenerationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingAnswer | Self::UnknownAccount { .. } | Self::InsufficientCredits { .. } => {
                ErrorKind::BusinessRule
            }
            Self::EmptyUpstreamResponse { .. }
            | Self::MalformedPromptFormat { .. }
            | Self::MissingImageField { .. }
            | Self::MalformedUpstreamJson { .. }
            | Self::ImageDecode { .. } => ErrorKind::UpstreamFormat,
            Self::UpstreamHttp { .. } => ErrorKind::Transport,
            Self::Artifact(_) | Self::Ledger(_) | Self::Signing(_) => ErrorKind::Storage,
        }
    }

    /// Message safe to hand back to callers. Upstream bodies never appear in
    /// any variant's text; storage details are collapsed.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Storage => "internal storage error".to_string(),
            _ => self.to_string(),
        }
    }

    pub(crate) fn transport(service: &'static str, err: &reqwest::Error) -> Self {
        let detail = if err.is_timeout() {
            "timed out".to_string()
        } else if err.is_connect() {
            "connection failed".to_string()
        } else {
            "transport error".to_string()
        };
        Self::UpstreamHttp {
            service,
            status: err.status().map(|status| status.as_u16()),
            detail,
        }
    }

    pub(crate) fn http_status(service: &'static str, status: u16) -> Self {
        Self::UpstreamHttp {
            service,
            status: Some(status),
            detail: format!("HTTP {status}"),
        }
    }
}

impl From<LedgerError> for GenerationError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientCredits { account_id } => {
                Self::InsufficientCredits { account_id }
            }
            LedgerError::UnknownAccount { account_id } => Self::UnknownAccount { account_id },
            other => Self::Ledger(other),
        }
    }
}
