use std::time::Duration;

use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::Value;

use crate::error::GenerationError;

const LOGGED_BODY_CHARS: usize = 512;

pub(crate) fn build_client(timeout: Duration) -> Result<HttpClient, reqwest::Error> {
    HttpClient::builder().timeout(timeout).build()
}

/// Reads the body, rejects non-2xx statuses and parses JSON. Error bodies are
/// logged truncated and never copied into the returned error.
pub(crate) fn response_json_or_error(
    service: &'static str,
    response: HttpResponse,
) -> Result<Value, GenerationError> {
    let status = response.status();
    let body = response
        .text()
        .map_err(|err| GenerationError::transport(service, &err))?;
    if !status.is_success() {
        tracing::warn!(
            service,
            status = status.as_u16(),
            body = %truncate_text(&body, LOGGED_BODY_CHARS),
            "upstream returned an error status"
        );
        return Err(GenerationError::http_status(service, status.as_u16()));
    }
    serde_json::from_str(&body).map_err(|source| {
        tracing::warn!(
            service,
            body = %truncate_text(&body, LOGGED_BODY_CHARS),
            "upstream returned invalid JSON"
        );
        GenerationError::MalformedUpstreamJson { service, source }
    })
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
