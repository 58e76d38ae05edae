use reqwest::blocking::Client as HttpClient;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use crate::config::{TextBackend, TextServiceConfig};
use crate::error::{GenerationError, TEXT_SERVICE};
use crate::http::{build_client, response_json_or_error};
use crate::prompt::{build_instruction, extract_prompt_pair, PromptPair};

/// Source of image prompts for a riddle answer.
///
/// Implementors only fetch the raw free-form text; the default
/// [`PromptGenerator::generate_prompt`] owns emptiness checks and block
/// extraction so every backend parses the same way.
pub trait PromptGenerator: Send + Sync {
    fn name(&self) -> &str;

    fn raw_response(&self, answer: &str) -> Result<String, GenerationError>;

    fn generate_prompt(&self, answer: &str) -> Result<PromptPair, GenerationError> {
        let text = self.raw_response(answer)?;
        if text.trim().is_empty() {
            return Err(GenerationError::EmptyUpstreamResponse {
                service: TEXT_SERVICE,
            });
        }
        extract_prompt_pair(&text)
    }
}

pub struct TextGenerationClient {
    backend: TextBackend,
    http: HttpClient,
}

impl TextGenerationClient {
    pub fn new(config: TextServiceConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: build_client(config.timeout)?,
            backend: config.backend,
        })
    }

    fn relay_response(&self, base_url: &str, answer: &str) -> Result<String, GenerationError> {
        let endpoint = format!("{base_url}/api/genemi");
        let response = self
            .http
            .post(&endpoint)
            .json(&json!({ "answer": answer }))
            .send()
            .map_err(|err| GenerationError::transport(TEXT_SERVICE, &err))?;
        let payload = response_json_or_error(TEXT_SERVICE, response)?;
        Ok(payload
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    fn gemini_response(
        &self,
        api_base: &str,
        api_key: &SecretString,
        model: &str,
        answer: &str,
    ) -> Result<String, GenerationError> {
        let endpoint = format!("{api_base}/models/{model}:generateContent");
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": build_instruction(answer) }],
            }],
        });
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.expose_secret())])
            .json(&payload)
            .send()
            .map_err(|err| GenerationError::transport(TEXT_SERVICE, &err))?;
        let payload = response_json_or_error(TEXT_SERVICE, response)?;
        Ok(extract_candidate_text(&payload))
    }
}

impl PromptGenerator for TextGenerationClient {
    fn name(&self) -> &str {
        match self.backend {
            TextBackend::Relay { .. } => "relay",
            TextBackend::Gemini { .. } => "gemini",
        }
    }

    fn raw_response(&self, answer: &str) -> Result<String, GenerationError> {
        tracing::debug!(backend = self.name(), "requesting prompt text");
        match &self.backend {
            TextBackend::Relay { base_url } => self.relay_response(base_url, answer),
            TextBackend::Gemini {
                api_base,
                api_key,
                model,
            } => self.gemini_response(api_base, api_key, model, answer),
        }
    }
}

fn extract_candidate_text(payload: &Value) -> String {
    payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mockito::Matcher;
    use secrecy::SecretString;
    use serde_json::json;

    use super::{PromptGenerator, TextGenerationClient};
    use crate::config::{TextBackend, TextServiceConfig};
    use crate::error::{ErrorKind, GenerationError};

    const TWO_BLOCKS: &str =
        "(炸弹)\n```json\nA diptych, pixel art.\n```\n```json\n两联画，像素艺术。\n```\n说明";

    fn relay_client(base_url: String) -> anyhow::Result<TextGenerationClient> {
        Ok(TextGenerationClient::new(TextServiceConfig {
            backend: TextBackend::Relay { base_url },
            timeout: Duration::from_secs(5),
        })?)
    }

    #[test]
    fn relay_prompt_is_extracted_from_second_block() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/api/genemi")
            .match_body(Matcher::Json(json!({ "answer": "炸弹" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "prompt": TWO_BLOCKS }).to_string())
            .create();

        let client = relay_client(server.url())?;
        let pair = client.generate_prompt("炸弹")?;
        assert_eq!(pair.english, "A diptych, pixel art.");
        assert_eq!(pair.chinese, "两联画，像素艺术。");
        mock.assert();
        Ok(())
    }

    #[test]
    fn empty_relay_text_is_rejected() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/api/genemi")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "prompt": "  \n" }).to_string())
            .create();

        let client = relay_client(server.url())?;
        let err = client.generate_prompt("炸弹").err();
        assert!(matches!(
            err,
            Some(GenerationError::EmptyUpstreamResponse { .. })
        ));
        Ok(())
    }

    #[test]
    fn single_block_is_a_format_error() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/api/genemi")
            .with_status(200)
            .with_body(json!({ "prompt": "```json\nonly one\n```" }).to_string())
            .create();

        let client = relay_client(server.url())?;
        match client.generate_prompt("炸弹") {
            Err(err @ GenerationError::MalformedPromptFormat { found: 1 }) => {
                assert_eq!(err.kind(), ErrorKind::UpstreamFormat);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn relay_error_status_hides_body() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/api/genemi")
            .with_status(502)
            .with_body("upstream secret stack trace")
            .create();

        let client = relay_client(server.url())?;
        let err = client
            .generate_prompt("炸弹")
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected an error"))?;
        assert!(matches!(
            err,
            GenerationError::UpstreamHttp {
                status: Some(502),
                ..
            }
        ));
        assert!(!err.public_message().contains("stack trace"));
        Ok(())
    }

    #[test]
    fn non_json_relay_body_is_malformed() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/api/genemi")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<html>gateway</html>")
            .create();

        let client = relay_client(server.url())?;
        let err = client
            .generate_prompt("炸弹")
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected an error"))?;
        assert!(matches!(err, GenerationError::MalformedUpstreamJson { .. }));
        assert_eq!(err.kind(), ErrorKind::UpstreamFormat);
        assert!(!err.public_message().contains("gateway"));
        Ok(())
    }

    #[test]
    fn unreachable_relay_is_a_transport_error() -> anyhow::Result<()> {
        let client = relay_client("http://127.0.0.1:1".to_string())?;
        let err = client.generate_prompt("炸弹").err();
        assert!(matches!(
            err,
            Some(GenerationError::UpstreamHttp { status: None, .. })
        ));
        Ok(())
    }

    #[test]
    fn gemini_backend_sends_template_and_joins_parts() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/models/gemini-test:generateContent")
            .match_query(Matcher::UrlEncoded("key".into(), "gk".into()))
            .match_body(Matcher::Regex("谜底是炸弹".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "candidates": [{
                        "content": {
                            "parts": [
                                { "text": "```json\nEN\n```\n" },
                                { "text": "```json\n中文\n```" }
                            ]
                        }
                    }]
                })
                .to_string(),
            )
            .create();

        let client = TextGenerationClient::new(TextServiceConfig {
            backend: TextBackend::Gemini {
                api_base: server.url(),
                api_key: SecretString::from("gk".to_string()),
                model: "gemini-test".to_string(),
            },
            timeout: Duration::from_secs(5),
        })?;
        assert_eq!(client.name(), "gemini");
        let pair = client.generate_prompt("炸弹")?;
        assert_eq!(pair.english, "EN");
        assert_eq!(pair.chinese, "中文");
        mock.assert();
        Ok(())
    }

    #[test]
    fn gemini_without_candidates_is_empty() -> anyhow::Result<()> {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/models/gemini-test:generateContent")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!({ "candidates": [] }).to_string())
            .create();

        let client = TextGenerationClient::new(TextServiceConfig {
            backend: TextBackend::Gemini {
                api_base: server.url(),
                api_key: SecretString::from("gk".to_string()),
                model: "gemini-test".to_string(),
            },
            timeout: Duration::from_secs(5),
        })?;
        assert!(matches!(
            client.generate_prompt("炸弹").err(),
            Some(GenerationError::EmptyUpstreamResponse { .. })
        ));
        Ok(())
    }
}
