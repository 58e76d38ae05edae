use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use image::ImageFormat;
use reqwest::blocking::Client as HttpClient;
use reqwest::Url;
use serde::Serialize;
use serde_json::Value;

use crate::config::{ConfigError, ImageServiceConfig};
use crate::error::{GenerationError, IMAGE_SERVICE};
use crate::http::{build_client, response_json_or_error};
use crate::signer::{sign, SignableRequest, SignedRequest};

const CONTENT_TYPE: &str = "application/json";
const FILE_STAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// An image written to the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub path: PathBuf,
    pub file_name: String,
}

pub trait ImageGenerator: Send + Sync {
    fn generate_image(
        &self,
        prompt: &str,
        width: u32,
        height: u32,
    ) -> Result<GeneratedImage, GenerationError>;
}

/// Field order is the serialized order, and the serialized bytes are what
/// gets hashed into the signature.
#[derive(Debug, Serialize)]
pub struct ImageRequestBody<'a> {
    pub req_key: &'a str,
    pub prompt: &'a str,
    pub width: u32,
    pub height: u32,
}

/// A signed request ready to send. `url` carries exactly the path and query
/// that were signed.
#[derive(Debug)]
struct PreparedRequest {
    url: Url,
    signed: SignedRequest,
    body: Vec<u8>,
}

pub struct ImageGenerationClient {
    config: ImageServiceConfig,
    base_url: Url,
    host: String,
    output_dir: PathBuf,
    http: HttpClient,
}

impl ImageGenerationClient {
    pub fn new(config: ImageServiceConfig, output_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let base_url = parse_endpoint(&config.endpoint)?;
        let host = host_header(&base_url);
        Ok(Self {
            http: build_client(config.timeout)?,
            base_url,
            host,
            output_dir: output_dir.into(),
            config,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn prepare(
        &self,
        prompt: &str,
        width: u32,
        height: u32,
        now: DateTime<Utc>,
    ) -> Result<PreparedRequest, GenerationError> {
        let body = serde_json::to_vec(&ImageRequestBody {
            req_key: &self.config.model_key,
            prompt,
            width,
            height,
        })
        .map_err(|source| GenerationError::MalformedUpstreamJson {
            service: IMAGE_SERVICE,
            source,
        })?;
        let query = [
            ("Action", self.config.action.as_str()),
            ("Version", self.config.version.as_str()),
        ];
        let signed = sign(
            &self.config.credential,
            now,
            &self.config.region,
            &self.config.service,
            &SignableRequest {
                method: "POST",
                path: self.base_url.path(),
                query: &query,
                content_type: CONTENT_TYPE,
                host: &self.host,
                body: &body,
            },
        )?;
        let mut url = self.base_url.clone();
        url.set_query(Some(&signed.canonical_query));
        Ok(PreparedRequest { url, signed, body })
    }

    fn request_image(&self, prompt: &str, width: u32, height: u32) -> Result<Value, GenerationError> {
        let PreparedRequest { url, signed, body } = self.prepare(prompt, width, height, Utc::now())?;
        tracing::debug!(
            model = %self.config.model_key,
            width,
            height,
            "requesting image"
        );
        let response = self
            .http
            .post(url)
            .header("Content-Type", CONTENT_TYPE)
            .header("X-Date", &signed.x_date)
            .header("X-Content-Sha256", &signed.content_sha256)
            .header("Authorization", &signed.authorization)
            .body(body)
            .send()
            .map_err(|err| GenerationError::transport(IMAGE_SERVICE, &err))?;
        response_json_or_error(IMAGE_SERVICE, response)
    }
}

impl ImageGenerator for ImageGenerationClient {
    fn generate_image(
        &self,
        prompt: &str,
        width: u32,
        height: u32,
    ) -> Result<GeneratedImage, GenerationError> {
        let payload = self.request_image(prompt, width, height)?;
        let encoded = first_image_field(&payload).ok_or_else(|| {
            tracing::warn!(
                code = ?payload.get("code"),
                message = ?payload.get("message"),
                "image response carried no image data"
            );
            GenerationError::MissingImageField {
                service: IMAGE_SERVICE,
            }
        })?;
        persist_image(encoded, &self.output_dir, Utc::now())
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        name: "GENGTU_IMAGE_ENDPOINT",
        reason,
    };
    let mut url = Url::parse(endpoint).map_err(|err| invalid(err.to_string()))?;
    if url.host_str().is_none() {
        return Err(invalid(format!("`{endpoint}` has no host")));
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// `Host` as the server sees it: host name plus `:port` only when the URL
/// spells out a non-default port.
fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn first_image_field(payload: &Value) -> Option<&str> {
    payload
        .get("data")
        .and_then(|data| data.get("binary_data_base64"))
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Decodes a base64 image (with or without a `data:...;base64,` prefix),
/// checks that it is a readable image and writes it under `dir` as
/// `YYYYMMDDHHMMSS.<ext>`. Same-second collisions get a `-N` suffix; an
/// existing file is never overwritten.
pub fn persist_image(
    encoded: &str,
    dir: &Path,
    now: DateTime<Utc>,
) -> Result<GeneratedImage, GenerationError> {
    let raw = match encoded.split_once("base64,") {
        Some((_, rest)) => rest,
        None => encoded,
    };
    let bytes = BASE64
        .decode(raw.trim().as_bytes())
        .map_err(|err| GenerationError::ImageDecode {
            reason: format!("invalid base64: {err}"),
        })?;
    let format = image::guess_format(&bytes).unwrap_or(ImageFormat::Png);
    image::load_from_memory_with_format(&bytes, format).map_err(|err| {
        GenerationError::ImageDecode {
            reason: err.to_string(),
        }
    })?;

    fs::create_dir_all(dir).map_err(GenerationError::Artifact)?;
    let stem = now.format(FILE_STAMP_FORMAT).to_string();
    let ext = extension_for(format);
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let file_name = if attempt == 0 {
            format!("{stem}.{ext}")
        } else {
            format!("{stem}-{attempt}.{ext}")
        };
        let path = dir.join(&file_name);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == IoErrorKind::AlreadyExists => continue,
            Err(err) => return Err(GenerationError::Artifact(err)),
        };
        if let Err(err) = file.write_all(&bytes) {
            let _ = fs::remove_file(&path);
            return Err(GenerationError::Artifact(err));
        }
        tracing::info!(path = %path.display(), bytes = bytes.len(), "image saved");
        return Ok(GeneratedImage { path, file_name });
    }
    Err(GenerationError::Artifact(std::io::Error::new(
        IoErrorKind::AlreadyExists,
        format!("no free file name for {stem}.{ext}"),
    )))
}

fn extension_for(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "jpg",
        ImageFormat::WebP => "webp",
        ImageFormat::Gif => "gif",
        ImageFormat::Bmp => "bmp",
        _ => "png",
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use chrono::{TimeZone, Utc};
    use image::{ImageFormat, Rgb, RgbImage};
    use mockito::Matcher;
    use serde_json::json;

    use super::{
        host_header, parse_endpoint, persist_image, ImageGenerationClient, ImageGenerator,
        ImageRequestBody,
    };
    use crate::config::ImageServiceConfig;
    use crate::error::GenerationError;
    use crate::signer::{sha256_hex, sign, SignableRequest, SigningCredential};

    fn tiny_image_b64(format: ImageFormat) -> anyhow::Result<String> {
        let mut image = RgbImage::new(2, 2);
        for pixel in image.pixels_mut() {
            *pixel = Rgb([200, 40, 40]);
        }
        let mut bytes = Vec::new();
        image.write_to(&mut Cursor::new(&mut bytes), format)?;
        Ok(BASE64.encode(bytes))
    }

    fn client_for(endpoint: String, dir: &std::path::Path) -> anyhow::Result<ImageGenerationClient> {
        let config = ImageServiceConfig {
            endpoint,
            region: "cn-north-1".to_string(),
            service: "cv".to_string(),
            action: "CVProcess".to_string(),
            version: "2022-08-31".to_string(),
            model_key: "jimeng_t2i_v40".to_string(),
            timeout: Duration::from_secs(5),
            credential: SigningCredential::new("AKTEST", "SECRETTEST")?,
        };
        Ok(ImageGenerationClient::new(config, dir)?)
    }

    #[test]
    fn persist_names_file_by_timestamp_and_avoids_collisions() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let now = Utc.with_ymd_and_hms(2024, 5, 20, 6, 30, 25).single().ok_or_else(|| anyhow::anyhow!("bad time"))?;
        let encoded = tiny_image_b64(ImageFormat::Png)?;

        let first = persist_image(&encoded, temp.path(), now)?;
        let second = persist_image(&format!("data:image/png;base64,{encoded}"), temp.path(), now)?;

        assert_eq!(first.file_name, "20240520063025.png");
        assert_eq!(second.file_name, "20240520063025-1.png");
        assert_eq!(std::fs::read(&first.path)?, std::fs::read(&second.path)?);
        Ok(())
    }

    #[test]
    fn persist_keeps_detected_format() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let encoded = tiny_image_b64(ImageFormat::Jpeg)?;
        let saved = persist_image(&encoded, &temp.path().join("nested"), Utc::now())?;
        assert!(saved.file_name.ends_with(".jpg"));
        assert!(saved.path.exists());
        Ok(())
    }

    #[test]
    fn undecodable_payload_writes_nothing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let err = persist_image("%%% not base64 %%%", temp.path(), Utc::now()).err();
        assert!(matches!(err, Some(GenerationError::ImageDecode { .. })));

        let not_an_image = BASE64.encode(b"plain text, not pixels");
        let err = persist_image(&not_an_image, temp.path(), Utc::now()).err();
        assert!(matches!(err, Some(GenerationError::ImageDecode { .. })));

        assert_eq!(std::fs::read_dir(temp.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn host_header_includes_explicit_port_only() -> anyhow::Result<()> {
        assert_eq!(
            host_header(&parse_endpoint("https://visual.volcengineapi.com")?),
            "visual.volcengineapi.com"
        );
        assert_eq!(host_header(&parse_endpoint("http://127.0.0.1:4010")?), "127.0.0.1:4010");
        assert!(parse_endpoint("not a url").is_err());
        Ok(())
    }

    #[test]
    fn endpoint_path_is_signed_and_sent() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let now = Utc
            .with_ymd_and_hms(2024, 5, 20, 6, 30, 25)
            .single()
            .ok_or_else(|| anyhow::anyhow!("bad time"))?;
        let credential = SigningCredential::new("AKTEST", "SECRETTEST")?;
        let query = [("Action", "CVProcess"), ("Version", "2022-08-31")];

        for (endpoint, path) in [
            ("https://gw.example.com/cv", "/cv"),
            ("https://gw.example.com", "/"),
        ] {
            let client = client_for(endpoint.to_string(), temp.path())?;
            let prepared = client.prepare("两联画", 1024, 1024, now)?;
            assert_eq!(prepared.url.path(), path);
            assert_eq!(prepared.url.query(), Some("Action=CVProcess&Version=2022-08-31"));

            let expected = sign(
                &credential,
                now,
                "cn-north-1",
                "cv",
                &SignableRequest {
                    method: "POST",
                    path,
                    query: &query,
                    content_type: "application/json",
                    host: "gw.example.com",
                    body: &prepared.body,
                },
            )?;
            assert_eq!(prepared.signed, expected);
        }
        Ok(())
    }

    #[test]
    fn signed_request_is_sent_and_image_saved() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut server = mockito::Server::new();
        let body = serde_json::to_vec(&ImageRequestBody {
            req_key: "jimeng_t2i_v40",
            prompt: "两联画",
            width: 1024,
            height: 1920,
        })?;
        let mock = server
            .mock("POST", "/")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("Action".into(), "CVProcess".into()),
                Matcher::UrlEncoded("Version".into(), "2022-08-31".into()),
            ]))
            .match_header("content-type", "application/json")
            .match_header("x-content-sha256", sha256_hex(&body).as_str())
            .match_header("x-date", Matcher::Regex(r"^\d{8}T\d{6}Z$".to_string()))
            .match_header(
                "authorization",
                Matcher::Regex(
                    r"^HMAC-SHA256 Credential=AKTEST/\d{8}/cn-north-1/cv/request, SignedHeaders=content-type;host;x-content-sha256;x-date, Signature=[0-9a-f]{64}$"
                        .to_string(),
                ),
            )
            .match_body(Matcher::Exact(String::from_utf8(body.clone())?))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "code": 10000,
                    "data": { "binary_data_base64": [tiny_image_b64(ImageFormat::Png)?] }
                })
                .to_string(),
            )
            .create();

        let client = client_for(server.url(), temp.path())?;
        let saved = client.generate_image("两联画", 1024, 1920)?;
        assert!(saved.path.starts_with(temp.path()));
        assert!(saved.file_name.ends_with(".png"));
        mock.assert();
        Ok(())
    }

    #[test]
    fn endpoint_with_path_reaches_that_path() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/cv")
            .match_query(Matcher::UrlEncoded("Action".into(), "CVProcess".into()))
            .with_status(200)
            .with_body(
                json!({ "data": { "binary_data_base64": [tiny_image_b64(ImageFormat::Png)?] } })
                    .to_string(),
            )
            .create();

        let client = client_for(format!("{}/cv", server.url()), temp.path())?;
        client.generate_image("p", 1024, 1024)?;
        mock.assert();
        Ok(())
    }

    #[test]
    fn response_without_image_field_is_rejected() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!({ "code": 50411, "message": "risk", "data": null }).to_string())
            .create();

        let client = client_for(server.url(), temp.path())?;
        let err = client.generate_image("p", 1024, 1024).err();
        assert!(matches!(err, Some(GenerationError::MissingImageField { .. })));
        assert_eq!(std::fs::read_dir(temp.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn non_json_success_body_is_malformed() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<html>gateway</html>")
            .create();

        let client = client_for(server.url(), temp.path())?;
        let err = client
            .generate_image("p", 1024, 1024)
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected an error"))?;
        assert!(matches!(err, GenerationError::MalformedUpstreamJson { .. }));
        assert!(!err.public_message().contains("gateway"));
        assert_eq!(std::fs::read_dir(temp.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn error_status_is_surfaced_without_body() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body("SignatureDoesNotMatch: details")
            .create();

        let client = client_for(server.url(), temp.path())?;
        let err = client
            .generate_image("p", 1024, 1024)
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected an error"))?;
        assert!(matches!(
            err,
            GenerationError::UpstreamHttp {
                status: Some(401),
                ..
            }
        ));
        assert!(!err.to_string().contains("SignatureDoesNotMatch"));
        Ok(())
    }
}
