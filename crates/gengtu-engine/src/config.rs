use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

use crate::signer::{CredentialError, SigningCredential};

pub const DEFAULT_IMAGE_ENDPOINT: &str = "https://visual.volcengineapi.com";
pub const DEFAULT_IMAGE_REGION: &str = "cn-north-1";
pub const DEFAULT_IMAGE_SERVICE: &str = "cv";
pub const DEFAULT_IMAGE_ACTION: &str = "CVProcess";
pub const DEFAULT_IMAGE_VERSION: &str = "2022-08-31";
pub const DEFAULT_IMAGE_MODEL: &str = "jimeng_t2i_v40";
pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_IMAGE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TEXT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {name}")]
    Missing { name: &'static str },

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

#[derive(Debug)]
pub enum TextBackend {
    /// Relay that owns the role template: `POST {base_url}/api/genemi`.
    Relay { base_url: String },
    /// Direct `generateContent` call with the template applied locally.
    Gemini {
        api_base: String,
        api_key: SecretString,
        model: String,
    },
}

#[derive(Debug)]
pub struct TextServiceConfig {
    pub backend: TextBackend,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct ImageServiceConfig {
    pub endpoint: String,
    pub region: String,
    pub service: String,
    pub action: String,
    pub version: String,
    pub model_key: String,
    pub timeout: Duration,
    pub credential: SigningCredential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactConfig {
    pub output_dir: PathBuf,
    /// Prefix of the relative URL stored on jobs, e.g. `/images`.
    pub public_prefix: String,
}

impl ArtifactConfig {
    pub fn public_url(&self, file_name: &str) -> String {
        format!("{}/{}", self.public_prefix.trim_end_matches('/'), file_name)
    }
}

/// Local paths only; loading it never needs credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub artifacts: ArtifactConfig,
    pub ledger_path: PathBuf,
    pub journal_path: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |keys: &[&str]| first_non_empty(&lookup, keys);
        Self {
            artifacts: ArtifactConfig {
                output_dir: get(&["GENGTU_OUTPUT_DIR", "default_dir"])
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./images")),
                public_prefix: get(&["GENGTU_PUBLIC_PREFIX"])
                    .unwrap_or_else(|| "/images".to_string()),
            },
            ledger_path: get(&["GENGTU_LEDGER_PATH"])
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./gengtu-ledger.json")),
            journal_path: get(&["GENGTU_JOURNAL_PATH"]).map(PathBuf::from),
            log_dir: get(&["GENGTU_LOG_DIR"]).map(PathBuf::from),
        }
    }
}

#[derive(Debug)]
pub struct EngineConfig {
    pub text: TextServiceConfig,
    pub image: ImageServiceConfig,
    pub storage: StorageConfig,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Missing credentials or a
    /// missing text service location fail here, before anything runs.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |keys: &[&str]| first_non_empty(&lookup, keys);

        let access_key = get(&["GENGTU_ACCESS_KEY", "access_key"]).ok_or(ConfigError::Missing {
            name: "GENGTU_ACCESS_KEY",
        })?;
        let secret_key = get(&["GENGTU_SECRET_KEY", "secret_key"]).ok_or(ConfigError::Missing {
            name: "GENGTU_SECRET_KEY",
        })?;
        let credential = SigningCredential::new(access_key, secret_key)?;

        let image = ImageServiceConfig {
            endpoint: trim_base(
                get(&["GENGTU_IMAGE_ENDPOINT"]).unwrap_or_else(|| DEFAULT_IMAGE_ENDPOINT.to_string()),
            ),
            region: get(&["GENGTU_IMAGE_REGION"]).unwrap_or_else(|| DEFAULT_IMAGE_REGION.to_string()),
            service: get(&["GENGTU_IMAGE_SERVICE"])
                .unwrap_or_else(|| DEFAULT_IMAGE_SERVICE.to_string()),
            action: DEFAULT_IMAGE_ACTION.to_string(),
            version: DEFAULT_IMAGE_VERSION.to_string(),
            model_key: get(&["GENGTU_IMAGE_MODEL"]).unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
            timeout: parse_timeout(
                "GENGTU_IMAGE_TIMEOUT_SECS",
                get(&["GENGTU_IMAGE_TIMEOUT_SECS"]),
                DEFAULT_IMAGE_TIMEOUT_SECS,
            )?,
            credential,
        };

        let backend_name = get(&["GENGTU_TEXT_BACKEND"])
            .unwrap_or_else(|| "relay".to_string())
            .to_ascii_lowercase();
        let backend = match backend_name.as_str() {
            "relay" => TextBackend::Relay {
                base_url: trim_base(get(&["GENGTU_TEXT_RELAY_URL"]).ok_or(ConfigError::Missing {
                    name: "GENGTU_TEXT_RELAY_URL",
                })?),
            },
            "gemini" => TextBackend::Gemini {
                api_base: trim_base(
                    get(&["GENGTU_GEMINI_API_BASE"])
                        .unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string()),
                ),
                api_key: SecretString::from(
                    get(&["GENGTU_GEMINI_API_KEY", "GEMINI_API_KEY"]).ok_or(
                        ConfigError::Missing {
                            name: "GENGTU_GEMINI_API_KEY",
                        },
                    )?,
                ),
                model: get(&["GENGTU_GEMINI_MODEL", "model_name"])
                    .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            },
            other => {
                return Err(ConfigError::Invalid {
                    name: "GENGTU_TEXT_BACKEND",
                    reason: format!("expected `relay` or `gemini`, got `{other}`"),
                })
            }
        };
        let text = TextServiceConfig {
            backend,
            timeout: parse_timeout(
                "GENGTU_TEXT_TIMEOUT_SECS",
                get(&["GENGTU_TEXT_TIMEOUT_SECS"]),
                DEFAULT_TEXT_TIMEOUT_SECS,
            )?,
        };

        Ok(Self {
            text,
            image,
            storage: StorageConfig::from_lookup(&lookup),
        })
    }
}

fn first_non_empty<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    keys.iter().find_map(|key| {
        lookup(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn trim_base(raw: String) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

fn parse_timeout(
    name: &'static str,
    raw: Option<String>,
    default_secs: u64,
) -> Result<Duration, ConfigError> {
    let Some(raw) = raw else {
        return Ok(Duration::from_secs(default_secs));
    };
    match raw.parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::Invalid {
            name,
            reason: format!("expected a positive number of seconds, got `{raw}`"),
        }),
    }
}
