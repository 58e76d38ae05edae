//! Answer-to-picture generation: prompt text from a text service, a signed
//! request to the image service, and a credit-metered job around both.

pub mod config;
pub mod error;
mod http;
pub mod images;
pub mod orchestrator;
pub mod prompt;
pub mod signer;
pub mod text;

pub use config::{ConfigError, EngineConfig, StorageConfig};
pub use error::{ErrorKind, GenerationError};
pub use images::{GeneratedImage, ImageGenerationClient, ImageGenerator};
pub use orchestrator::{GenerationOrchestrator, GenerationOutcome};
pub use prompt::PromptPair;
pub use text::{PromptGenerator, TextGenerationClient};
