//! Generation providers
//! Contract consumed by the chat and research flows, plus the Gemini implementation

pub mod gemini;

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

pub use gemini::GeminiClient;

/// Default text model for chat, canvas and research synthesis
pub const DEFAULT_PRO_MODEL: &str = "gemini-3-pro-preview";
/// Fast text model selected by the "fast" mode
pub const DEFAULT_FLASH_MODEL: &str = "gemini-3-flash-preview";
/// Image generation model
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-3-pro-image-preview";
/// Video generation model
pub const DEFAULT_VIDEO_MODEL: &str = "veo-3.1-fast-generate-preview";

/// Source citation returned alongside search-grounded output
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundingUrl {
    pub title: String,
    pub uri: String,
}

/// Role of a conversation turn as the model sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Model,
}

/// Base64 payload attached inline to a turn
#[derive(Debug, Clone)]
pub struct InlinePart {
    pub mime_type: String,
    pub data: String,
}

/// One turn of conversation history sent to the model
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub text: String,
    pub inline_parts: Vec<InlinePart>,
}

/// Options applied to a streaming generation request
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub model: String,
    pub system_instruction: Option<String>,
    pub thinking_budget: Option<u32>,
    pub use_search: bool,
}

/// Incremental output of a generation stream. Empty text deltas are legal
/// and must be treated as no-ops by consumers.
#[derive(Debug, Clone, Default)]
pub struct StreamDelta {
    pub text: String,
    pub grounding_urls: Vec<GroundingUrl>,
}

/// Result of a one-shot grounded search request
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub text: String,
    pub grounding_urls: Vec<GroundingUrl>,
}

/// Result of an image generation request
#[derive(Debug, Clone)]
pub struct ImageOutcome {
    /// Data URIs, one per generated image
    pub images: Vec<String>,
    pub text: String,
}

/// Snapshot of a long-running video operation
#[derive(Debug, Clone, Default)]
pub struct VideoOperation {
    pub name: String,
    pub done: bool,
    pub video_uri: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("generation API returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("{0}")]
    Other(String),
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta, GenerationError>> + Send>>;

/// Contract the orchestrator and chat flows require from the hosted
/// generative-AI service. The wire protocol behind it is an implementation
/// detail of the provider.
#[async_trait::async_trait]
pub trait GenerationBackend: Send + Sync {
    /// One-shot structured-output request used for research planning.
    async fn create_plan(&self, prompt: &str) -> Result<String, GenerationError>;

    /// One-shot request with the web-search capability enabled.
    async fn search(&self, prompt: &str) -> Result<SearchOutcome, GenerationError>;

    /// Streaming generation over a single prompt.
    async fn stream_generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<DeltaStream, GenerationError>;

    /// Streaming generation over full conversation history.
    async fn stream_chat(
        &self,
        turns: &[ConversationTurn],
        options: &GenerateOptions,
    ) -> Result<DeltaStream, GenerationError>;

    /// Single image generation request.
    async fn generate_image(&self, prompt: &str) -> Result<ImageOutcome, GenerationError>;

    /// Kick off a long-running video generation; returns the operation snapshot.
    async fn start_video(&self, prompt: &str) -> Result<VideoOperation, GenerationError>;

    /// Poll a long-running video operation once.
    async fn poll_video(&self, operation_name: &str) -> Result<VideoOperation, GenerationError>;
}
