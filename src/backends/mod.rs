//! External model backends
//!
//! The pipeline only sees three capabilities: transcribe, generate and
//! synthesize. Concrete providers are chosen by name from configuration.

pub mod llm;
pub mod stt;
pub mod tts;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::{BackendsConfig, ProviderConfig};
use crate::pipeline::{GenerationRequest, Transcript};
use crate::{Error, Result};

pub use llm::ChatModel;
pub use stt::SpeechToText;
pub use tts::TextToSpeech;

/// Incremental tokens from a language model; ends at end-of-stream
pub type TokenStream = BoxStream<'static, Result<String>>;

/// Speech-to-text capability
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &'static str;

    /// Transcribe a WAV-encoded utterance
    ///
    /// # Errors
    ///
    /// Returns `Error::TranscriptionUnavailable` if the backend fails
    async fn transcribe(&self, wav: &[u8]) -> Result<Transcript>;
}

/// Streaming text-generation capability
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &'static str;

    /// Start generating; tokens arrive on the returned stream
    ///
    /// # Errors
    ///
    /// Returns `Error::GenerationUnavailable` if the request cannot be started.
    /// Failures after the stream opened arrive as `Err` items.
    async fn generate(&self, request: &GenerationRequest) -> Result<TokenStream>;
}

/// Text-to-speech capability
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &'static str;

    /// Synthesize one sentence
    ///
    /// # Errors
    ///
    /// Returns `Error::SynthesisUnavailable` if the backend fails
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>>;
}

/// The three backends a session needs
#[derive(Clone)]
pub struct Backends {
    pub transcriber: Arc<dyn Transcriber>,
    pub model: Arc<dyn LanguageModel>,
    pub synthesizer: Arc<dyn Synthesizer>,
    /// Voice passed to every synthesis call
    pub voice: String,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("transcriber", &self.transcriber.name())
            .field("model", &self.model.name())
            .field("synthesizer", &self.synthesizer.name())
            .field("voice", &self.voice)
            .finish()
    }
}

impl Backends {
    /// Build every backend from configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for unknown providers or missing API keys
    pub fn from_config(config: &BackendsConfig) -> Result<Self> {
        let backends = Self {
            transcriber: transcriber(&config.stt)?,
            model: language_model(&config.llm)?,
            synthesizer: synthesizer(&config.tts)?,
            voice: config.tts.voice.clone(),
        };

        tracing::info!(
            stt = backends.transcriber.name(),
            llm = backends.model.name(),
            tts = backends.synthesizer.name(),
            "backends configured"
        );

        Ok(backends)
    }
}

/// Build the configured transcriber
///
/// # Errors
///
/// Returns `Error::Config` for an unknown provider or a missing key
pub fn transcriber(config: &ProviderConfig) -> Result<Arc<dyn Transcriber>> {
    match config.provider.as_str() {
        "whisper" | "openai" => Ok(Arc::new(SpeechToText::new_whisper(
            config.url.clone(),
            config.model.clone(),
            config.api_key.clone(),
        ))),
        "deepgram" => Ok(Arc::new(SpeechToText::new_deepgram(
            config.api_key.clone().unwrap_or_default(),
            config.model.clone(),
        )?)),
        other => Err(Error::Config(format!("unknown stt provider '{other}'"))),
    }
}

/// Build the configured language model
///
/// # Errors
///
/// Returns `Error::Config` for an unknown provider or a missing key
pub fn language_model(config: &ProviderConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "ollama" => Ok(Arc::new(ChatModel::new_ollama(
            config.url.clone(),
            config.model.clone(),
        ))),
        "openai" => Ok(Arc::new(ChatModel::new_openai(
            config.url.clone(),
            config.model.clone(),
            config.api_key.clone(),
        ))),
        other => Err(Error::Config(format!("unknown llm provider '{other}'"))),
    }
}

/// Build the configured synthesizer
///
/// # Errors
///
/// Returns `Error::Config` for an unknown provider or a missing key
pub fn synthesizer(config: &ProviderConfig) -> Result<Arc<dyn Synthesizer>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(TextToSpeech::new_openai(
            config.url.clone(),
            config.model.clone(),
            config.api_key.clone(),
        ))),
        "elevenlabs" => Ok(Arc::new(TextToSpeech::new_elevenlabs(
            config.api_key.clone().unwrap_or_default(),
            config.model.clone(),
        )?)),
        other => Err(Error::Config(format!("unknown tts provider '{other}'"))),
    }
}

/// Join a base URL and a path without doubling slashes
pub(crate) fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str) -> ProviderConfig {
        ProviderConfig {
            provider: name.to_string(),
            url: "http://localhost:1234".to_string(),
            model: "m".to_string(),
            voice: "v".to_string(),
            api_key: None,
        }
    }

    #[test]
    fn test_unknown_provider_rejected() {
        assert!(matches!(transcriber(&provider("nope")), Err(Error::Config(_))));
        assert!(matches!(language_model(&provider("nope")), Err(Error::Config(_))));
        assert!(matches!(synthesizer(&provider("nope")), Err(Error::Config(_))));
    }

    #[test]
    fn test_hosted_providers_need_keys() {
        assert!(matches!(transcriber(&provider("deepgram")), Err(Error::Config(_))));
        assert!(matches!(synthesizer(&provider("elevenlabs")), Err(Error::Config(_))));
    }

    #[test]
    fn test_local_providers_build() {
        assert_eq!(transcriber(&provider("whisper")).unwrap().name(), "whisper");
        assert_eq!(language_model(&provider("ollama")).unwrap().name(), "ollama");
        assert_eq!(synthesizer(&provider("openai")).unwrap().name(), "openai");
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(
            endpoint("http://localhost:11434/", "/api/chat"),
            "http://localhost:11434/api/chat"
        );
    }
}
