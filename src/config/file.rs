//! TOML configuration file loading
//!
//! Supports `~/.config/companion/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;
use crate::pipeline::BargeInPolicy;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct CompanionConfigFile {
    /// Gateway listen address
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Speech segmentation thresholds
    #[serde(default)]
    pub segmenter: SegmenterFileConfig,

    /// Pipeline timeouts and limits
    #[serde(default)]
    pub pipeline: PipelineFileConfig,

    /// Prompt assembly limits
    #[serde(default)]
    pub prompt: PromptFileConfig,

    /// Speech and model backends
    #[serde(default)]
    pub backends: BackendsFileConfig,

    /// Persistent store
    #[serde(default)]
    pub store: StoreFileConfig,

    /// Proactive check-ins
    #[serde(default)]
    pub proactive: ProactiveFileConfig,
}

/// Server configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Segmenter configuration
#[derive(Debug, Default, Deserialize)]
pub struct SegmenterFileConfig {
    pub speech_threshold: Option<f32>,
    pub silence_threshold: Option<f32>,
    pub start_dwell_ms: Option<u64>,
    pub hangover_ms: Option<u64>,
    pub max_utterance_ms: Option<u64>,
    pub smoothing: Option<f32>,
}

/// Pipeline configuration; durations in milliseconds
#[derive(Debug, Default, Deserialize)]
pub struct PipelineFileConfig {
    pub listening_timeout_ms: Option<u64>,
    pub transcription_timeout_ms: Option<u64>,
    pub generation_timeout_ms: Option<u64>,
    pub first_token_timeout_ms: Option<u64>,
    pub token_timeout_ms: Option<u64>,
    pub speaking_timeout_ms: Option<u64>,
    pub error_cooldown_ms: Option<u64>,
    pub max_sentences: Option<usize>,
    pub synthesis_concurrency: Option<usize>,
    pub synthesis_timeout_ms: Option<u64>,
    pub bus_capacity: Option<usize>,
    pub tick_ms: Option<u64>,
    /// "queue" or "drop"
    pub barge_in: Option<BargeInPolicy>,
    pub min_confidence: Option<f32>,
}

/// Prompt configuration
#[derive(Debug, Default, Deserialize)]
pub struct PromptFileConfig {
    pub history_turns: Option<usize>,
    pub history_chars: Option<usize>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Backend selection
#[derive(Debug, Default, Deserialize)]
pub struct BackendsFileConfig {
    #[serde(default)]
    pub stt: ProviderFileConfig,
    #[serde(default)]
    pub llm: ProviderFileConfig,
    #[serde(default)]
    pub tts: ProviderFileConfig,
}

/// One backend provider
#[derive(Debug, Default, Deserialize)]
pub struct ProviderFileConfig {
    /// Provider name (e.g. "whisper", "ollama", "openai")
    pub provider: Option<String>,
    pub url: Option<String>,
    pub model: Option<String>,
    /// TTS voice identifier
    pub voice: Option<String>,
    pub api_key: Option<String>,
}

/// Store configuration
#[derive(Debug, Default, Deserialize)]
pub struct StoreFileConfig {
    pub database_path: Option<String>,
    pub user_id: Option<String>,
}

/// Proactive configuration
#[derive(Debug, Default, Deserialize)]
pub struct ProactiveFileConfig {
    pub enabled: Option<bool>,
    pub tick_secs: Option<u64>,
    /// YAML rules file; built-in rules when unset or missing
    pub rules_path: Option<String>,
}

/// Parse a config file's contents
///
/// # Errors
///
/// Returns error if the TOML is malformed or a field has the wrong type
pub fn parse_config(content: &str) -> Result<CompanionConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load a config file from a path
///
/// Returns `CompanionConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file_from(path: &Path) -> CompanionConfigFile {
    if !path.exists() {
        return CompanionConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match parse_config(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                CompanionConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            CompanionConfigFile::default()
        }
    }
}

/// Load the TOML config file from `COMPANION_CONFIG` or the standard path
pub fn load_config_file() -> CompanionConfigFile {
    let path = std::env::var("COMPANION_CONFIG")
        .ok()
        .map(PathBuf::from)
        .or_else(config_file_path);

    path.map_or_else(CompanionConfigFile::default, |p| load_config_file_from(&p))
}

/// Return the config file path: `~/.config/companion/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("companion").join("config.toml"))
}
