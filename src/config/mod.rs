//! Configuration management for the companion gateway
//!
//! Every value resolves as environment variable, then config file, then
//! built-in default.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use crate::pipeline::{BargeInPolicy, PipelineConfig, PromptConfig};
use crate::voice::SegmenterConfig;
use crate::{Error, Result};

use file::{CompanionConfigFile, ProviderFileConfig};

/// Companion gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Gateway listen address
    pub server: ServerConfig,

    /// Speech segmentation thresholds
    pub segmenter: SegmenterConfig,

    /// Pipeline timeouts and limits
    pub pipeline: PipelineConfig,

    /// Prompt assembly limits
    pub prompt: PromptConfig,

    /// Speech and model backends
    pub backends: BackendsConfig,

    /// Persistent store
    pub store: StoreConfig,

    /// Proactive check-ins
    pub proactive: ProactiveConfig,
}

/// Gateway listen address
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// The three backends a session uses
#[derive(Debug, Clone)]
pub struct BackendsConfig {
    pub stt: ProviderConfig,
    pub llm: ProviderConfig,
    pub tts: ProviderConfig,
}

/// One backend provider
#[derive(Clone)]
pub struct ProviderConfig {
    /// Provider name (e.g. "whisper", "ollama", "openai")
    pub provider: String,
    pub url: String,
    pub model: String,
    /// TTS voice identifier; unused by other backends
    pub voice: String,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("provider", &self.provider)
            .field("url", &self.url)
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Persistent store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_path: PathBuf,
    /// The person this companion talks to
    pub user_id: String,
}

/// Proactive check-ins
#[derive(Debug, Clone)]
pub struct ProactiveConfig {
    pub enabled: bool,
    /// Interval between rule evaluations
    pub tick: Duration,
    /// YAML rules file; built-in rules when unset or missing
    pub rules_path: Option<PathBuf>,
}

/// Default database path: `~/.local/share/companion/companion.db` on Linux
fn default_database_path() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("companion.db"),
        |d| d.data_dir().join("companion").join("companion.db"),
    )
}

/// Built-in provider per backend kind
struct ProviderDefaults {
    provider: &'static str,
    url: &'static str,
    model: &'static str,
    voice: &'static str,
}

const STT_DEFAULTS: ProviderDefaults = ProviderDefaults {
    provider: "whisper",
    url: "http://localhost:8000",
    model: "tiny.en",
    voice: "",
};

const LLM_DEFAULTS: ProviderDefaults = ProviderDefaults {
    provider: "ollama",
    url: "http://localhost:11434",
    model: "qwen2:0.5b",
    voice: "",
};

const TTS_DEFAULTS: ProviderDefaults = ProviderDefaults {
    provider: "openai",
    url: "http://localhost:8880",
    model: "piper",
    voice: "en_US-lessac-medium",
};

/// Provider API key from its conventional environment variable
fn provider_key(provider: &str, env: &impl Fn(&str) -> Option<String>) -> Option<String> {
    match provider {
        "openai" | "whisper" => env("OPENAI_API_KEY"),
        "deepgram" => env("DEEPGRAM_API_KEY"),
        "elevenlabs" => env("ELEVENLABS_API_KEY"),
        _ => None,
    }
}

fn resolve_provider(
    kind: &str,
    fc: ProviderFileConfig,
    defaults: &ProviderDefaults,
    env: &impl Fn(&str) -> Option<String>,
) -> ProviderConfig {
    let prefix = format!("COMPANION_{kind}");
    let var = |suffix: &str| env(&format!("{prefix}_{suffix}")).filter(|v| !v.is_empty());

    let provider = var("PROVIDER")
        .or(fc.provider)
        .unwrap_or_else(|| defaults.provider.to_string())
        .to_ascii_lowercase();
    let api_key = var("API_KEY")
        .or(fc.api_key)
        .or_else(|| provider_key(&provider, env));

    ProviderConfig {
        url: var("URL")
            .or(fc.url)
            .unwrap_or_else(|| defaults.url.to_string()),
        model: var("MODEL")
            .or(fc.model)
            .unwrap_or_else(|| defaults.model.to_string()),
        voice: var("VOICE")
            .or(fc.voice)
            .unwrap_or_else(|| defaults.voice.to_string()),
        provider,
        api_key,
    }
}

fn millis(value: Option<u64>, default: Duration) -> Duration {
    value.map_or(default, Duration::from_millis)
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// # Errors
    ///
    /// Returns error if a value is invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a value is invalid
    pub fn resolve(fc: CompanionConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // Server (env > toml > default)
        let server = ServerConfig {
            host: env("COMPANION_HOST")
                .or(fc.server.host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env("COMPANION_PORT")
                .or_else(|| env("PORT"))
                .and_then(|s| s.parse().ok())
                .or(fc.server.port)
                .unwrap_or(8080),
        };

        // Segmenter (toml > default)
        let seg = SegmenterConfig::default();
        let segmenter = SegmenterConfig {
            speech_threshold: fc.segmenter.speech_threshold.unwrap_or(seg.speech_threshold),
            silence_threshold: fc
                .segmenter
                .silence_threshold
                .unwrap_or(seg.silence_threshold),
            start_dwell_ms: fc.segmenter.start_dwell_ms.unwrap_or(seg.start_dwell_ms),
            hangover_ms: fc.segmenter.hangover_ms.unwrap_or(seg.hangover_ms),
            max_utterance_ms: fc.segmenter.max_utterance_ms.unwrap_or(seg.max_utterance_ms),
            smoothing: fc.segmenter.smoothing.unwrap_or(seg.smoothing),
            ..seg
        };
        if segmenter.silence_threshold > segmenter.speech_threshold {
            return Err(Error::Config(format!(
                "silence threshold {} is above speech threshold {}",
                segmenter.silence_threshold, segmenter.speech_threshold
            )));
        }

        // Pipeline (env > toml > default)
        let barge_in = match env("COMPANION_BARGE_IN") {
            Some(name) => BargeInPolicy::from_name(&name)
                .ok_or_else(|| Error::Config(format!("unknown barge-in policy '{name}'")))?,
            None => fc.pipeline.barge_in.unwrap_or_default(),
        };
        let p = fc.pipeline;
        let d = PipelineConfig::default();
        let pipeline = PipelineConfig {
            listening_timeout: millis(p.listening_timeout_ms, d.listening_timeout),
            transcription_timeout: millis(p.transcription_timeout_ms, d.transcription_timeout),
            generation_timeout: millis(p.generation_timeout_ms, d.generation_timeout),
            first_token_timeout: millis(p.first_token_timeout_ms, d.first_token_timeout),
            token_timeout: millis(p.token_timeout_ms, d.token_timeout),
            speaking_timeout: millis(p.speaking_timeout_ms, d.speaking_timeout),
            error_cooldown: millis(p.error_cooldown_ms, d.error_cooldown),
            max_sentences: p.max_sentences.unwrap_or(d.max_sentences).max(1),
            synthesis_concurrency: p
                .synthesis_concurrency
                .unwrap_or(d.synthesis_concurrency)
                .max(1),
            synthesis_timeout: millis(p.synthesis_timeout_ms, d.synthesis_timeout),
            bus_capacity: p.bus_capacity.unwrap_or(d.bus_capacity).max(1),
            tick_interval: millis(p.tick_ms, d.tick_interval),
            barge_in,
            min_confidence: p.min_confidence.unwrap_or(d.min_confidence),
        };
        pipeline.validate()?;

        // Prompt (toml > default)
        let pd = PromptConfig::default();
        let prompt = PromptConfig {
            history_turns: fc.prompt.history_turns.unwrap_or(pd.history_turns),
            history_chars: fc.prompt.history_chars.unwrap_or(pd.history_chars),
            max_tokens: fc.prompt.max_tokens.unwrap_or(pd.max_tokens),
            temperature: fc.prompt.temperature.unwrap_or(pd.temperature),
        };

        // Backends (env > toml > default)
        let backends = BackendsConfig {
            stt: resolve_provider("STT", fc.backends.stt, &STT_DEFAULTS, &env),
            llm: resolve_provider("LLM", fc.backends.llm, &LLM_DEFAULTS, &env),
            tts: resolve_provider("TTS", fc.backends.tts, &TTS_DEFAULTS, &env),
        };

        // Store (env > toml > default)
        let store = StoreConfig {
            database_path: env("COMPANION_DB_PATH")
                .or(fc.store.database_path)
                .map_or_else(default_database_path, PathBuf::from),
            user_id: env("COMPANION_USER_ID")
                .or(fc.store.user_id)
                .unwrap_or_else(|| "user-001".to_string()),
        };

        // Proactive (env > toml > default)
        let proactive = ProactiveConfig {
            enabled: env("COMPANION_PROACTIVE")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .or(fc.proactive.enabled)
                .unwrap_or(true),
            tick: Duration::from_secs(fc.proactive.tick_secs.unwrap_or(30).max(1)),
            rules_path: env("COMPANION_RULES_PATH")
                .or(fc.proactive.rules_path)
                .map(PathBuf::from),
        };

        Ok(Self {
            server,
            segmenter,
            pipeline,
            prompt,
            backends,
            store,
            proactive,
        })
    }

    /// Address the gateway binds to
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
