//! Error types for the companion gateway

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the companion gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Voice-activity model failed on a chunk (recovered by the energy heuristic)
    #[error("segmentation fault: {0}")]
    Segmentation(String),

    /// Speech-to-text backend unreachable or returned an error
    #[error("transcription unavailable: {0}")]
    TranscriptionUnavailable(String),

    /// Language-model backend unreachable or failed mid-stream
    #[error("generation unavailable: {0}")]
    GenerationUnavailable(String),

    /// Speech-synthesis backend failed for a single sentence
    #[error("synthesis unavailable: {0}")]
    SynthesisUnavailable(String),

    /// A message referenced a turn older than the session's current turn
    #[error("stale message for turn {turn_id} (current turn {current})")]
    StateConflict { turn_id: u64, current: u64 },

    /// A proactive rule could not be evaluated this tick
    #[error("rule '{rule}' misfired: {reason}")]
    RuleMisfire { rule: String, reason: String },

    /// A stage exceeded its bounded wait
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// A bus topic was closed by its consumer
    #[error("bus topic closed: {0}")]
    BusClosed(&'static str),

    /// Audio encoding/decoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// YAML parsing error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Whether a stage can absorb this error and degrade instead of failing the turn
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Segmentation(_)
                | Self::GenerationUnavailable(_)
                | Self::SynthesisUnavailable(_)
                | Self::StateConflict { .. }
                | Self::RuleMisfire { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_errors_follow_taxonomy() {
        assert!(Error::Segmentation("model".into()).is_recoverable());
        assert!(Error::SynthesisUnavailable("tts".into()).is_recoverable());
        assert!(Error::StateConflict { turn_id: 1, current: 2 }.is_recoverable());
        assert!(!Error::TranscriptionUnavailable("down".into()).is_recoverable());
        assert!(!Error::Timeout("transcription").is_recoverable());
    }

    #[test]
    fn state_conflict_message_names_both_turns() {
        let err = Error::StateConflict { turn_id: 3, current: 5 };
        assert_eq!(err.to_string(), "stale message for turn 3 (current turn 5)");
    }
}
