//! Conversation pipeline
//!
//! Audio is segmented into utterances, transcribed, answered by a streaming
//! language model and voiced sentence by sentence. A per-session
//! [`ConversationMachine`] owns all state; stage workers run concurrently and
//! talk to it over the session bus.

pub mod bus;
pub mod coordinator;
pub mod generation;
pub mod learn;
pub mod machine;
pub mod proactive;
pub mod prompt;
pub mod sentence;
pub mod synthesis;
mod types;

use std::time::Duration;

pub use bus::{Envelope, Publisher, Subscriber, Topic};
pub use coordinator::{SessionCoordinator, SessionHandle, Store};
pub use generation::{GenerationConfig, GenerationOutcome, GenerationPipeliner};
pub use machine::{
    Action, BargeInPolicy, ConversationMachine, CueKind, MachineConfig, PipelineEvent,
    TransitionRecord,
};
pub use proactive::{ProactiveScheduler, ProactiveTrigger, Rule, RuleContext, RuleKind};
pub use prompt::{ChatMessage, GenerationRequest, PromptBuilder, PromptConfig, PromptContext};
pub use sentence::SentenceSplitter;
pub use synthesis::{SynthesisConfig, SynthesisDispatcher, SynthesisSummary};
pub use types::{
    ConversationState, OutputFrame, SegmentOutcome, Sentence, Session, SessionSnapshot,
    Transcript, TriggerKind, Turn, TurnId, TurnStatus, TurnSummary,
};
use crate::{Error, Result};

/// Slack between the generation fallback budget and the Thinking deadline
const THINKING_GRACE: Duration = Duration::from_secs(1);

/// Timing and capacity knobs for a session pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub listening_timeout: Duration,
    pub transcription_timeout: Duration,
    /// Thinking without a first sentence fails the turn after this; must
    /// exceed the generation fallback budget
    pub generation_timeout: Duration,
    pub first_token_timeout: Duration,
    pub token_timeout: Duration,
    pub speaking_timeout: Duration,
    pub error_cooldown: Duration,
    pub max_sentences: usize,
    pub synthesis_concurrency: usize,
    pub synthesis_timeout: Duration,
    /// Envelopes that may wait on each bus topic
    pub bus_capacity: usize,
    /// Interval of deadline checks
    pub tick_interval: Duration,
    pub barge_in: BargeInPolicy,
    pub min_confidence: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let machine = MachineConfig::default();
        let generation = GenerationConfig::default();
        let synthesis = SynthesisConfig::default();
        Self {
            listening_timeout: machine.listening_timeout,
            transcription_timeout: machine.transcription_timeout,
            generation_timeout: machine.generation_timeout,
            first_token_timeout: generation.first_token_timeout,
            token_timeout: generation.token_timeout,
            speaking_timeout: machine.speaking_timeout,
            error_cooldown: machine.error_cooldown,
            max_sentences: generation.max_sentences,
            synthesis_concurrency: synthesis.max_in_flight,
            synthesis_timeout: synthesis.timeout,
            bus_capacity: 64,
            tick_interval: Duration::from_millis(250),
            barge_in: machine.barge_in,
            min_confidence: machine.min_confidence,
        }
    }
}

impl PipelineConfig {
    /// Check that stage deadlines fit together
    ///
    /// A stalled model must reach its static fallback before the state
    /// machine gives up on Thinking, or the user hears an apology instead.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `generation_timeout` does not exceed the
    /// generation fallback budget
    pub fn validate(&self) -> Result<()> {
        let budget = self.generation().first_sentence_budget();
        if self.generation_timeout <= budget {
            return Err(Error::Config(format!(
                "generation timeout {:?} must exceed first token timeout plus token timeout ({budget:?})",
                self.generation_timeout
            )));
        }
        Ok(())
    }

    /// Thinking deadline, never shorter than the fallback budget plus grace
    #[must_use]
    pub fn thinking_timeout(&self) -> Duration {
        let floor = self.generation().first_sentence_budget() + THINKING_GRACE;
        self.generation_timeout.max(floor)
    }

    /// State machine settings
    #[must_use]
    pub fn machine(&self) -> MachineConfig {
        MachineConfig {
            listening_timeout: self.listening_timeout,
            transcription_timeout: self.transcription_timeout,
            generation_timeout: self.thinking_timeout(),
            speaking_timeout: self.speaking_timeout,
            error_cooldown: self.error_cooldown,
            barge_in: self.barge_in,
            min_confidence: self.min_confidence,
            ..MachineConfig::default()
        }
    }

    /// Generation pipeliner settings
    #[must_use]
    pub const fn generation(&self) -> GenerationConfig {
        GenerationConfig {
            first_token_timeout: self.first_token_timeout,
            token_timeout: self.token_timeout,
            max_sentences: self.max_sentences,
        }
    }

    /// Synthesis dispatcher settings
    #[must_use]
    pub const fn synthesis(&self) -> SynthesisConfig {
        SynthesisConfig {
            max_in_flight: self.synthesis_concurrency,
            timeout: self.synthesis_timeout,
        }
    }
}
