//! Pipeline data model: sessions, turns, sentences and output frames

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::proactive::ProactiveTrigger;

/// Monotonic per-session turn number
pub type TurnId = u64;

/// Conversation state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Idle,
    Listening,
    Transcribing,
    Thinking,
    Speaking,
    Error,
}

impl ConversationState {
    /// Lowercase name used in logs and on the wire
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Transcribing => "transcribing",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Error => "error",
        }
    }

    /// Whether a turn is being processed
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Transcribing | Self::Thinking | Self::Speaking)
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a turn
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerKind {
    /// The user spoke
    UserSpeech,
    /// A proactive rule fired
    Proactive(ProactiveTrigger),
}

impl TriggerKind {
    /// Short label for logs
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::UserSpeech => "user_speech",
            Self::Proactive(_) => "proactive",
        }
    }
}

/// Lifecycle of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// Created, nothing generated yet
    Pending,
    /// Sentences generated, output in progress
    Partial,
    Complete,
    Failed,
}

impl TurnStatus {
    /// Complete and failed turns never change again
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Speech-to-text result for a turn
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    /// Backend confidence in `[0.0, 1.0]`
    pub confidence: f32,
}

impl Transcript {
    /// Create a transcript
    #[must_use]
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// An immutable unit of generated speech
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub text: String,
    /// Position within the turn, starting at zero
    pub index: usize,
    /// Last sentence of the response
    pub is_final: bool,
    /// Set on the final sentence of a fallback, truncated or partial response
    pub degraded: bool,
}

impl Sentence {
    /// Create a sentence
    #[must_use]
    pub fn new(text: impl Into<String>, index: usize, is_final: bool) -> Self {
        Self {
            text: text.into(),
            index,
            is_final,
            degraded: false,
        }
    }

    /// Mark the response this sentence ends as degraded
    #[must_use]
    pub const fn mark_degraded(mut self) -> Self {
        self.degraded = true;
        self
    }
}

/// What happened to a sentence at the synthesis stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// Audio reached the output channel
    Delivered { bytes: usize },
    /// Synthesis failed and the sentence was skipped
    Skipped,
}

/// One reactive or proactive exchange
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: TurnId,
    pub trigger: TriggerKind,
    pub transcript: Option<Transcript>,
    /// Append-only, ordered by index
    pub sentences: Vec<Sentence>,
    /// Synthesis outcomes keyed by sentence index
    pub segments: BTreeMap<usize, SegmentOutcome>,
    pub status: TurnStatus,
    /// Completed through a fallback, truncation or cue
    pub degraded: bool,
    pub failure: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Turn {
    /// Start a new pending turn
    #[must_use]
    pub fn new(id: TurnId, trigger: TriggerKind) -> Self {
        Self {
            id,
            trigger,
            transcript: None,
            sentences: Vec::new(),
            segments: BTreeMap::new(),
            status: TurnStatus::Pending,
            degraded: false,
            failure: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Append the next sentence; out-of-order or repeated indices are ignored
    pub fn append_sentence(&mut self, sentence: Sentence) -> bool {
        if sentence.index != self.sentences.len() {
            return false;
        }
        self.degraded |= sentence.degraded;
        self.sentences.push(sentence);
        if self.status == TurnStatus::Pending {
            self.status = TurnStatus::Partial;
        }
        true
    }

    /// Record a synthesis outcome; the first record per index wins
    pub fn record_segment(&mut self, index: usize, outcome: SegmentOutcome) -> bool {
        if self.segments.contains_key(&index) {
            return false;
        }
        if outcome == SegmentOutcome::Skipped {
            self.degraded = true;
        }
        self.segments.insert(index, outcome);
        true
    }

    /// Whether any audio reached the client
    #[must_use]
    pub fn produced_audio(&self) -> bool {
        self.segments
            .values()
            .any(|o| matches!(o, SegmentOutcome::Delivered { .. }))
    }

    /// Full generated response text
    #[must_use]
    pub fn response_text(&self) -> String {
        self.sentences
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub(crate) fn finish(&mut self, status: TurnStatus) {
        if !self.status.is_terminal() {
            self.status = status;
            self.completed_at = Some(Utc::now());
        }
    }
}

/// Per-session state owned by the conversation machine
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub state: ConversationState,
    pub active_turn: Option<TurnId>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    /// Create an idle session
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            state: ConversationState::Idle,
            active_turn: None,
            created_at: now,
            last_activity: now,
        }
    }
}

/// How the most recent turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TurnSummary {
    pub turn_id: TurnId,
    pub status: TurnStatus,
    pub degraded: bool,
}

impl From<&Turn> for TurnSummary {
    fn from(turn: &Turn) -> Self {
        Self {
            turn_id: turn.id,
            status: turn.status,
            degraded: turn.degraded,
        }
    }
}

/// Read-only view of a session published after every event
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub state: ConversationState,
    pub active_turn: Option<TurnId>,
    pub turns_started: u64,
    pub pending_proactive: usize,
    pub last_activity: DateTime<Utc>,
    /// Last time the user spoke or a turn completed
    pub last_interaction: DateTime<Utc>,
    pub last_turn: Option<TurnSummary>,
}

/// Ordered frames sent to the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFrame {
    /// Synthesized audio for one sentence
    Segment {
        turn_id: TurnId,
        sentence_index: usize,
        text: String,
        audio: Vec<u8>,
    },
    /// Text-only failure cue when no audio could be produced
    Cue { turn_id: TurnId, text: String },
    /// No more frames for this turn
    EndOfTurn {
        turn_id: TurnId,
        segments: usize,
        skipped: usize,
    },
    /// Conversation state changed
    State {
        state: ConversationState,
        turn_id: Option<TurnId>,
    },
}

impl OutputFrame {
    /// Turn the frame belongs to, if any
    #[must_use]
    pub const fn turn_id(&self) -> Option<TurnId> {
        match self {
            Self::Segment { turn_id, .. }
            | Self::Cue { turn_id, .. }
            | Self::EndOfTurn { turn_id, .. } => Some(*turn_id),
            Self::State { turn_id, .. } => *turn_id,
        }
    }
}
