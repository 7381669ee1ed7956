//! Conversation state machine
//!
//! Sole owner of a session's state and turns. Every input arrives as a
//! [`PipelineEvent`]; the machine answers with [`Action`]s for the workers to
//! carry out. It performs no I/O itself, which keeps transitions easy to
//! replay in tests.
//!
//! ```text
//! Idle -> Listening -> Transcribing -> Thinking -> Speaking -> Idle
//!   any state -> Error -> (cooldown) -> Idle
//! ```
//!
//! An unusable transcript still passes through Thinking; the reprompt cue
//! takes the place of a generated response.
//!
//! At most one turn is non-terminal at a time. Speech that ends while a turn
//! is in flight is handled by the [`BargeInPolicy`]; proactive triggers that
//! arrive while busy wait in a queue and start on the next `Idle`.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::time::Instant;

use super::generation::GenerationOutcome;
use super::proactive::ProactiveTrigger;
use super::types::{
    ConversationState, SegmentOutcome, Sentence, Session, SessionSnapshot, Transcript,
    TriggerKind, Turn, TurnId, TurnStatus, TurnSummary,
};
use crate::Error;
use crate::voice::{SegmentEvent, Utterance};

/// What to do with speech that ends while a turn is in flight
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BargeInPolicy {
    /// Keep the latest such utterance and start it on the next `Idle`
    #[default]
    Queue,
    /// Discard it
    Drop,
}

impl BargeInPolicy {
    /// Parse a policy name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "queue" => Some(Self::Queue),
            "drop" => Some(Self::Drop),
            _ => None,
        }
    }
}

/// State machine timing and policy
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Listening without an utterance end falls back to Idle after this
    pub listening_timeout: Duration,
    pub transcription_timeout: Duration,
    /// Thinking without a first sentence fails the turn after this
    pub generation_timeout: Duration,
    pub speaking_timeout: Duration,
    /// Time spent in Error before returning to Idle
    pub error_cooldown: Duration,
    pub barge_in: BargeInPolicy,
    /// Transcripts below this confidence get a reprompt
    pub min_confidence: f32,
    /// Completed turns kept in memory
    pub turn_history: usize,
    /// Transitions kept in the trace
    pub trace_capacity: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            listening_timeout: Duration::from_secs(20),
            transcription_timeout: Duration::from_secs(10),
            generation_timeout: Duration::from_secs(15),
            speaking_timeout: Duration::from_secs(60),
            error_cooldown: Duration::from_secs(2),
            barge_in: BargeInPolicy::Queue,
            min_confidence: 0.3,
            turn_history: 32,
            trace_capacity: 512,
        }
    }
}

/// Short spoken cues that stand in for a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CueKind {
    /// Something failed; the turn could not be answered
    Apology,
    /// The transcript was empty or too uncertain to answer
    Reprompt,
}

impl CueKind {
    /// Text of the cue
    #[must_use]
    pub const fn text(self) -> &'static str {
        match self {
            Self::Apology => "Sorry, I'm having a little trouble right now.",
            Self::Reprompt => "Sorry, I didn't catch that. Could you say it again?",
        }
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Boundary event from the segmenter
    Segment(SegmentEvent),
    TranscriptReady {
        turn_id: TurnId,
        transcript: Transcript,
    },
    TranscriptionFailed {
        turn_id: TurnId,
        reason: String,
    },
    /// A generated sentence was handed to synthesis
    SentenceReady {
        turn_id: TurnId,
        sentence: Sentence,
    },
    GenerationFinished {
        turn_id: TurnId,
        outcome: GenerationOutcome,
    },
    SegmentEmitted {
        turn_id: TurnId,
        index: usize,
        outcome: SegmentOutcome,
    },
    /// All output for the turn, including the end-of-turn marker, was sent
    TurnComplete {
        turn_id: TurnId,
        cue_sent: bool,
        /// When the first audio segment went out
        first_audio_at: Option<Instant>,
    },
    /// Unrecoverable failure in a worker
    Fault {
        turn_id: Option<TurnId>,
        reason: String,
    },
    Proactive(ProactiveTrigger),
    /// Periodic deadline check
    Tick,
    /// Drop the active turn and all queued work
    Reset,
}

impl PipelineEvent {
    /// Short name for logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Segment(SegmentEvent::UtteranceStarted { .. }) => "utterance_started",
            Self::Segment(SegmentEvent::UtteranceContinuing { .. }) => "utterance_continuing",
            Self::Segment(SegmentEvent::UtteranceEnded(_)) => "utterance_ended",
            Self::TranscriptReady { .. } => "transcript_ready",
            Self::TranscriptionFailed { .. } => "transcription_failed",
            Self::SentenceReady { .. } => "sentence_ready",
            Self::GenerationFinished { .. } => "generation_finished",
            Self::SegmentEmitted { .. } => "segment_emitted",
            Self::TurnComplete { .. } => "turn_complete",
            Self::Fault { .. } => "fault",
            Self::Proactive(_) => "proactive",
            Self::Tick => "tick",
            Self::Reset => "reset",
        }
    }
}

/// Work requested by the state machine
#[derive(Debug, Clone)]
pub enum Action {
    /// Transcribe a finished utterance
    Transcribe {
        turn_id: TurnId,
        utterance: Utterance,
    },
    /// Build a prompt and generate a response
    Generate {
        turn_id: TurnId,
        trigger: TriggerKind,
        transcript: Option<Transcript>,
    },
    /// Speak a cue in place of a response
    Cue { turn_id: TurnId, kind: CueKind },
    /// Stop any work still running for a turn
    Cancel { turn_id: TurnId },
    /// A turn reached a terminal status
    TurnFinished(Turn),
    /// The conversation state changed
    StateChanged {
        from: ConversationState,
        to: ConversationState,
        turn_id: Option<TurnId>,
    },
}

/// One logged transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord {
    pub from: ConversationState,
    pub to: ConversationState,
    pub turn_id: Option<TurnId>,
    pub at: DateTime<Utc>,
}

/// Per-session conversation state machine
#[derive(Debug)]
pub struct ConversationMachine {
    config: MachineConfig,
    session: Session,
    turns: VecDeque<Turn>,
    last_turn_id: TurnId,
    entered_at: Instant,
    last_interaction: DateTime<Utc>,
    queued_utterance: Option<Utterance>,
    pending_proactive: VecDeque<ProactiveTrigger>,
    trace: VecDeque<TransitionRecord>,
    last_turn: Option<TurnSummary>,
}

impl ConversationMachine {
    /// Create an idle machine for a session
    #[must_use]
    pub fn new(session_id: impl Into<String>, config: MachineConfig) -> Self {
        let session = Session::new(session_id);
        let last_interaction = session.created_at;
        Self {
            config,
            session,
            turns: VecDeque::new(),
            last_turn_id: 0,
            entered_at: Instant::now(),
            last_interaction,
            queued_utterance: None,
            pending_proactive: VecDeque::new(),
            trace: VecDeque::new(),
            last_turn: None,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> ConversationState {
        self.session.state
    }

    /// Session record
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Active turn id, if any
    #[must_use]
    pub const fn active_turn(&self) -> Option<TurnId> {
        self.session.active_turn
    }

    /// Turn by id, if still in memory
    #[must_use]
    pub fn turn(&self, turn_id: TurnId) -> Option<&Turn> {
        self.turns.iter().find(|t| t.id == turn_id)
    }

    /// Turns kept in memory, oldest first
    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    /// Number of turns started in this session
    #[must_use]
    pub const fn turns_started(&self) -> u64 {
        self.last_turn_id
    }

    /// Turns not yet complete or failed
    #[must_use]
    pub fn non_terminal_turns(&self) -> usize {
        self.turns
            .iter()
            .filter(|t| !t.status.is_terminal())
            .count()
    }

    /// Recorded transitions, oldest first
    #[must_use]
    pub fn trace(&self) -> Vec<TransitionRecord> {
        self.trace.iter().cloned().collect()
    }

    /// Proactive triggers waiting for Idle
    #[must_use]
    pub fn pending_proactive(&self) -> usize {
        self.pending_proactive.len()
    }

    /// Last time the user spoke or a turn completed
    #[must_use]
    pub const fn last_interaction(&self) -> DateTime<Utc> {
        self.last_interaction
    }

    /// Read-only view for observers
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session.id.clone(),
            state: self.session.state,
            active_turn: self.session.active_turn,
            turns_started: self.last_turn_id,
            pending_proactive: self.pending_proactive.len(),
            last_activity: self.session.last_activity,
            last_interaction: self.last_interaction,
            last_turn: self.last_turn,
        }
    }

    /// Apply one event
    pub fn handle(&mut self, event: PipelineEvent, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if !matches!(event, PipelineEvent::Tick) {
            self.session.last_activity = Utc::now();
        }

        match event {
            PipelineEvent::Segment(SegmentEvent::UtteranceStarted { utterance_seq }) => {
                self.last_interaction = Utc::now();
                match self.session.state {
                    ConversationState::Idle => {
                        self.transition(ConversationState::Listening, now, &mut actions);
                    }
                    state if state.is_busy() => {
                        tracing::debug!(
                            session_id = %self.session.id,
                            utterance_seq,
                            state = %state,
                            "user started speaking during an active turn"
                        );
                    }
                    _ => {}
                }
            }
            PipelineEvent::Segment(SegmentEvent::UtteranceContinuing { .. }) => {}
            PipelineEvent::Segment(SegmentEvent::UtteranceEnded(utterance)) => {
                self.last_interaction = Utc::now();
                self.on_utterance_ended(utterance, now, &mut actions);
            }
            PipelineEvent::TranscriptReady {
                turn_id,
                transcript,
            } => self.on_transcript(turn_id, transcript, now, &mut actions),
            PipelineEvent::TranscriptionFailed { turn_id, reason } => {
                if self.check_turn(turn_id, "transcription_failed")
                    && self.session.state == ConversationState::Transcribing
                {
                    self.fail_turn(turn_id, &reason, now, &mut actions);
                }
            }
            PipelineEvent::SentenceReady { turn_id, sentence } => {
                self.on_sentence(turn_id, sentence, now, &mut actions);
            }
            PipelineEvent::GenerationFinished { turn_id, outcome } => {
                if self.check_turn(turn_id, "generation_finished") {
                    if let Some(turn) = self.turn_mut(turn_id) {
                        turn.degraded |= outcome.degraded;
                        if let Some(error) = outcome.error {
                            turn.failure = Some(error);
                        }
                    }
                }
            }
            PipelineEvent::SegmentEmitted {
                turn_id,
                index,
                outcome,
            } => {
                if self.check_turn(turn_id, "segment_emitted") {
                    if let Some(turn) = self.turn_mut(turn_id) {
                        turn.record_segment(index, outcome);
                    }
                }
            }
            PipelineEvent::TurnComplete { turn_id, cue_sent, .. } => {
                if self.check_turn(turn_id, "turn_complete")
                    && matches!(
                        self.session.state,
                        ConversationState::Thinking | ConversationState::Speaking
                    )
                {
                    self.complete_turn(turn_id, cue_sent, now, &mut actions);
                }
            }
            PipelineEvent::Fault { turn_id, reason } => {
                let relevant = turn_id.is_none_or(|id| self.check_turn(id, "fault"));
                if relevant {
                    match self.session.active_turn {
                        Some(active) => self.fail_turn(active, &reason, now, &mut actions),
                        None => {
                            tracing::error!(session_id = %self.session.id, reason, "session fault");
                            self.transition(ConversationState::Error, now, &mut actions);
                        }
                    }
                }
            }
            PipelineEvent::Proactive(trigger) => self.on_proactive(trigger, now, &mut actions),
            PipelineEvent::Tick => self.on_tick(now, &mut actions),
            PipelineEvent::Reset => self.reset(now, &mut actions),
        }

        actions
    }

    fn on_utterance_ended(&mut self, utterance: Utterance, now: Instant, actions: &mut Vec<Action>) {
        match self.session.state {
            ConversationState::Idle | ConversationState::Listening => {
                self.start_user_turn(utterance, now, actions);
            }
            state if state.is_busy() => match self.config.barge_in {
                BargeInPolicy::Queue => {
                    if let Some(previous) = self.queued_utterance.replace(utterance) {
                        tracing::debug!(
                            session_id = %self.session.id,
                            replaced = previous.seq,
                            "queued utterance replaced by a newer one"
                        );
                    }
                    tracing::info!(
                        session_id = %self.session.id,
                        state = %state,
                        "utterance queued until the current turn finishes"
                    );
                }
                BargeInPolicy::Drop => {
                    tracing::info!(
                        session_id = %self.session.id,
                        utterance_seq = utterance.seq,
                        state = %state,
                        "utterance dropped during an active turn"
                    );
                }
            },
            _ => {
                tracing::debug!(
                    session_id = %self.session.id,
                    utterance_seq = utterance.seq,
                    "utterance discarded while recovering from error"
                );
            }
        }
    }

    fn on_transcript(
        &mut self,
        turn_id: TurnId,
        transcript: Transcript,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        if !self.check_turn(turn_id, "transcript_ready") {
            return;
        }
        if self.session.state != ConversationState::Transcribing {
            tracing::debug!(
                session_id = %self.session.id,
                turn_id,
                state = %self.session.state,
                "transcript already applied"
            );
            return;
        }

        let unusable = transcript.text.trim().is_empty()
            || transcript.confidence < self.config.min_confidence;

        if let Some(turn) = self.turn_mut(turn_id) {
            turn.transcript = Some(transcript.clone());
            if unusable {
                turn.degraded = true;
            }
        }

        if unusable {
            tracing::info!(
                session_id = %self.session.id,
                turn_id,
                confidence = transcript.confidence,
                "transcript unusable, reprompting"
            );
            self.transition(ConversationState::Thinking, now, actions);
            self.transition(ConversationState::Speaking, now, actions);
            actions.push(Action::Cue {
                turn_id,
                kind: CueKind::Reprompt,
            });
            return;
        }

        self.transition(ConversationState::Thinking, now, actions);
        actions.push(Action::Generate {
            turn_id,
            trigger: TriggerKind::UserSpeech,
            transcript: Some(transcript),
        });
    }

    fn on_sentence(
        &mut self,
        turn_id: TurnId,
        sentence: Sentence,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        if !self.check_turn(turn_id, "sentence_ready") {
            return;
        }
        let state = self.session.state;
        if !matches!(
            state,
            ConversationState::Thinking | ConversationState::Speaking
        ) {
            return;
        }

        let appended = self
            .turn_mut(turn_id)
            .is_some_and(|turn| turn.append_sentence(sentence));

        if appended && state == ConversationState::Thinking {
            self.transition(ConversationState::Speaking, now, actions);
        }
    }

    fn on_proactive(&mut self, trigger: ProactiveTrigger, now: Instant, actions: &mut Vec<Action>) {
        let idle = self.session.state == ConversationState::Idle;
        if idle && self.queued_utterance.is_none() && self.pending_proactive.is_empty() {
            self.start_proactive_turn(trigger, now, actions);
            return;
        }

        if self.pending_proactive.iter().any(|p| p.rule == trigger.rule) {
            tracing::debug!(rule = %trigger.rule, "proactive trigger already queued");
            return;
        }

        tracing::info!(
            session_id = %self.session.id,
            rule = %trigger.rule,
            state = %self.session.state,
            "proactive turn queued until idle"
        );
        let position = self
            .pending_proactive
            .iter()
            .position(|p| p.priority > trigger.priority)
            .unwrap_or(self.pending_proactive.len());
        self.pending_proactive.insert(position, trigger);

        if idle {
            self.drain_queue(now, actions);
        }
    }

    fn on_tick(&mut self, now: Instant, actions: &mut Vec<Action>) {
        let elapsed = now.saturating_duration_since(self.entered_at);
        let turn_id = self.session.active_turn;

        match self.session.state {
            ConversationState::Listening if elapsed >= self.config.listening_timeout => {
                tracing::debug!(session_id = %self.session.id, "listening timed out");
                self.transition(ConversationState::Idle, now, actions);
            }
            ConversationState::Transcribing if elapsed >= self.config.transcription_timeout => {
                if let Some(id) = turn_id {
                    let reason = Error::Timeout("transcription").to_string();
                    self.fail_turn(id, &reason, now, actions);
                }
            }
            ConversationState::Thinking if elapsed >= self.config.generation_timeout => {
                if let Some(id) = turn_id {
                    let reason = Error::Timeout("generation").to_string();
                    self.fail_turn(id, &reason, now, actions);
                }
            }
            ConversationState::Speaking if elapsed >= self.config.speaking_timeout => {
                if let Some(id) = turn_id {
                    let reason = Error::Timeout("speaking").to_string();
                    self.fail_turn(id, &reason, now, actions);
                }
            }
            ConversationState::Error if elapsed >= self.config.error_cooldown => {
                self.transition(ConversationState::Idle, now, actions);
            }
            _ => {}
        }
    }

    fn reset(&mut self, now: Instant, actions: &mut Vec<Action>) {
        self.queued_utterance = None;
        self.pending_proactive.clear();

        if let Some(turn_id) = self.session.active_turn.take() {
            actions.push(Action::Cancel { turn_id });
            if let Some(turn) = self.turn_mut(turn_id) {
                turn.failure = Some("session reset".to_string());
                turn.finish(TurnStatus::Failed);
                let snapshot = turn.clone();
                self.last_turn = Some(TurnSummary::from(&snapshot));
                actions.push(Action::TurnFinished(snapshot));
            }
        }

        if self.session.state != ConversationState::Idle {
            self.transition(ConversationState::Idle, now, actions);
        }
    }

    fn start_user_turn(&mut self, utterance: Utterance, now: Instant, actions: &mut Vec<Action>) {
        let turn_id = self.begin_turn(TriggerKind::UserSpeech);
        tracing::info!(
            session_id = %self.session.id,
            turn_id,
            utterance_seq = utterance.seq,
            duration_ms = utterance.duration_ms(),
            forced = utterance.forced,
            "user turn started"
        );
        self.transition(ConversationState::Transcribing, now, actions);
        actions.push(Action::Transcribe { turn_id, utterance });
    }

    fn start_proactive_turn(
        &mut self,
        trigger: ProactiveTrigger,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let kind = TriggerKind::Proactive(trigger);
        let turn_id = self.begin_turn(kind.clone());
        if let TriggerKind::Proactive(trigger) = &kind {
            tracing::info!(
                session_id = %self.session.id,
                turn_id,
                rule = %trigger.rule,
                "proactive turn started"
            );
        }
        self.transition(ConversationState::Thinking, now, actions);
        actions.push(Action::Generate {
            turn_id,
            trigger: kind,
            transcript: None,
        });
    }

    fn begin_turn(&mut self, trigger: TriggerKind) -> TurnId {
        debug_assert!(self.non_terminal_turns() == 0, "one active turn at a time");
        self.last_turn_id += 1;
        let turn_id = self.last_turn_id;

        self.turns.push_back(Turn::new(turn_id, trigger));
        while self.turns.len() > self.config.turn_history.max(1) {
            self.turns.pop_front();
        }
        self.session.active_turn = Some(turn_id);
        turn_id
    }

    fn complete_turn(&mut self, turn_id: TurnId, cue_sent: bool, now: Instant, actions: &mut Vec<Action>) {
        if let Some(turn) = self.turn_mut(turn_id) {
            if cue_sent {
                turn.degraded = true;
            }
            turn.finish(TurnStatus::Complete);
            let snapshot = turn.clone();
            tracing::info!(
                turn_id,
                sentences = snapshot.sentences.len(),
                degraded = snapshot.degraded,
                "turn complete"
            );
            self.last_turn = Some(TurnSummary::from(&snapshot));
            actions.push(Action::TurnFinished(snapshot));
        }
        self.session.active_turn = None;
        self.last_interaction = Utc::now();
        self.transition(ConversationState::Idle, now, actions);
    }

    fn fail_turn(&mut self, turn_id: TurnId, reason: &str, now: Instant, actions: &mut Vec<Action>) {
        tracing::warn!(
            session_id = %self.session.id,
            turn_id,
            reason,
            state = %self.session.state,
            "turn failed"
        );

        actions.push(Action::Cancel { turn_id });
        actions.push(Action::Cue {
            turn_id,
            kind: CueKind::Apology,
        });
        if let Some(turn) = self.turn_mut(turn_id) {
            turn.failure = Some(reason.to_string());
            turn.finish(TurnStatus::Failed);
            let snapshot = turn.clone();
            self.last_turn = Some(TurnSummary::from(&snapshot));
            actions.push(Action::TurnFinished(snapshot));
        }
        self.session.active_turn = None;
        self.transition(ConversationState::Error, now, actions);
    }

    /// Whether a message belongs to the active turn; stale ones are logged and dropped
    fn check_turn(&self, turn_id: TurnId, event: &'static str) -> bool {
        if self.session.active_turn == Some(turn_id) {
            return true;
        }

        let conflict = Error::StateConflict {
            turn_id,
            current: self.session.active_turn.unwrap_or(self.last_turn_id),
        };
        tracing::debug!(
            session_id = %self.session.id,
            event,
            error = %conflict,
            "dropping message for inactive turn"
        );
        false
    }

    fn turn_mut(&mut self, turn_id: TurnId) -> Option<&mut Turn> {
        self.turns.iter_mut().rev().find(|t| t.id == turn_id)
    }

    fn transition(&mut self, to: ConversationState, now: Instant, actions: &mut Vec<Action>) {
        let from = self.session.state;
        if from == to {
            return;
        }

        let record = TransitionRecord {
            from,
            to,
            turn_id: self.session.active_turn,
            at: Utc::now(),
        };
        tracing::info!(
            session_id = %self.session.id,
            turn_id = ?record.turn_id,
            from = %from,
            to = %to,
            at = %record.at.to_rfc3339(),
            "state transition"
        );

        self.trace.push_back(record);
        while self.trace.len() > self.config.trace_capacity.max(1) {
            self.trace.pop_front();
        }

        self.session.state = to;
        self.entered_at = now;
        actions.push(Action::StateChanged {
            from,
            to,
            turn_id: self.session.active_turn,
        });

        if to == ConversationState::Idle {
            self.drain_queue(now, actions);
        }
    }

    /// Start queued work on entering Idle: a held utterance first, then proactive turns
    fn drain_queue(&mut self, now: Instant, actions: &mut Vec<Action>) {
        if let Some(utterance) = self.queued_utterance.take() {
            self.start_user_turn(utterance, now, actions);
        } else if let Some(trigger) = self.pending_proactive.pop_front() {
            self.start_proactive_turn(trigger, now, actions);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::proactive::RuleKind;

    fn utterance(seq: u64) -> Utterance {
        Utterance {
            seq,
            started_at_ms: 0,
            ended_at_ms: 500,
            samples: vec![0; 8000],
            forced: false,
        }
    }

    fn trigger(rule: &str, priority: u8) -> ProactiveTrigger {
        ProactiveTrigger {
            rule: rule.to_string(),
            prompt: "Check in".to_string(),
            kind: RuleKind::TimeBased,
            priority,
        }
    }

    fn speak(machine: &mut ConversationMachine, seq: u64, now: Instant) -> Vec<Action> {
        let mut actions = machine.handle(
            PipelineEvent::Segment(SegmentEvent::UtteranceStarted { utterance_seq: seq }),
            now,
        );
        actions.extend(machine.handle(
            PipelineEvent::Segment(SegmentEvent::UtteranceEnded(utterance(seq))),
            now,
        ));
        actions
    }

    fn generates(actions: &[Action]) -> Vec<TurnId> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Generate { turn_id, .. } => Some(*turn_id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_happy_path() {
        let now = Instant::now();
        let mut m = ConversationMachine::new("dev-1", MachineConfig::default());

        let actions = speak(&mut m, 1, now);
        assert_eq!(m.state(), ConversationState::Transcribing);
        assert!(actions.iter().any(|a| matches!(a, Action::Transcribe { turn_id: 1, .. })));

        let actions = m.handle(
            PipelineEvent::TranscriptReady {
                turn_id: 1,
                transcript: Transcript::new("hello", 0.9),
            },
            now,
        );
        assert_eq!(m.state(), ConversationState::Thinking);
        assert_eq!(generates(&actions), vec![1]);

        m.handle(
            PipelineEvent::SentenceReady {
                turn_id: 1,
                sentence: Sentence::new("Hi!", 0, true),
            },
            now,
        );
        assert_eq!(m.state(), ConversationState::Speaking);

        let actions = m.handle(
            PipelineEvent::TurnComplete {
                turn_id: 1,
                cue_sent: false,
                first_audio_at: None,
            },
            now,
        );
        assert_eq!(m.state(), ConversationState::Idle);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::TurnFinished(t) if t.status == TurnStatus::Complete
        )));

        let states: Vec<_> = m.trace().into_iter().map(|r| r.to).collect();
        assert_eq!(
            states,
            vec![
                ConversationState::Listening,
                ConversationState::Transcribing,
                ConversationState::Thinking,
                ConversationState::Speaking,
                ConversationState::Idle,
            ]
        );
    }

    #[test]
    fn test_repeated_transcript_is_noop() {
        let now = Instant::now();
        let mut m = ConversationMachine::new("dev-1", MachineConfig::default());
        speak(&mut m, 1, now);

        let event = PipelineEvent::TranscriptReady {
            turn_id: 1,
            transcript: Transcript::new("hello", 0.9),
        };
        let first = m.handle(event.clone(), now);
        let trace_len = m.trace().len();
        let second = m.handle(event, now);

        assert_eq!(generates(&first).len(), 1);
        assert!(second.is_empty());
        assert_eq!(m.trace().len(), trace_len);
    }

    #[test]
    fn test_stale_turn_messages_dropped() {
        let now = Instant::now();
        let mut m = ConversationMachine::new("dev-1", MachineConfig::default());
        speak(&mut m, 1, now);

        let actions = m.handle(
            PipelineEvent::TranscriptReady {
                turn_id: 0,
                transcript: Transcript::new("old", 0.9),
            },
            now,
        );
        assert!(actions.is_empty());
        assert_eq!(m.state(), ConversationState::Transcribing);
    }

    #[test]
    fn test_low_confidence_reprompts() {
        let now = Instant::now();
        let mut m = ConversationMachine::new("dev-1", MachineConfig::default());
        speak(&mut m, 1, now);

        let actions = m.handle(
            PipelineEvent::TranscriptReady {
                turn_id: 1,
                transcript: Transcript::new("mumble", 0.1),
            },
            now,
        );
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Cue {
                kind: CueKind::Reprompt,
                ..
            }
        )));
        assert!(generates(&actions).is_empty());
        assert_eq!(m.state(), ConversationState::Speaking);

        m.handle(
            PipelineEvent::TurnComplete {
                turn_id: 1,
                cue_sent: false,
                first_audio_at: None,
            },
            now,
        );
        let turn = m.turn(1).unwrap();
        assert_eq!(turn.status, TurnStatus::Complete);
        assert!(turn.degraded);

        // The reprompt takes the regular path through Thinking
        let states: Vec<_> = m.trace().into_iter().map(|r| (r.from, r.to)).collect();
        assert_eq!(
            states[1..],
            [
                (ConversationState::Listening, ConversationState::Transcribing),
                (ConversationState::Transcribing, ConversationState::Thinking),
                (ConversationState::Thinking, ConversationState::Speaking),
                (ConversationState::Speaking, ConversationState::Idle),
            ]
        );
        assert_eq!(
            m.snapshot().last_turn,
            Some(TurnSummary {
                turn_id: 1,
                status: TurnStatus::Complete,
                degraded: true,
            })
        );
    }

    #[test]
    fn test_transcription_failure_then_cooldown() {
        let now = Instant::now();
        let mut m = ConversationMachine::new("dev-1", MachineConfig::default());
        speak(&mut m, 1, now);

        let actions = m.handle(
            PipelineEvent::TranscriptionFailed {
                turn_id: 1,
                reason: "unreachable".to_string(),
            },
            now,
        );
        assert_eq!(m.state(), ConversationState::Error);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Cue {
                kind: CueKind::Apology,
                ..
            }
        )));
        assert_eq!(m.turn(1).unwrap().status, TurnStatus::Failed);
        assert_eq!(m.snapshot().last_turn.map(|t| t.status), Some(TurnStatus::Failed));

        m.handle(PipelineEvent::Tick, now + Duration::from_millis(500));
        assert_eq!(m.state(), ConversationState::Error);
        m.handle(PipelineEvent::Tick, now + Duration::from_secs(3));
        assert_eq!(m.state(), ConversationState::Idle);
    }

    #[test]
    fn test_transcription_timeout() {
        let now = Instant::now();
        let mut m = ConversationMachine::new("dev-1", MachineConfig::default());
        speak(&mut m, 1, now);

        m.handle(PipelineEvent::Tick, now + Duration::from_secs(11));
        assert_eq!(m.state(), ConversationState::Error);
        assert!(m.turn(1).unwrap().failure.as_deref().unwrap().contains("transcription"));
    }

    #[test]
    fn test_barge_in_queue_replays_latest_on_idle() {
        let now = Instant::now();
        let mut m = ConversationMachine::new("dev-1", MachineConfig::default());
        speak(&mut m, 1, now);
        m.handle(
            PipelineEvent::TranscriptReady {
                turn_id: 1,
                transcript: Transcript::new("hello", 0.9),
            },
            now,
        );

        // Two utterances while thinking: only the latest is kept
        speak(&mut m, 2, now);
        speak(&mut m, 3, now);
        assert_eq!(m.non_terminal_turns(), 1);

        m.handle(
            PipelineEvent::SentenceReady {
                turn_id: 1,
                sentence: Sentence::new("Hi.", 0, true),
            },
            now,
        );
        let actions = m.handle(
            PipelineEvent::TurnComplete {
                turn_id: 1,
                cue_sent: false,
                first_audio_at: None,
            },
            now,
        );

        let replayed: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Transcribe { turn_id, utterance } => Some((*turn_id, utterance.seq)),
                _ => None,
            })
            .collect();
        assert_eq!(replayed, vec![(2, 3)]);
        assert_eq!(m.state(), ConversationState::Transcribing);
    }

    #[test]
    fn test_barge_in_drop() {
        let now = Instant::now();
        let mut m = ConversationMachine::new(
            "dev-1",
            MachineConfig {
                barge_in: BargeInPolicy::Drop,
                ..MachineConfig::default()
            },
        );
        speak(&mut m, 1, now);
        speak(&mut m, 2, now);
        m.handle(
            PipelineEvent::TranscriptionFailed {
                turn_id: 1,
                reason: "x".to_string(),
            },
            now,
        );
        let actions = m.handle(PipelineEvent::Tick, now + Duration::from_secs(5));
        assert_eq!(m.state(), ConversationState::Idle);
        assert!(!actions.iter().any(|a| matches!(a, Action::Transcribe { .. })));
    }

    #[test]
    fn test_proactive_while_speaking_fires_once_on_idle() {
        let now = Instant::now();
        let mut m = ConversationMachine::new("dev-1", MachineConfig::default());
        speak(&mut m, 1, now);
        m.handle(
            PipelineEvent::TranscriptReady {
                turn_id: 1,
                transcript: Transcript::new("hello", 0.9),
            },
            now,
        );
        m.handle(
            PipelineEvent::SentenceReady {
                turn_id: 1,
                sentence: Sentence::new("Hi.", 0, true),
            },
            now,
        );

        let queued = m.handle(PipelineEvent::Proactive(trigger("morning", 1)), now);
        assert!(generates(&queued).is_empty());
        let duplicate = m.handle(PipelineEvent::Proactive(trigger("morning", 1)), now);
        assert!(duplicate.is_empty());
        assert_eq!(m.pending_proactive(), 1);

        let actions = m.handle(
            PipelineEvent::TurnComplete {
                turn_id: 1,
                cue_sent: false,
                first_audio_at: None,
            },
            now,
        );
        assert_eq!(generates(&actions), vec![2]);
        assert_eq!(m.state(), ConversationState::Thinking);
        assert_eq!(m.pending_proactive(), 0);
        assert!(matches!(
            m.turn(2).unwrap().trigger,
            TriggerKind::Proactive(ref t) if t.rule == "morning"
        ));
    }

    #[test]
    fn test_proactive_queue_ordered_by_priority() {
        let now = Instant::now();
        let mut m = ConversationMachine::new("dev-1", MachineConfig::default());
        speak(&mut m, 1, now);

        m.handle(PipelineEvent::Proactive(trigger("silence", 3)), now);
        m.handle(PipelineEvent::Proactive(trigger("meds", 1)), now);
        m.handle(
            PipelineEvent::TranscriptionFailed {
                turn_id: 1,
                reason: "x".to_string(),
            },
            now,
        );
        m.handle(PipelineEvent::Tick, now + Duration::from_secs(5));

        assert!(matches!(
            m.turn(2).unwrap().trigger,
            TriggerKind::Proactive(ref t) if t.rule == "meds"
        ));
    }

    #[test]
    fn test_fault_fails_active_turn() {
        let now = Instant::now();
        let mut m = ConversationMachine::new("dev-1", MachineConfig::default());
        speak(&mut m, 1, now);
        m.handle(
            PipelineEvent::TranscriptReady {
                turn_id: 1,
                transcript: Transcript::new("hello", 0.9),
            },
            now,
        );

        let actions = m.handle(
            PipelineEvent::Fault {
                turn_id: Some(1),
                reason: "worker crashed".to_string(),
            },
            now,
        );
        assert!(actions.iter().any(|a| matches!(a, Action::Cancel { turn_id: 1 })));
        assert_eq!(m.state(), ConversationState::Error);
        assert_eq!(m.non_terminal_turns(), 0);
    }

    #[test]
    fn test_reset_clears_queues() {
        let now = Instant::now();
        let mut m = ConversationMachine::new("dev-1", MachineConfig::default());
        speak(&mut m, 1, now);
        m.handle(PipelineEvent::Proactive(trigger("x", 1)), now);

        let actions = m.handle(PipelineEvent::Reset, now);
        assert!(actions.iter().any(|a| matches!(a, Action::Cancel { turn_id: 1 })));
        assert_eq!(m.state(), ConversationState::Idle);
        assert_eq!(m.pending_proactive(), 0);
        assert!(generates(&actions).is_empty());
    }

    #[test]
    fn test_trace_replay_single_active_turn() {
        let now = Instant::now();
        let mut m = ConversationMachine::new("dev-1", MachineConfig::default());

        for round in 0..5u64 {
            let turn_id = round + 1;
            speak(&mut m, turn_id, now);
            assert!(m.non_terminal_turns() <= 1);
            m.handle(PipelineEvent::Proactive(trigger("p", 2)), now);
            assert!(m.non_terminal_turns() <= 1);
            m.handle(
                PipelineEvent::TranscriptionFailed {
                    turn_id: m.active_turn().unwrap(),
                    reason: "x".to_string(),
                },
                now,
            );
            assert!(m.non_terminal_turns() <= 1);
            m.handle(PipelineEvent::Tick, now + Duration::from_secs(5));
            if let Some(active) = m.active_turn() {
                m.handle(
                    PipelineEvent::TurnComplete {
                        turn_id: active,
                        cue_sent: false,
                        first_audio_at: None,
                    },
                    now,
                );
            }
            assert!(m.non_terminal_turns() <= 1);
        }

        // Every turn that left Idle came back to a terminal status
        for pair in m.trace().windows(2) {
            assert_eq!(pair[0].to, pair[1].from);
        }
    }
}
