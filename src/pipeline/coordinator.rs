//! Session coordinator
//!
//! Spawns the stage workers for one device session and connects them over
//! the session bus:
//!
//! ```text
//! device audio -> segmenter --\
//! transcriber ----------------+-> orchestrator (state machine)
//! generator ------------------+     |  transcription / generation / cue jobs
//! synthesizer ----------------+     v
//! proactive scheduler --------/   workers -> output frames -> device
//! ```
//!
//! Only the orchestrator task touches the [`ConversationMachine`]. Workers
//! receive jobs tagged with a turn id and a per-turn cancellation token, and
//! report back with events.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::bus::{self, Publisher, Subscriber, Topic};
use super::generation::GenerationPipeliner;
use super::learn::extract_facts;
use super::machine::{Action, ConversationMachine, PipelineEvent};
use super::proactive::{ProactiveScheduler, Rule, RuleContext};
use super::prompt::{GenerationRequest, PromptBuilder, PromptContext};
use super::synthesis::{SynthesisDispatcher, SynthesisSummary};
use super::types::{
    OutputFrame, Sentence, SessionSnapshot, Transcript, TriggerKind, Turn, TurnId, TurnStatus,
};
use super::PipelineConfig;
use crate::backends::{Backends, Transcriber};
use crate::db::{
    CarePlan, ConversationTurn, DbPool, FactRepo, HistoryRepo, LearnedFact, ProfileRepo, Role,
    UserProfile,
};
use crate::voice::{AudioChunk, SAMPLE_RATE, SegmentEvent, Segmenter, SegmenterConfig, Utterance};
use crate::metrics::Metrics;
use crate::{Error, Result};

/// Prior turns read from the store for each prompt
const HISTORY_FETCH: usize = 48;

/// Repositories a session reads and writes
#[derive(Clone)]
pub struct Store {
    pub profiles: ProfileRepo,
    pub history: HistoryRepo,
    pub facts: FactRepo,
    /// The person this companion talks to
    pub user_id: String,
}

/// Everything the prompt builder needs, read in one go
struct PromptInputs {
    profile: UserProfile,
    care_plan: CarePlan,
    facts: Vec<LearnedFact>,
    history: Vec<ConversationTurn>,
}

impl Store {
    /// Repositories over one pool
    #[must_use]
    pub fn new(pool: &DbPool, user_id: impl Into<String>) -> Self {
        Self {
            profiles: ProfileRepo::new(pool.clone()),
            history: HistoryRepo::new(pool.clone()),
            facts: FactRepo::new(pool.clone()),
            user_id: user_id.into(),
        }
    }

    fn prompt_inputs(&self, session_id: &str) -> Result<PromptInputs> {
        Ok(PromptInputs {
            profile: self.profiles.get_or_create(&self.user_id)?,
            care_plan: self.profiles.care_plan(&self.user_id)?,
            facts: self.facts.list(&self.user_id)?,
            history: self.history.recent(session_id, HISTORY_FETCH)?,
        })
    }

    /// Persist a finished turn and learn from what the user said
    ///
    /// # Errors
    ///
    /// Returns error if a database operation fails
    pub fn record_turn(&self, session_id: &str, turn: &Turn) -> Result<()> {
        if let (TriggerKind::UserSpeech, Some(transcript)) = (&turn.trigger, &turn.transcript) {
            let text = transcript.text.trim();
            if !text.is_empty() {
                self.history
                    .append(session_id, &self.user_id, turn.id, Role::User, text)?;
                let learned = self.learn(text)?;
                if learned > 0 {
                    tracing::debug!(session_id, turn_id = turn.id, learned, "facts learned");
                }
            }
        }

        let response = turn.response_text();
        if turn.status == TurnStatus::Complete && !response.is_empty() {
            self.history
                .append(session_id, &self.user_id, turn.id, Role::Assistant, &response)?;
        }
        Ok(())
    }

    /// Extract and store facts from a transcript; returns how many were found
    ///
    /// # Errors
    ///
    /// Returns error if a database operation fails
    pub fn learn(&self, text: &str) -> Result<usize> {
        let facts = extract_facts(&self.user_id, text);
        for fact in &facts {
            self.facts.upsert(fact)?;
        }

        let identity: Vec<&LearnedFact> = facts
            .iter()
            .filter(|f| f.fact_type == "identity")
            .collect();
        if !identity.is_empty() {
            let mut profile = self.profiles.get_or_create(&self.user_id)?;
            for fact in identity {
                match fact.key.as_str() {
                    "name" => profile.name.clone_from(&fact.value),
                    "preferred_name" => profile.preferred_name = Some(fact.value.clone()),
                    _ => {}
                }
            }
            self.profiles.update(&profile)?;
        }

        Ok(facts.len())
    }
}

#[derive(Debug)]
struct TranscriptionJob {
    utterance: Utterance,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct GenerationJob {
    trigger: TriggerKind,
    transcript: Option<Transcript>,
    cancel: CancellationToken,
}

#[derive(Debug)]
enum SynthesisJob {
    Sentence {
        sentence: Sentence,
        cancel: CancellationToken,
    },
    Cue {
        text: &'static str,
        cancel: CancellationToken,
    },
}

/// Builds per-device session pipelines over shared backends and store
pub struct SessionCoordinator {
    backends: Backends,
    store: Store,
    config: PipelineConfig,
    segmenter: SegmenterConfig,
    prompt: PromptBuilder,
    rules: Vec<Rule>,
    proactive_tick: Duration,
    generation: Arc<GenerationPipeliner>,
    synthesis: Arc<SynthesisDispatcher>,
    metrics: Arc<Metrics>,
}

impl SessionCoordinator {
    /// Create a coordinator with default segmenter and prompt settings and no proactive rules
    #[must_use]
    pub fn new(backends: Backends, store: Store, config: PipelineConfig) -> Self {
        let metrics = Arc::new(Metrics::default());
        let generation = Arc::new(GenerationPipeliner::new(
            Arc::clone(&backends.model),
            config.generation(),
        ));
        let synthesis = Arc::new(
            SynthesisDispatcher::new(
                Arc::clone(&backends.synthesizer),
                backends.voice.clone(),
                config.synthesis(),
            )
            .with_metrics(Arc::clone(&metrics)),
        );

        Self {
            backends,
            store,
            config,
            segmenter: SegmenterConfig::default(),
            prompt: PromptBuilder::default(),
            rules: Vec::new(),
            proactive_tick: Duration::from_secs(30),
            generation,
            synthesis,
            metrics,
        }
    }

    /// Use these segmenter thresholds
    #[must_use]
    pub fn with_segmenter(mut self, segmenter: SegmenterConfig) -> Self {
        self.segmenter = segmenter;
        self
    }

    /// Use this prompt builder
    #[must_use]
    pub fn with_prompt(mut self, prompt: PromptBuilder) -> Self {
        self.prompt = prompt;
        self
    }

    /// Evaluate these proactive rules every `tick`
    #[must_use]
    pub fn with_rules(mut self, rules: Vec<Rule>, tick: Duration) -> Self {
        self.rules = rules;
        self.proactive_tick = tick;
        self
    }

    /// Shared store
    #[must_use]
    pub const fn store(&self) -> &Store {
        &self.store
    }

    /// Latency and outcome metrics across every session
    #[must_use]
    pub const fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Start the workers for a device session
    #[must_use]
    pub fn spawn(&self, session_id: &str) -> SessionHandle {
        let capacity = self.config.bus_capacity;
        let cancel = CancellationToken::new();

        let (audio_tx, audio_rx) = bus::topic(session_id, Topic::Audio, "device", capacity);
        let (events_tx, events_rx) =
            bus::topic(session_id, Topic::Orchestration, "device", capacity);
        let (transcribe_tx, transcribe_rx) =
            bus::topic(session_id, Topic::Transcription, "orchestrator", capacity);
        let (generate_tx, generate_rx) =
            bus::topic(session_id, Topic::Generation, "orchestrator", capacity);
        let (speak_tx, speak_rx) = bus::topic(session_id, Topic::Synthesis, "orchestrator", capacity);
        let (output_tx, output_rx) = mpsc::channel(capacity.max(1));

        let machine = ConversationMachine::new(session_id, self.config.machine());
        let (snapshot_tx, snapshot_rx) = watch::channel(machine.snapshot());

        let mut tasks = JoinSet::new();

        tasks.spawn(supervise(
            "segmenter",
            segmentation_worker(
                Segmenter::with_energy(self.segmenter.clone()),
                session_id.to_string(),
                Arc::clone(&self.metrics),
                audio_rx,
                events_tx.fork("segmenter"),
                cancel.clone(),
            ),
        ));

        tasks.spawn(supervise(
            "transcriber",
            transcription_worker(
                Arc::clone(&self.backends.transcriber),
                self.config.transcription_timeout,
                Arc::clone(&self.metrics),
                transcribe_rx,
                events_tx.fork("transcriber"),
                cancel.clone(),
            ),
        ));

        let generator = GenerationWorker {
            session_id: session_id.to_string(),
            store: self.store.clone(),
            prompt: self.prompt.clone(),
            pipeliner: Arc::clone(&self.generation),
            metrics: Arc::clone(&self.metrics),
            events: events_tx.fork("generator"),
            speak: speak_tx.fork("generator"),
        };
        tasks.spawn(supervise("generator", generator.run(generate_rx, cancel.clone())));

        tasks.spawn(supervise(
            "synthesizer",
            synthesis_worker(
                Arc::clone(&self.synthesis),
                Arc::clone(&self.metrics),
                speak_rx,
                events_tx.fork("synthesizer"),
                output_tx.clone(),
                cancel.clone(),
            ),
        ));

        if !self.rules.is_empty() {
            tasks.spawn(supervise(
                "proactive",
                proactive_worker(
                    ProactiveScheduler::new(self.rules.clone()),
                    self.store.clone(),
                    snapshot_rx.clone(),
                    events_tx.fork("proactive"),
                    self.proactive_tick,
                    cancel.clone(),
                ),
            ));
        }

        let orchestrator = Orchestrator {
            session_id: session_id.to_string(),
            machine,
            store: self.store.clone(),
            transcribe: transcribe_tx,
            generate: generate_tx,
            speak: speak_tx,
            output: output_tx,
            snapshot: snapshot_tx,
            turns: HashMap::new(),
            speech_ended: HashMap::new(),
            metrics: Arc::clone(&self.metrics),
            cancel: cancel.clone(),
        };
        tasks.spawn(supervise(
            "orchestrator",
            orchestrator.run(events_rx, self.config.tick_interval),
        ));

        tracing::info!(session_id, "session started");

        SessionHandle {
            session_id: session_id.to_string(),
            audio: audio_tx,
            events: events_tx,
            snapshot: snapshot_rx,
            output: Some(output_rx),
            tasks,
            cancel: cancel.clone(),
            _guard: cancel.drop_guard(),
        }
    }
}

/// A running session pipeline
///
/// Dropping the handle stops every worker.
pub struct SessionHandle {
    session_id: String,
    audio: Publisher<AudioChunk>,
    events: Publisher<PipelineEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
    output: Option<mpsc::Receiver<OutputFrame>>,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl SessionHandle {
    /// Session id (the device id)
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Send one chunk of device audio
    ///
    /// # Errors
    ///
    /// Returns `Error::BusClosed` if the session has stopped
    pub async fn send_audio(&mut self, chunk: AudioChunk) -> Result<()> {
        self.audio.publish(0, chunk).await.map(|_| ())
    }

    /// Drop the active turn and any queued work
    ///
    /// # Errors
    ///
    /// Returns `Error::BusClosed` if the session has stopped
    pub async fn reset(&mut self) -> Result<()> {
        self.events.publish(0, PipelineEvent::Reset).await.map(|_| ())
    }

    /// Latest state snapshot
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified after every state machine step
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Frames for the device; available once
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<OutputFrame>> {
        self.output.take()
    }

    /// Stop every worker and wait for them to exit
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while self.tasks.join_next().await.is_some() {}
        tracing::info!(session_id = %self.session_id, "session stopped");
    }
}

async fn supervise(worker: &'static str, work: impl Future<Output = Result<()>>) {
    match work.await {
        Ok(()) => tracing::debug!(worker, "worker stopped"),
        Err(Error::BusClosed(topic)) => {
            tracing::debug!(worker, topic, "worker stopped, topic closed");
        }
        Err(e) => tracing::error!(worker, error = %e, "worker failed"),
    }
}

/// Owns the state machine and routes its actions
struct Orchestrator {
    session_id: String,
    machine: ConversationMachine,
    store: Store,
    transcribe: Publisher<TranscriptionJob>,
    generate: Publisher<GenerationJob>,
    speak: Publisher<SynthesisJob>,
    output: mpsc::Sender<OutputFrame>,
    snapshot: watch::Sender<SessionSnapshot>,
    turns: HashMap<TurnId, CancellationToken>,
    /// When each user turn's utterance was handed to transcription
    speech_ended: HashMap<TurnId, Instant>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl Orchestrator {
    async fn run(mut self, mut events: Subscriber<PipelineEvent>, every: Duration) -> Result<()> {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => break,
                envelope = events.recv() => match envelope {
                    Some(envelope) => envelope.payload,
                    None => break,
                },
                _ = tick.tick() => PipelineEvent::Tick,
            };
            self.apply(event).await?;
        }

        for (_, token) in self.turns.drain() {
            token.cancel();
        }
        Ok(())
    }

    async fn apply(&mut self, event: PipelineEvent) -> Result<()> {
        if !matches!(event, PipelineEvent::Tick) {
            tracing::debug!(session_id = %self.session_id, event = event.name(), "pipeline event");
        }

        if let PipelineEvent::TurnComplete {
            turn_id,
            first_audio_at: Some(at),
            ..
        } = &event
            && let Some(ended) = self.speech_ended.remove(turn_id)
        {
            self.metrics.pipeline.observe(at.saturating_duration_since(ended));
        }

        let actions = self.machine.handle(event, Instant::now());
        self.snapshot.send_replace(self.machine.snapshot());

        for action in actions {
            self.route(action).await?;
        }
        Ok(())
    }

    fn turn_token(&mut self, turn_id: TurnId) -> CancellationToken {
        let session = &self.cancel;
        self.turns
            .entry(turn_id)
            .or_insert_with(|| session.child_token())
            .clone()
    }

    async fn route(&mut self, action: Action) -> Result<()> {
        match action {
            Action::Transcribe { turn_id, utterance } => {
                self.speech_ended.insert(turn_id, Instant::now());
                let cancel = self.turn_token(turn_id);
                self.transcribe
                    .publish(turn_id, TranscriptionJob { utterance, cancel })
                    .await?;
            }
            Action::Generate {
                turn_id,
                trigger,
                transcript,
            } => {
                let cancel = self.turn_token(turn_id);
                self.generate
                    .publish(
                        turn_id,
                        GenerationJob {
                            trigger,
                            transcript,
                            cancel,
                        },
                    )
                    .await?;
            }
            Action::Cue { turn_id, kind } => {
                let cancel = self.turn_token(turn_id);
                self.speak
                    .publish(
                        turn_id,
                        SynthesisJob::Cue {
                            text: kind.text(),
                            cancel,
                        },
                    )
                    .await?;
            }
            Action::Cancel { turn_id } => {
                if let Some(token) = self.turns.remove(&turn_id) {
                    tracing::debug!(session_id = %self.session_id, turn_id, "cancelling turn");
                    token.cancel();
                }
            }
            Action::TurnFinished(turn) => {
                self.turns.remove(&turn.id);
                self.speech_ended.remove(&turn.id);
                self.metrics.record_turn(&turn);
                if let Err(e) = self.store.record_turn(&self.session_id, &turn) {
                    tracing::warn!(
                        session_id = %self.session_id,
                        turn_id = turn.id,
                        error = %e,
                        "failed to record turn"
                    );
                }
            }
            Action::StateChanged { to, turn_id, .. } => {
                // State frames are advisory; never block the machine on a slow device
                if let Err(e) = self.output.try_send(OutputFrame::State { state: to, turn_id }) {
                    tracing::debug!(session_id = %self.session_id, error = %e, "state frame not sent");
                }
            }
        }
        Ok(())
    }
}

async fn segmentation_worker(
    mut segmenter: Segmenter,
    session_id: String,
    metrics: Arc<Metrics>,
    mut audio: Subscriber<AudioChunk>,
    mut events: Publisher<PipelineEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let envelope = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            envelope = audio.recv() => envelope,
        };
        let Some(envelope) = envelope else {
            return Ok(());
        };

        metrics.audio_chunks.inc();
        let started = Instant::now();
        let segmented = segmenter.feed(&session_id, envelope.payload);
        metrics.vad.observe(started.elapsed());

        match segmented {
            None | Some(SegmentEvent::UtteranceContinuing { .. }) => {}
            Some(event) => {
                events.publish(0, PipelineEvent::Segment(event)).await?;
            }
        }
    }
}

async fn transcribe(
    transcriber: &dyn Transcriber,
    utterance: &Utterance,
    timeout: Duration,
) -> Result<Transcript> {
    let wav = utterance.to_wav(SAMPLE_RATE)?;
    tokio::time::timeout(timeout, transcriber.transcribe(&wav))
        .await
        .map_err(|_| Error::Timeout("transcription"))?
}

async fn transcription_worker(
    transcriber: Arc<dyn Transcriber>,
    timeout: Duration,
    metrics: Arc<Metrics>,
    mut jobs: Subscriber<TranscriptionJob>,
    mut events: Publisher<PipelineEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let envelope = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            envelope = jobs.recv() => envelope,
        };
        let Some(envelope) = envelope else {
            return Ok(());
        };
        let turn_id = envelope.turn_id;
        let job = envelope.payload;

        let started = Instant::now();
        let result = tokio::select! {
            () = job.cancel.cancelled() => continue,
            result = transcribe(transcriber.as_ref(), &job.utterance, timeout) => result,
        };

        let event = match result {
            Ok(transcript) => {
                metrics.asr.observe(started.elapsed());
                tracing::info!(
                    turn_id,
                    backend = transcriber.name(),
                    latency_ms = started.elapsed().as_millis(),
                    confidence = transcript.confidence,
                    chars = transcript.text.len(),
                    "utterance transcribed"
                );
                PipelineEvent::TranscriptReady {
                    turn_id,
                    transcript,
                }
            }
            Err(e) => {
                tracing::warn!(turn_id, backend = transcriber.name(), error = %e, "transcription failed");
                PipelineEvent::TranscriptionFailed {
                    turn_id,
                    reason: e.to_string(),
                }
            }
        };
        events.publish(turn_id, event).await?;
    }
}

struct GenerationWorker {
    session_id: String,
    store: Store,
    prompt: PromptBuilder,
    pipeliner: Arc<GenerationPipeliner>,
    metrics: Arc<Metrics>,
    events: Publisher<PipelineEvent>,
    speak: Publisher<SynthesisJob>,
}

impl GenerationWorker {
    async fn run(mut self, mut jobs: Subscriber<GenerationJob>, cancel: CancellationToken) -> Result<()> {
        loop {
            let envelope = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                envelope = jobs.recv() => envelope,
            };
            let Some(envelope) = envelope else {
                return Ok(());
            };
            self.generate(envelope.turn_id, envelope.payload).await?;
        }
    }

    fn request(&self, job: &GenerationJob) -> GenerationRequest {
        let inputs = self.store.prompt_inputs(&self.session_id).unwrap_or_else(|e| {
            tracing::warn!(
                session_id = %self.session_id,
                error = %e,
                "store unavailable, prompting without profile or history"
            );
            PromptInputs {
                profile: UserProfile::new(self.store.user_id.clone()),
                care_plan: CarePlan::default(),
                facts: Vec::new(),
                history: Vec::new(),
            }
        });

        let ctx = PromptContext {
            profile: &inputs.profile,
            care_plan: (!inputs.care_plan.is_empty()).then_some(&inputs.care_plan),
            facts: &inputs.facts,
            history: &inputs.history,
        };
        self.prompt.build(&ctx, &job.trigger, job.transcript.as_ref())
    }

    async fn generate(&mut self, turn_id: TurnId, job: GenerationJob) -> Result<()> {
        let request = self.request(&job);
        let started = Instant::now();
        let (mut sentences, handle) = self.pipeliner.spawn(request, job.cancel.clone());

        while let Some(sentence) = sentences.next().await {
            if sentence.index == 0 {
                self.metrics.llm.observe(started.elapsed());
                tracing::info!(
                    session_id = %self.session_id,
                    turn_id,
                    trigger = job.trigger.label(),
                    latency_ms = started.elapsed().as_millis(),
                    "first sentence ready"
                );
            }
            self.events
                .publish(
                    turn_id,
                    PipelineEvent::SentenceReady {
                        turn_id,
                        sentence: sentence.clone(),
                    },
                )
                .await?;
            self.speak
                .publish(
                    turn_id,
                    SynthesisJob::Sentence {
                        sentence,
                        cancel: job.cancel.clone(),
                    },
                )
                .await?;
        }

        let event = match handle.await {
            Ok(Ok(outcome)) if outcome.cancelled => return Ok(()),
            Ok(Ok(outcome)) => {
                if outcome.fallback {
                    self.metrics.llm_fallbacks.inc();
                }
                PipelineEvent::GenerationFinished { turn_id, outcome }
            }
            Ok(Err(e)) => PipelineEvent::Fault {
                turn_id: Some(turn_id),
                reason: e.to_string(),
            },
            Err(e) => PipelineEvent::Fault {
                turn_id: Some(turn_id),
                reason: format!("generation task failed: {e}"),
            },
        };
        self.events.publish(turn_id, event).await?;
        Ok(())
    }
}

async fn synthesis_worker(
    dispatcher: Arc<SynthesisDispatcher>,
    metrics: Arc<Metrics>,
    mut jobs: Subscriber<SynthesisJob>,
    mut events: Publisher<PipelineEvent>,
    output: mpsc::Sender<OutputFrame>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut running: JoinSet<Result<SynthesisSummary>> = JoinSet::new();
    let mut feeds: HashMap<TurnId, mpsc::Sender<Sentence>> = HashMap::new();
    let mut owners: HashMap<task::Id, TurnId> = HashMap::new();

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                running.abort_all();
                return Ok(());
            }
            Some(joined) = running.join_next_with_id(), if !running.is_empty() => match joined {
                Ok((id, Ok(summary))) => {
                    owners.remove(&id);
                    feeds.remove(&summary.turn_id);
                    report(&mut events, &metrics, summary).await?;
                }
                Ok((_, Err(e))) => return Err(e),
                Err(e) => {
                    // Fault the turn the task voiced, which may no longer be the active one
                    let turn_id = owners.remove(&e.id());
                    if let Some(turn_id) = turn_id {
                        feeds.remove(&turn_id);
                    }
                    tracing::error!(?turn_id, error = %e, "synthesis task failed");
                    events
                        .publish(turn_id.unwrap_or(0), PipelineEvent::Fault {
                            turn_id,
                            reason: format!("synthesis task failed: {e}"),
                        })
                        .await?;
                }
            },
            envelope = jobs.recv() => {
                let Some(envelope) = envelope else {
                    return Ok(());
                };
                let turn_id = envelope.turn_id;

                match envelope.payload {
                    SynthesisJob::Sentence { sentence, cancel: turn_cancel } => {
                        let is_final = sentence.is_final;
                        let feed = feeds.entry(turn_id).or_insert_with(|| {
                            let (tx, rx) = mpsc::channel(8);
                            let dispatcher = Arc::clone(&dispatcher);
                            let output = output.clone();
                            let handle = running.spawn(async move {
                                dispatcher
                                    .dispatch(turn_id, ReceiverStream::new(rx), &output, &turn_cancel)
                                    .await
                            });
                            owners.insert(handle.id(), turn_id);
                            tx
                        });
                        if feed.send(sentence).await.is_err() {
                            tracing::debug!(turn_id, "synthesis for turn already stopped");
                        }
                        if is_final {
                            feeds.remove(&turn_id);
                        }
                    }
                    SynthesisJob::Cue { text, cancel: turn_cancel } => {
                        let dispatcher = Arc::clone(&dispatcher);
                        let output = output.clone();
                        let handle = running.spawn(async move {
                            dispatcher.speak_cue(turn_id, text, &output, &turn_cancel).await
                        });
                        owners.insert(handle.id(), turn_id);
                    }
                }
            }
        }
    }
}

async fn report(
    events: &mut Publisher<PipelineEvent>,
    metrics: &Metrics,
    summary: SynthesisSummary,
) -> Result<()> {
    if summary.cancelled {
        return Ok(());
    }
    metrics.segments_skipped.add(summary.skipped());
    if summary.cue_sent {
        metrics.text_cues.inc();
    }

    let turn_id = summary.turn_id;
    for (index, outcome) in summary.outcomes {
        events
            .publish(
                turn_id,
                PipelineEvent::SegmentEmitted {
                    turn_id,
                    index,
                    outcome,
                },
            )
            .await?;
    }
    events
        .publish(
            turn_id,
            PipelineEvent::TurnComplete {
                turn_id,
                cue_sent: summary.cue_sent,
                first_audio_at: summary.first_audio_at,
            },
        )
        .await?;
    Ok(())
}

async fn proactive_worker(
    mut scheduler: ProactiveScheduler,
    store: Store,
    snapshot: watch::Receiver<SessionSnapshot>,
    mut events: Publisher<PipelineEvent>,
    every: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            _ = tick.tick() => {}
        }

        let medication_times = match store.profiles.care_plan(&store.user_id) {
            Ok(plan) => plan.medication_times(),
            Err(e) => {
                tracing::warn!(error = %e, "care plan unavailable for proactive rules");
                Vec::new()
            }
        };
        let last_interaction = snapshot.borrow().last_interaction;

        let ctx = RuleContext {
            now: Local::now().naive_local(),
            last_interaction: last_interaction.with_timezone(&Local).naive_local(),
            medication_times: &medication_times,
        };

        for trigger in scheduler.evaluate(&ctx) {
            tracing::info!(rule = %trigger.rule, priority = trigger.priority, "proactive rule fired");
            events.publish(0, PipelineEvent::Proactive(trigger)).await?;
        }
    }
}
