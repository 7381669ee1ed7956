//! Utterance segmentation
//!
//! Consumes a session's continuous audio and emits utterance boundaries.
//! A rolling (exponentially smoothed) activity score opens an utterance once
//! it stays above the speech threshold for the start dwell, and closes it once
//! it stays below the silence threshold for the hangover. Scores between the
//! two thresholds count as continuing speech.

use std::collections::HashMap;
use std::sync::Arc;

use super::activity::{ActivityModel, EnergyModel};
use super::wav::{SAMPLE_RATE, samples_to_wav};
use crate::Result;

/// Segmenter tuning
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Sample rate of incoming PCM
    pub sample_rate: u32,
    /// Rolling score at or above which a chunk counts as speech
    pub speech_threshold: f32,
    /// Rolling score below which a chunk counts as silence
    pub silence_threshold: f32,
    /// Speech must persist this long before an utterance opens
    pub start_dwell_ms: u64,
    /// Silence must persist this long before an utterance closes
    pub hangover_ms: u64,
    /// Utterances are force-closed at this length
    pub max_utterance_ms: u64,
    /// Weight of the newest chunk in the rolling score (1.0 disables smoothing)
    pub smoothing: f32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            speech_threshold: 0.5,
            silence_threshold: 0.35,
            start_dwell_ms: 200,
            hangover_ms: 1000,
            max_utterance_ms: 15_000,
            smoothing: 0.6,
        }
    }
}

impl SegmenterConfig {
    fn samples_for(&self, ms: u64) -> u64 {
        ms * u64::from(self.sample_rate) / 1000
    }

    fn ms_for(&self, samples: u64) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        samples * 1000 / u64::from(self.sample_rate)
    }
}

/// A chunk of device audio tagged with its transport sequence number
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Monotonic per-session sequence number assigned by the device
    pub seq: u64,
    /// 16-bit mono PCM
    pub samples: Vec<i16>,
}

impl AudioChunk {
    /// Create a chunk
    #[must_use]
    pub const fn new(seq: u64, samples: Vec<i16>) -> Self {
        Self { seq, samples }
    }
}

/// One segmented span of speech
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    /// Monotonic per-session utterance number
    pub seq: u64,
    /// Offset of the first sample on the session's audio clock
    pub started_at_ms: u64,
    /// Offset just past the last sample on the session's audio clock
    pub ended_at_ms: u64,
    /// Raw PCM payload
    pub samples: Vec<i16>,
    /// Closed by the max-duration limit rather than by silence
    pub forced: bool,
}

impl Utterance {
    /// Length of the utterance
    #[must_use]
    pub const fn duration_ms(&self) -> u64 {
        self.ended_at_ms.saturating_sub(self.started_at_ms)
    }

    /// Encode the payload as WAV for transcription
    ///
    /// # Errors
    ///
    /// Returns error if WAV encoding fails
    pub fn to_wav(&self, sample_rate: u32) -> Result<Vec<u8>> {
        samples_to_wav(&self.samples, sample_rate)
    }
}

/// Boundary events emitted by [`Segmenter::feed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentEvent {
    /// Speech persisted past the start dwell
    UtteranceStarted { utterance_seq: u64 },
    /// Chunk appended to the open utterance
    UtteranceContinuing { utterance_seq: u64 },
    /// Utterance closed by hangover or max duration
    UtteranceEnded(Utterance),
}

#[derive(Debug)]
enum Phase {
    Quiet {
        dwell: u64,
        pending: Vec<i16>,
        pending_start: u64,
        /// Set after a forced cut; cleared once the score drops to silence
        latched: bool,
    },
    Speaking {
        utterance_seq: u64,
        started_at: u64,
        buffer: Vec<i16>,
        silence: u64,
    },
}

impl Phase {
    const fn quiet(latched: bool) -> Self {
        Self::Quiet {
            dwell: 0,
            pending: Vec::new(),
            pending_start: 0,
            latched,
        }
    }
}

#[derive(Debug)]
struct Track {
    phase: Phase,
    last_chunk_seq: Option<u64>,
    /// Samples accepted so far (the session's audio clock)
    clock: u64,
    score: f32,
    next_utterance_seq: u64,
}

impl Track {
    const fn new() -> Self {
        Self {
            phase: Phase::quiet(false),
            last_chunk_seq: None,
            clock: 0,
            score: 0.0,
            next_utterance_seq: 1,
        }
    }
}

/// Per-session utterance segmenter
pub struct Segmenter {
    config: SegmenterConfig,
    model: Arc<dyn ActivityModel>,
    fallback: EnergyModel,
    tracks: HashMap<String, Track>,
}

impl Segmenter {
    /// Create a segmenter backed by the given activity model
    #[must_use]
    pub fn new(config: SegmenterConfig, model: Arc<dyn ActivityModel>) -> Self {
        tracing::debug!(
            model = model.name(),
            speech_threshold = config.speech_threshold,
            silence_threshold = config.silence_threshold,
            hangover_ms = config.hangover_ms,
            "segmenter initialized"
        );

        Self {
            config,
            model,
            fallback: EnergyModel::default(),
            tracks: HashMap::new(),
        }
    }

    /// Create a segmenter using only the energy heuristic
    #[must_use]
    pub fn with_energy(config: SegmenterConfig) -> Self {
        Self::new(config, Arc::new(EnergyModel::default()))
    }

    /// Feed one chunk for a session
    ///
    /// Chunks whose sequence number is not greater than the last accepted one
    /// are discarded (late, duplicated or reordered by the transport).
    pub fn feed(&mut self, session_id: &str, chunk: AudioChunk) -> Option<SegmentEvent> {
        let Self {
            config,
            model,
            fallback,
            tracks,
        } = self;

        let track = tracks
            .entry(session_id.to_string())
            .or_insert_with(Track::new);

        if let Some(last) = track.last_chunk_seq {
            if chunk.seq <= last {
                tracing::debug!(session_id, seq = chunk.seq, last, "discarding stale chunk");
                return None;
            }
        }
        track.last_chunk_seq = Some(chunk.seq);

        if chunk.samples.is_empty() {
            return None;
        }

        let raw = model.score(&chunk.samples).unwrap_or_else(|e| {
            tracing::warn!(
                session_id,
                model = model.name(),
                error = %e,
                "activity model failed, using energy heuristic"
            );
            fallback.energy_score(&chunk.samples)
        });

        let smoothing = config.smoothing.clamp(0.0, 1.0);
        track.score = smoothing.mul_add(raw, (1.0 - smoothing) * track.score);

        let len = chunk.samples.len() as u64;
        let chunk_start = track.clock;
        track.clock += len;

        advance(config, track, session_id, chunk.samples, chunk_start)
    }

    /// Drop all state for a session
    pub fn reset(&mut self, session_id: &str) {
        if self.tracks.remove(session_id).is_some() {
            tracing::debug!(session_id, "segmenter state reset");
        }
    }

    /// Whether an utterance is currently open for the session
    #[must_use]
    pub fn is_speaking(&self, session_id: &str) -> bool {
        self.tracks
            .get(session_id)
            .is_some_and(|t| matches!(t.phase, Phase::Speaking { .. }))
    }

    /// Current rolling score for the session
    #[must_use]
    pub fn score(&self, session_id: &str) -> f32 {
        self.tracks.get(session_id).map_or(0.0, |t| t.score)
    }

    /// Segmenter configuration
    #[must_use]
    pub const fn config(&self) -> &SegmenterConfig {
        &self.config
    }
}

/// Run the phase machine for one accepted chunk
fn advance(
    config: &SegmenterConfig,
    track: &mut Track,
    session_id: &str,
    samples: Vec<i16>,
    chunk_start: u64,
) -> Option<SegmentEvent> {
    let len = samples.len() as u64;
    let score = track.score;

    match &mut track.phase {
        Phase::Quiet {
            dwell,
            pending,
            pending_start,
            latched,
        } => {
            if *latched {
                if score < config.silence_threshold {
                    *latched = false;
                }
                return None;
            }

            if score < config.speech_threshold {
                *dwell = 0;
                pending.clear();
                return None;
            }

            if *dwell == 0 {
                *pending_start = chunk_start;
            }
            *dwell += len;
            pending.extend_from_slice(&samples);

            if *dwell < config.samples_for(config.start_dwell_ms) {
                tracing::trace!(session_id, dwell = *dwell, score, "speech dwell");
                return None;
            }

            let utterance_seq = track.next_utterance_seq;
            track.next_utterance_seq += 1;

            let buffer = std::mem::take(pending);
            let started_at = *pending_start;
            track.phase = Phase::Speaking {
                utterance_seq,
                started_at,
                buffer,
                silence: 0,
            };

            tracing::debug!(session_id, utterance_seq, score, "utterance started");
            Some(SegmentEvent::UtteranceStarted { utterance_seq })
        }
        Phase::Speaking {
            utterance_seq,
            started_at,
            buffer,
            silence,
        } => {
            buffer.extend_from_slice(&samples);

            if score < config.silence_threshold {
                *silence += len;
            } else {
                *silence = 0;
            }

            let forced = buffer.len() as u64 >= config.samples_for(config.max_utterance_ms);
            let closed = *silence >= config.samples_for(config.hangover_ms);

            if !forced && !closed {
                return Some(SegmentEvent::UtteranceContinuing {
                    utterance_seq: *utterance_seq,
                });
            }

            let utterance = Utterance {
                seq: *utterance_seq,
                started_at_ms: config.ms_for(*started_at),
                ended_at_ms: config.ms_for(track.clock),
                samples: std::mem::take(buffer),
                forced,
            };

            tracing::debug!(
                session_id,
                utterance_seq = utterance.seq,
                duration_ms = utterance.duration_ms(),
                forced,
                "utterance ended"
            );

            track.phase = Phase::quiet(forced);
            Some(SegmentEvent::UtteranceEnded(utterance))
        }
    }
}
