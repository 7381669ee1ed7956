//! Synthesis dispatcher
//!
//! One synthesis request per sentence, with up to `max_in_flight` requests
//! running at once. Finished audio waits in a reorder buffer until every
//! lower index has been emitted or skipped, so the device always hears
//! sentences in order no matter which request finishes first.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::types::{OutputFrame, SegmentOutcome, Sentence, TurnId};
use crate::backends::Synthesizer;
use crate::metrics::Metrics;
use crate::{Error, Result};

/// Shown to the device when no sentence of a turn could be voiced
pub const SPEECH_FAILURE_CUE: &str = "Sorry, I'm having trouble speaking right now.";

/// Dispatcher limits
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Concurrent synthesis requests per turn
    pub max_in_flight: usize,
    /// Wait per synthesis request
    pub timeout: Duration,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 2,
            timeout: Duration::from_secs(10),
        }
    }
}

/// What the dispatcher did for one turn
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SynthesisSummary {
    pub turn_id: TurnId,
    /// Per-sentence outcomes in index order
    pub outcomes: Vec<(usize, SegmentOutcome)>,
    /// A text-only cue was sent because nothing could be voiced
    pub cue_sent: bool,
    pub cancelled: bool,
    /// When the first audio segment was sent
    pub first_audio_at: Option<Instant>,
}

impl SynthesisSummary {
    /// Sentences whose audio reached the output
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, SegmentOutcome::Delivered { .. }))
            .count()
    }

    /// Sentences skipped after a synthesis failure
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.outcomes.len() - self.delivered()
    }
}

/// Synthesizes sentences and emits ordered output frames
pub struct SynthesisDispatcher {
    synthesizer: Arc<dyn Synthesizer>,
    voice: String,
    config: SynthesisConfig,
    metrics: Arc<Metrics>,
}

impl SynthesisDispatcher {
    /// Create a dispatcher
    #[must_use]
    pub fn new(synthesizer: Arc<dyn Synthesizer>, voice: String, config: SynthesisConfig) -> Self {
        Self {
            synthesizer,
            voice,
            config,
            metrics: Arc::default(),
        }
    }

    /// Record synthesis latency here
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Voice one turn's sentences onto `out`, ending with an end-of-turn frame
    ///
    /// A sentence whose synthesis fails or times out is skipped. If nothing
    /// could be voiced a text cue is sent so the turn never ends in silence.
    ///
    /// # Errors
    ///
    /// Returns `Error::BusClosed` if `out` is closed
    pub async fn dispatch<S>(
        &self,
        turn_id: TurnId,
        sentences: S,
        out: &mpsc::Sender<OutputFrame>,
        cancel: &CancellationToken,
    ) -> Result<SynthesisSummary>
    where
        S: Stream<Item = Sentence> + Unpin,
    {
        self.run(turn_id, sentences, out, cancel, SPEECH_FAILURE_CUE)
            .await
    }

    /// Voice a single cue sentence (apology or reprompt) as its own turn output
    ///
    /// If the cue cannot be voiced its text is sent as a text-only cue.
    ///
    /// # Errors
    ///
    /// Returns `Error::BusClosed` if `out` is closed
    pub async fn speak_cue(
        &self,
        turn_id: TurnId,
        text: &str,
        out: &mpsc::Sender<OutputFrame>,
        cancel: &CancellationToken,
    ) -> Result<SynthesisSummary> {
        let sentence = Sentence::new(text, 0, true);
        self.run(turn_id, futures::stream::iter([sentence]), out, cancel, text)
            .await
    }

    async fn run<S>(
        &self,
        turn_id: TurnId,
        mut sentences: S,
        out: &mpsc::Sender<OutputFrame>,
        cancel: &CancellationToken,
        failure_cue: &str,
    ) -> Result<SynthesisSummary>
    where
        S: Stream<Item = Sentence> + Unpin,
    {
        let mut summary = SynthesisSummary {
            turn_id,
            ..SynthesisSummary::default()
        };
        let mut in_flight = FuturesUnordered::new();
        let mut ready: BTreeMap<usize, (String, Option<Vec<u8>>)> = BTreeMap::new();
        let mut next_emit = 0;
        let mut next_expected = 0;
        let mut input_done = false;
        let max_in_flight = self.config.max_in_flight.max(1);

        loop {
            if input_done && in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!(turn_id, "synthesis cancelled");
                    summary.cancelled = true;
                    return Ok(summary);
                }
                Some((index, text, audio)) = in_flight.next(), if !in_flight.is_empty() => {
                    ready.insert(index, (text, audio));
                    while let Some((text, audio)) = ready.remove(&next_emit) {
                        let outcome = match audio {
                            Some(audio) => {
                                let bytes = audio.len();
                                out.send(OutputFrame::Segment {
                                    turn_id,
                                    sentence_index: next_emit,
                                    text,
                                    audio,
                                })
                                .await
                                .map_err(|_| Error::BusClosed("output"))?;
                                summary.first_audio_at.get_or_insert_with(Instant::now);
                                SegmentOutcome::Delivered { bytes }
                            }
                            None => SegmentOutcome::Skipped,
                        };
                        summary.outcomes.push((next_emit, outcome));
                        next_emit += 1;
                    }
                }
                sentence = sentences.next(), if !input_done && in_flight.len() < max_in_flight => {
                    let Some(sentence) = sentence else {
                        input_done = true;
                        continue;
                    };
                    if sentence.index != next_expected {
                        tracing::warn!(
                            turn_id,
                            index = sentence.index,
                            expected = next_expected,
                            "ignoring out-of-sequence sentence"
                        );
                        continue;
                    }
                    next_expected += 1;
                    in_flight.push(self.synthesize_one(turn_id, sentence));
                }
            }
        }

        if summary.delivered() == 0 {
            tracing::warn!(turn_id, skipped = summary.skipped(), "no audio produced, sending cue");
            out.send(OutputFrame::Cue {
                turn_id,
                text: failure_cue.to_string(),
            })
            .await
            .map_err(|_| Error::BusClosed("output"))?;
            summary.cue_sent = true;
        }

        out.send(OutputFrame::EndOfTurn {
            turn_id,
            segments: summary.delivered(),
            skipped: summary.skipped(),
        })
        .await
        .map_err(|_| Error::BusClosed("output"))?;

        tracing::debug!(
            turn_id,
            delivered = summary.delivered(),
            skipped = summary.skipped(),
            "turn output complete"
        );
        Ok(summary)
    }

    async fn synthesize_one(
        &self,
        turn_id: TurnId,
        sentence: Sentence,
    ) -> (usize, String, Option<Vec<u8>>) {
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.config.timeout,
            self.synthesizer.synthesize(&sentence.text, &self.voice),
        )
        .await
        .unwrap_or(Err(Error::Timeout("synthesis")));

        let audio = match result {
            Ok(audio) if !audio.is_empty() => {
                self.metrics.tts.observe(started.elapsed());
                Some(audio)
            }
            Ok(_) => {
                tracing::warn!(turn_id, index = sentence.index, "synthesis returned no audio, skipping");
                None
            }
            Err(e) => {
                tracing::warn!(turn_id, index = sentence.index, error = %e, "synthesis failed, skipping sentence");
                None
            }
        };

        (sentence.index, sentence.text, audio)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;

    /// Per-text delays and failures
    struct Scripted {
        delays_ms: HashMap<&'static str, u64>,
        fail: Vec<&'static str>,
    }

    #[async_trait]
    impl Synthesizer for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn synthesize(&self, text: &str, _voice: &str) -> Result<Vec<u8>> {
            if let Some(ms) = self.delays_ms.get(text) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            if self.fail.contains(&text) {
                return Err(Error::SynthesisUnavailable("boom".to_string()));
            }
            Ok(text.as_bytes().to_vec())
        }
    }

    fn sentences(texts: &[&str]) -> Vec<Sentence> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| Sentence::new(*t, i, i + 1 == texts.len()))
            .collect()
    }

    fn collect(rx: &mut mpsc::Receiver<OutputFrame>) -> Vec<OutputFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_completion_emits_in_order() {
        let metrics = Arc::new(Metrics::default());
        let dispatcher = SynthesisDispatcher::new(
            Arc::new(Scripted {
                delays_ms: HashMap::from([("first", 300), ("second", 10)]),
                fail: vec![],
            }),
            "voice".to_string(),
            SynthesisConfig::default(),
        )
        .with_metrics(Arc::clone(&metrics));
        let (tx, mut rx) = mpsc::channel(16);
        let started = Instant::now();

        let summary = dispatcher
            .dispatch(
                7,
                futures::stream::iter(sentences(&["first", "second", "third"])),
                &tx,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let indices: Vec<_> = collect(&mut rx)
            .into_iter()
            .filter_map(|f| match f {
                OutputFrame::Segment { sentence_index, .. } => Some(sentence_index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(summary.delivered(), 3);
        // Held back until the slow first sentence finished
        let first_audio = summary.first_audio_at.unwrap();
        assert!(first_audio.duration_since(started) >= Duration::from_millis(300));
        assert_eq!(metrics.tts.count(), 3);
    }

    #[tokio::test]
    async fn test_failed_sentence_is_skipped() {
        let dispatcher = SynthesisDispatcher::new(
            Arc::new(Scripted {
                delays_ms: HashMap::new(),
                fail: vec!["bad"],
            }),
            "voice".to_string(),
            SynthesisConfig::default(),
        );
        let (tx, mut rx) = mpsc::channel(16);

        let summary = dispatcher
            .dispatch(
                1,
                futures::stream::iter(sentences(&["good", "bad", "fine"])),
                &tx,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.skipped(), 1);
        let frames = collect(&mut rx);
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames[2],
            OutputFrame::EndOfTurn {
                turn_id: 1,
                segments: 2,
                skipped: 1
            }
        );
    }

    #[tokio::test]
    async fn test_total_failure_sends_cue() {
        let dispatcher = SynthesisDispatcher::new(
            Arc::new(Scripted {
                delays_ms: HashMap::new(),
                fail: vec!["only"],
            }),
            "voice".to_string(),
            SynthesisConfig::default(),
        );
        let (tx, mut rx) = mpsc::channel(16);

        let summary = dispatcher
            .speak_cue(3, "only", &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert!(summary.cue_sent);
        assert_eq!(summary.first_audio_at, None);
        let frames = collect(&mut rx);
        assert_eq!(
            frames[0],
            OutputFrame::Cue {
                turn_id: 3,
                text: "only".to_string()
            }
        );
        assert!(matches!(frames[1], OutputFrame::EndOfTurn { segments: 0, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_skips_sentence() {
        let dispatcher = SynthesisDispatcher::new(
            Arc::new(Scripted {
                delays_ms: HashMap::from([("slow", 60_000)]),
                fail: vec![],
            }),
            "voice".to_string(),
            SynthesisConfig::default(),
        );
        let (tx, _rx) = mpsc::channel(16);

        let summary = dispatcher
            .dispatch(
                1,
                futures::stream::iter(sentences(&["slow", "quick"])),
                &tx,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            summary.outcomes,
            vec![
                (0, SegmentOutcome::Skipped),
                (1, SegmentOutcome::Delivered { bytes: 5 })
            ]
        );
    }
}
