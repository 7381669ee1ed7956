//! Pipeline metrics
//!
//! Per-stage latency histograms and outcome counters, shared by every
//! session of a coordinator and rendered in the Prometheus text format.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::pipeline::{Turn, TurnStatus};

const PIPELINE_BUCKETS: &[u64] = &[100, 200, 300, 400, 500, 600, 700, 800, 1000, 1500, 2000, 5000];
const VAD_BUCKETS: &[u64] = &[1, 5, 10, 20, 50, 100];
const ASR_BUCKETS: &[u64] = &[50, 100, 200, 300, 500, 750, 1000, 2000];
const LLM_BUCKETS: &[u64] = &[100, 200, 300, 500, 750, 1000, 1500, 2000, 3000, 5000];
const TTS_BUCKETS: &[u64] = &[20, 50, 100, 200, 300, 500, 1000, 2000];

/// Millisecond latency histogram with fixed bucket boundaries
#[derive(Debug)]
pub struct LatencyHistogram {
    name: &'static str,
    help: &'static str,
    boundaries: &'static [u64],
    /// One slot per boundary plus the overflow slot
    buckets: Vec<AtomicU64>,
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    /// Histogram over ascending `boundaries` in milliseconds
    #[must_use]
    pub fn new(name: &'static str, help: &'static str, boundaries: &'static [u64]) -> Self {
        Self {
            name,
            help,
            boundaries,
            buckets: (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record one latency
    pub fn observe(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        let slot = self
            .boundaries
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(self.boundaries.len());
        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Observations so far
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of every observation in milliseconds
    #[must_use]
    pub fn sum_ms(&self) -> u64 {
        self.sum_ms.load(Ordering::Relaxed)
    }

    /// Non-cumulative count per bucket, overflow last
    #[must_use]
    pub fn bucket_counts(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }

    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} histogram", self.name);

        let counts = self.bucket_counts();
        let mut cumulative = 0;
        for (bound, count) in self.boundaries.iter().zip(&counts) {
            cumulative += count;
            let _ = writeln!(out, "{}_bucket{{le=\"{bound}\"}} {cumulative}", self.name);
        }
        cumulative += counts.last().copied().unwrap_or(0);
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {cumulative}", self.name);
        let _ = writeln!(out, "{}_sum {}", self.name, self.sum_ms());
        let _ = writeln!(out, "{}_count {}", self.name, self.count());
    }
}

/// Monotonic event counter
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    #[must_use]
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: usize) {
        self.value
            .fetch_add(u64::try_from(n).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} counter", self.name);
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Metrics for every session of one gateway
#[derive(Debug)]
pub struct Metrics {
    /// End of the user's utterance to the first audio segment sent
    pub pipeline: LatencyHistogram,
    /// Segmenter time per audio chunk
    pub vad: LatencyHistogram,
    pub asr: LatencyHistogram,
    /// Generation start to the first sentence
    pub llm: LatencyHistogram,
    /// Per-sentence synthesis
    pub tts: LatencyHistogram,
    pub audio_chunks: Counter,
    pub llm_fallbacks: Counter,
    pub segments_skipped: Counter,
    pub text_cues: Counter,
    pub turns_completed: Counter,
    pub turns_degraded: Counter,
    pub turns_failed: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            pipeline: LatencyHistogram::new(
                "companion_pipeline_latency_ms",
                "End of speech to first audio segment",
                PIPELINE_BUCKETS,
            ),
            vad: LatencyHistogram::new(
                "companion_vad_latency_ms",
                "Speech segmentation time per audio chunk",
                VAD_BUCKETS,
            ),
            asr: LatencyHistogram::new(
                "companion_asr_latency_ms",
                "Transcription time per utterance",
                ASR_BUCKETS,
            ),
            llm: LatencyHistogram::new(
                "companion_llm_first_sentence_ms",
                "Generation start to first sentence",
                LLM_BUCKETS,
            ),
            tts: LatencyHistogram::new(
                "companion_tts_latency_ms",
                "Synthesis time per sentence",
                TTS_BUCKETS,
            ),
            audio_chunks: Counter::new(
                "companion_audio_chunks_total",
                "Device audio chunks received",
            ),
            llm_fallbacks: Counter::new(
                "companion_llm_fallback_total",
                "Turns answered with the fallback response",
            ),
            segments_skipped: Counter::new(
                "companion_tts_skipped_total",
                "Sentences skipped after a synthesis failure",
            ),
            text_cues: Counter::new(
                "companion_text_cues_total",
                "Turns that ended with a text-only cue",
            ),
            turns_completed: Counter::new("companion_turns_completed_total", "Turns completed"),
            turns_degraded: Counter::new(
                "companion_turns_degraded_total",
                "Completed turns with a fallback, truncated or partial response",
            ),
            turns_failed: Counter::new("companion_turns_failed_total", "Turns that failed"),
        }
    }
}

impl Metrics {
    /// Count a finished turn by outcome
    pub fn record_turn(&self, turn: &Turn) {
        match turn.status {
            TurnStatus::Complete => {
                self.turns_completed.inc();
                if turn.degraded {
                    self.turns_degraded.inc();
                }
            }
            TurnStatus::Failed => self.turns_failed.inc(),
            TurnStatus::Pending | TurnStatus::Partial => {}
        }
    }

    /// Prometheus text exposition
    #[must_use]
    pub fn render(&self, active_sessions: usize) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# HELP companion_active_sessions Connected devices");
        let _ = writeln!(out, "# TYPE companion_active_sessions gauge");
        let _ = writeln!(out, "companion_active_sessions {active_sessions}");

        for histogram in [&self.pipeline, &self.vad, &self.asr, &self.llm, &self.tts] {
            histogram.render(&mut out);
        }
        for counter in [
            &self.audio_chunks,
            &self.llm_fallbacks,
            &self.segments_skipped,
            &self.text_cues,
            &self.turns_completed,
            &self.turns_degraded,
            &self.turns_failed,
        ] {
            counter.render(&mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Sentence, TriggerKind};

    #[test]
    fn test_observations_land_in_buckets() {
        let histogram = LatencyHistogram::new("t_ms", "test", &[10, 100]);
        histogram.observe(Duration::from_millis(3));
        histogram.observe(Duration::from_millis(10));
        histogram.observe(Duration::from_millis(40));
        histogram.observe(Duration::from_secs(2));

        assert_eq!(histogram.bucket_counts(), vec![2, 1, 1]);
        assert_eq!(histogram.count(), 4);
        assert_eq!(histogram.sum_ms(), 2053);
    }

    #[test]
    fn test_render_is_cumulative() {
        let histogram = LatencyHistogram::new("t_ms", "test", &[10, 100]);
        histogram.observe(Duration::from_millis(5));
        histogram.observe(Duration::from_millis(50));
        histogram.observe(Duration::from_millis(500));

        let mut out = String::new();
        histogram.render(&mut out);
        assert!(out.contains("# TYPE t_ms histogram"));
        assert!(out.contains("t_ms_bucket{le=\"10\"} 1\n"));
        assert!(out.contains("t_ms_bucket{le=\"100\"} 2\n"));
        assert!(out.contains("t_ms_bucket{le=\"+Inf\"} 3\n"));
        assert!(out.contains("t_ms_sum 555\n"));
        assert!(out.contains("t_ms_count 3\n"));
    }

    #[test]
    fn test_turn_outcomes_counted() {
        let metrics = Metrics::default();

        let mut clean = Turn::new(1, TriggerKind::UserSpeech);
        clean.append_sentence(Sentence::new("Hello.", 0, true));
        clean.finish(TurnStatus::Complete);
        metrics.record_turn(&clean);

        let mut fallback = Turn::new(2, TriggerKind::UserSpeech);
        fallback.append_sentence(Sentence::new("Sorry.", 0, true).mark_degraded());
        fallback.finish(TurnStatus::Complete);
        metrics.record_turn(&fallback);

        let mut failed = Turn::new(3, TriggerKind::UserSpeech);
        failed.finish(TurnStatus::Failed);
        metrics.record_turn(&failed);

        assert_eq!(metrics.turns_completed.get(), 2);
        assert_eq!(metrics.turns_degraded.get(), 1);
        assert_eq!(metrics.turns_failed.get(), 1);

        let text = metrics.render(1);
        assert!(text.contains("companion_active_sessions 1\n"));
        assert!(text.contains("companion_turns_degraded_total 1\n"));
        assert!(text.contains("companion_pipeline_latency_ms_bucket{le=\"5000\"} 0\n"));
    }
}
