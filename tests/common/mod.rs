//! Shared test utilities
#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use companion_gateway::backends::{LanguageModel, Synthesizer, TokenStream, Transcriber};
use companion_gateway::pipeline::{GenerationRequest, Transcript};
use companion_gateway::voice::{AudioChunk, SAMPLE_RATE};
use companion_gateway::{DbPool, Error, Result, Store, db};
use rand::Rng;

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Store over a fresh in-memory database
#[must_use]
pub fn setup_test_store() -> (DbPool, Store) {
    let pool = setup_test_db();
    let store = Store::new(&pool, "user-test");
    (pool, store)
}

/// Returns queued transcripts in order, then repeats the last one
pub struct ScriptedTranscriber {
    script: Mutex<VecDeque<Result<Transcript>>>,
    pub calls: AtomicUsize,
}

impl ScriptedTranscriber {
    pub fn new(script: Vec<Result<Transcript>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always(text: &str) -> Self {
        Self::new(vec![Ok(Transcript::new(text, 0.9))])
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn transcribe(&self, wav: &[u8]) -> Result<Transcript> {
        assert!(wav.starts_with(b"RIFF"), "transcriber expects WAV input");
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            return script.pop_front().unwrap();
        }
        match script.front() {
            Some(Ok(t)) => Ok(t.clone()),
            Some(Err(e)) => Err(Error::TranscriptionUnavailable(e.to_string())),
            None => Ok(Transcript::new("", 0.0)),
        }
    }
}

/// Streams a fixed token script, fails to open, or stalls
pub struct ScriptedModel {
    tokens: Vec<String>,
    fail_open: bool,
    /// Open after this long, then never yield a token
    stall_after: Option<Duration>,
    pub requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedModel {
    pub fn tokens(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(ToString::to_string).collect(),
            fail_open: false,
            stall_after: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            tokens: Vec::new(),
            fail_open: true,
            stall_after: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn stalled(open_delay: Duration) -> Self {
        Self {
            tokens: Vec::new(),
            fail_open: false,
            stall_after: Some(open_delay),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<TokenStream> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail_open {
            return Err(Error::GenerationUnavailable("connection refused".into()));
        }
        if let Some(delay) = self.stall_after {
            tokio::time::sleep(delay).await;
            return Ok(Box::pin(futures::stream::pending()));
        }
        let tokens: Vec<Result<String>> = self.tokens.iter().cloned().map(Ok).collect();
        Ok(Box::pin(futures::stream::iter(tokens)))
    }
}

/// Echoes the sentence text as "audio" after a random delay
pub struct JitterSynthesizer {
    min_delay_ms: u64,
    max_delay_ms: u64,
    failing: HashSet<String>,
    pub calls: AtomicUsize,
}

impl JitterSynthesizer {
    pub fn new(max_delay_ms: u64) -> Self {
        Self {
            min_delay_ms: 0,
            max_delay_ms,
            failing: HashSet::new(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Take at least this long per sentence
    #[must_use]
    pub fn at_least(mut self, min_delay_ms: u64) -> Self {
        self.min_delay_ms = min_delay_ms;
        self.max_delay_ms = self.max_delay_ms.max(min_delay_ms);
        self
    }

    /// Fail synthesis for sentences with exactly this text
    #[must_use]
    pub fn failing_on(mut self, text: &str) -> Self {
        self.failing.insert(text.to_string());
        self
    }
}

#[async_trait]
impl Synthesizer for JitterSynthesizer {
    fn name(&self) -> &'static str {
        "jitter"
    }

    async fn synthesize(&self, text: &str, _voice: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = rand::thread_rng().gen_range(self.min_delay_ms..=self.max_delay_ms);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        if self.failing.contains(text) {
            return Err(Error::SynthesisUnavailable(format!("cannot voice '{text}'")));
        }
        Ok(text.as_bytes().to_vec())
    }
}

/// 20 ms of 16 kHz audio
pub const CHUNK_SAMPLES: usize = SAMPLE_RATE as usize / 50;

/// Chunks of a loud tone followed by silence, numbered from `first_seq`
pub fn spoken_utterance(first_seq: u64, speech_ms: u64, silence_ms: u64) -> Vec<AudioChunk> {
    let speech = (speech_ms / 20) as usize;
    let silence = (silence_ms / 20) as usize;
    (0..speech + silence)
        .map(|i| {
            let samples = if i < speech { tone() } else { vec![0; CHUNK_SAMPLES] };
            AudioChunk::new(first_seq + i as u64, samples)
        })
        .collect()
}

/// One chunk of a 440 Hz tone at speech level
pub fn tone() -> Vec<i16> {
    (0..CHUNK_SAMPLES)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            (8000.0 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()) as i16
        })
        .collect()
}
