//! Generation pipeliner
//!
//! Streams tokens from the language model and emits each sentence as soon as
//! its boundary is seen, so the first sentence reaches synthesis long before
//! the response is finished.
//!
//! A detected sentence is held only until more text starts arriving, which is
//! what tells us it is not the last one. The last sentence of every completed
//! run carries `is_final`.
//!
//! The first sentence, real or fallback, is always emitted within
//! [`GenerationConfig::first_sentence_budget`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::prompt::GenerationRequest;
use super::sentence::SentenceSplitter;
use super::types::Sentence;
use crate::backends::LanguageModel;
use crate::{Error, Result};

/// Pre-approved responses used when the model produces nothing
pub const FALLBACK_RESPONSES: &[&str] = &[
    "I'm here with you.",
    "I'm listening.",
    "Tell me more about that.",
    "I understand.",
    "That sounds important.",
];

/// Appended when a response is cut at the sentence limit
pub const CLOSING_SENTENCE: &str = "Let's talk more about that in a moment.";

/// Generation limits
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// One deadline for opening the stream and receiving its first token
    pub first_token_timeout: Duration,
    /// Wait between later tokens
    pub token_timeout: Duration,
    /// Sentences kept before the response is truncated
    pub max_sentences: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            first_token_timeout: Duration::from_secs(8),
            token_timeout: Duration::from_secs(4),
            max_sentences: 4,
        }
    }
}

impl GenerationConfig {
    /// Longest wait before the first sentence or the fallback is emitted
    ///
    /// The first token must arrive within `first_token_timeout`; after that
    /// the first sentence gets at most one more `token_timeout` to be sent.
    #[must_use]
    pub const fn first_sentence_budget(&self) -> Duration {
        self.first_token_timeout.saturating_add(self.token_timeout)
    }
}

/// How a generation run ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationOutcome {
    /// Sentences emitted, including fallback or closing sentences
    pub sentences: usize,
    /// Output is partial, truncated or a fallback
    pub degraded: bool,
    pub truncated: bool,
    /// A static fallback replaced the model's output
    pub fallback: bool,
    /// Stopped by the cancellation token; nothing more was emitted
    pub cancelled: bool,
    /// Backend failure that was absorbed, if any
    pub error: Option<String>,
}

/// Sends sentences with consecutive indices, holding back the newest one
struct Emitter<'a> {
    out: &'a mpsc::Sender<Sentence>,
    held: Option<String>,
    sent: usize,
    /// Mark the final sentence degraded
    degraded: bool,
}

impl Emitter<'_> {
    const fn count(&self) -> usize {
        self.sent + if self.held.is_some() { 1 } else { 0 }
    }

    async fn send(&mut self, text: String, is_final: bool) -> Result<()> {
        let mut sentence = Sentence::new(text, self.sent, is_final);
        if is_final && self.degraded {
            sentence = sentence.mark_degraded();
        }
        self.sent += 1;
        self.out
            .send(sentence)
            .await
            .map_err(|_| Error::BusClosed("synthesis"))
    }

    /// Hold a new sentence, releasing the previous one
    async fn offer(&mut self, text: String) -> Result<()> {
        self.release().await?;
        self.held = Some(text);
        Ok(())
    }

    /// Send the held sentence as non-final
    async fn release(&mut self) -> Result<()> {
        if let Some(text) = self.held.take() {
            self.send(text, false).await?;
        }
        Ok(())
    }

    /// Send `last` (or the held sentence if there is no `last`) as final
    async fn finish(&mut self, last: Option<String>) -> Result<()> {
        match last {
            Some(text) => {
                self.release().await?;
                self.send(text, true).await
            }
            None => match self.held.take() {
                Some(text) => self.send(text, true).await,
                None => Ok(()),
            },
        }
    }
}

/// Turns a model token stream into ordered sentences
pub struct GenerationPipeliner {
    model: Arc<dyn LanguageModel>,
    config: GenerationConfig,
    next_fallback: AtomicUsize,
}

impl GenerationPipeliner {
    /// Create a pipeliner over a model
    #[must_use]
    pub fn new(model: Arc<dyn LanguageModel>, config: GenerationConfig) -> Self {
        Self {
            model,
            config,
            next_fallback: AtomicUsize::new(0),
        }
    }

    /// Next static fallback, rotating through the set
    #[must_use]
    pub fn fallback_sentence(&self) -> &'static str {
        let i = self.next_fallback.fetch_add(1, Ordering::Relaxed);
        FALLBACK_RESPONSES[i % FALLBACK_RESPONSES.len()]
    }

    /// Run one request, sending sentences to `out` as they complete
    ///
    /// Backend failures are absorbed: partial output is kept and marked
    /// degraded, and a run that produced nothing emits a static fallback.
    /// Restarting means calling `run` again with the whole request.
    ///
    /// # Errors
    ///
    /// Returns `Error::BusClosed` if `out` is closed
    pub async fn run(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
        out: &mpsc::Sender<Sentence>,
    ) -> Result<GenerationOutcome> {
        let mut outcome = GenerationOutcome::default();
        let mut emitter = Emitter {
            out,
            held: None,
            sent: 0,
            degraded: false,
        };
        let mut splitter = SentenceSplitter::new();
        let mut failure: Option<Error> = None;
        let mut finished_cleanly = false;

        let started = Instant::now();
        let first_token_deadline = started + self.config.first_token_timeout;
        let first_sentence_deadline = started + self.config.first_sentence_budget();

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                outcome.cancelled = true;
                return Ok(outcome);
            }
            opened = tokio::time::timeout_at(
                first_token_deadline,
                self.model.generate(request),
            ) => opened,
        };

        match opened {
            Err(_) => failure = Some(Error::Timeout("generation")),
            Ok(Err(e)) => failure = Some(e),
            Ok(Ok(mut tokens)) => {
                let mut first = true;
                'stream: loop {
                    let deadline = if first {
                        first_token_deadline
                    } else if emitter.sent == 0 {
                        (Instant::now() + self.config.token_timeout).min(first_sentence_deadline)
                    } else {
                        Instant::now() + self.config.token_timeout
                    };

                    let next = tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            outcome.cancelled = true;
                            outcome.sentences = emitter.sent;
                            return Ok(outcome);
                        }
                        next = tokio::time::timeout_at(deadline, tokens.next()) => next,
                    };

                    match next {
                        Err(_) => {
                            failure = Some(Error::Timeout("generation"));
                            break;
                        }
                        Ok(None) => {
                            finished_cleanly = true;
                            break;
                        }
                        Ok(Some(Err(e))) => {
                            failure = Some(e);
                            break;
                        }
                        Ok(Some(Ok(token))) => {
                            first = false;
                            for sentence in splitter.push(&token) {
                                if emitter.count() >= self.config.max_sentences {
                                    outcome.truncated = true;
                                    break 'stream;
                                }
                                emitter.offer(sentence).await?;
                            }
                            if splitter.has_pending() {
                                emitter.release().await?;
                            }
                        }
                    }
                }
            }
        }

        if finished_cleanly {
            match splitter.finish() {
                Some(_) if emitter.count() >= self.config.max_sentences => {
                    outcome.truncated = true;
                }
                Some(rest) => emitter.finish(Some(rest)).await?,
                None if emitter.count() > 0 => emitter.finish(None).await?,
                None => {
                    failure = Some(Error::GenerationUnavailable("empty response".to_string()));
                }
            }
        }

        if outcome.truncated || failure.is_some() {
            emitter.degraded = true;
        }

        if outcome.truncated {
            tracing::debug!(
                max_sentences = self.config.max_sentences,
                "response truncated"
            );
            emitter.finish(Some(CLOSING_SENTENCE.to_string())).await?;
            outcome.degraded = true;
        } else if let Some(e) = failure {
            outcome.degraded = true;
            outcome.error = Some(e.to_string());

            if emitter.count() > 0 {
                tracing::warn!(
                    error = %e,
                    sentences = emitter.count(),
                    "generation failed mid-stream, keeping partial response"
                );
                if emitter.held.is_some() {
                    emitter.finish(None).await?;
                } else {
                    emitter.finish(Some(CLOSING_SENTENCE.to_string())).await?;
                }
            } else {
                let fallback = self.fallback_sentence();
                tracing::warn!(error = %e, fallback, "generation failed, using fallback response");
                emitter.finish(Some(fallback.to_string())).await?;
                outcome.fallback = true;
            }
        }

        outcome.sentences = emitter.sent;
        Ok(outcome)
    }

    /// Run on a background task, exposing sentences as a lazy ordered stream
    #[must_use]
    pub fn spawn(
        self: &Arc<Self>,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> (
        ReceiverStream<Sentence>,
        JoinHandle<Result<GenerationOutcome>>,
    ) {
        let (tx, rx) = mpsc::channel(8);
        let pipeliner = Arc::clone(self);
        let handle = tokio::spawn(async move { pipeliner.run(&request, &cancel, &tx).await });
        (ReceiverStream::new(rx), handle)
    }
}
