//! Session bus
//!
//! Ordered, per-session, per-topic delivery between pipeline stages. Each
//! topic is a bounded channel: a publisher waits when its consumer falls
//! behind instead of buffering without limit.
//!
//! Delivery is at-least-once. Every envelope carries the session id, the turn
//! id, the producing stage and a sequence number that is strictly increasing
//! per producer. Subscribers track a high-water mark per producer and drop
//! anything at or below it, so redelivered envelopes are never seen twice.

use std::collections::HashMap;

use tokio::sync::mpsc;

use super::types::TurnId;
use crate::{Error, Result};

/// Logical pipeline topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Device audio chunks into the segmenter
    Audio,
    /// Events into the conversation machine
    Orchestration,
    /// Utterances awaiting transcription
    Transcription,
    /// Generation requests
    Generation,
    /// Sentences and cues awaiting synthesis
    Synthesis,
}

impl Topic {
    /// Topic name used in logs and errors
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Orchestration => "orchestration",
            Self::Transcription => "transcription",
            Self::Generation => "generation",
            Self::Synthesis => "synthesis",
        }
    }
}

/// A message on the bus
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub session_id: String,
    pub turn_id: TurnId,
    pub topic: Topic,
    /// Stage that published the message
    pub producer: &'static str,
    /// Strictly increasing per producer, starting at 1
    pub seq: u64,
    pub payload: T,
}

/// Sending half of a topic, owned by one producing stage
#[derive(Debug)]
pub struct Publisher<T> {
    session_id: String,
    topic: Topic,
    producer: &'static str,
    next_seq: u64,
    tx: mpsc::Sender<Envelope<T>>,
}

impl<T> Publisher<T> {
    /// Publish a payload, waiting for capacity if the consumer is behind
    ///
    /// # Errors
    ///
    /// Returns `Error::BusClosed` if the subscriber has been dropped
    pub async fn publish(&mut self, turn_id: TurnId, payload: T) -> Result<u64> {
        self.next_seq += 1;
        let envelope = Envelope {
            session_id: self.session_id.clone(),
            turn_id,
            topic: self.topic,
            producer: self.producer,
            seq: self.next_seq,
            payload,
        };

        self.tx
            .send(envelope)
            .await
            .map_err(|_| Error::BusClosed(self.topic.as_str()))?;

        Ok(self.next_seq)
    }

    /// Send an already-published envelope again
    ///
    /// # Errors
    ///
    /// Returns `Error::BusClosed` if the subscriber has been dropped
    pub async fn redeliver(&self, envelope: Envelope<T>) -> Result<()> {
        tracing::debug!(
            topic = self.topic.as_str(),
            producer = envelope.producer,
            seq = envelope.seq,
            "redelivering envelope"
        );
        self.tx
            .send(envelope)
            .await
            .map_err(|_| Error::BusClosed(self.topic.as_str()))
    }

    /// Another publisher on the same topic with its own producer name and sequence
    ///
    /// Producer names must be unique per topic.
    #[must_use]
    pub fn fork(&self, producer: &'static str) -> Self {
        Self {
            session_id: self.session_id.clone(),
            topic: self.topic,
            producer,
            next_seq: 0,
            tx: self.tx.clone(),
        }
    }

    /// Whether the subscriber is gone
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Sequence number of the last published envelope
    #[must_use]
    pub const fn last_seq(&self) -> u64 {
        self.next_seq
    }

    /// Topic this publisher writes to
    #[must_use]
    pub const fn topic(&self) -> Topic {
        self.topic
    }
}

/// Receiving half of a topic, owned by the consuming stage
#[derive(Debug)]
pub struct Subscriber<T> {
    topic: Topic,
    rx: mpsc::Receiver<Envelope<T>>,
    high_water: HashMap<&'static str, u64>,
    duplicates: u64,
}

impl<T> Subscriber<T> {
    /// Next unseen envelope; `None` once every publisher is dropped
    pub async fn recv(&mut self) -> Option<Envelope<T>> {
        loop {
            let envelope = self.rx.recv().await?;
            if self.accept(&envelope) {
                return Some(envelope);
            }
        }
    }

    /// Record an envelope, returning `false` for duplicates
    fn accept(&mut self, envelope: &Envelope<T>) -> bool {
        let last = self.high_water.entry(envelope.producer).or_insert(0);
        if envelope.seq <= *last {
            self.duplicates += 1;
            tracing::debug!(
                topic = self.topic.as_str(),
                session_id = %envelope.session_id,
                turn_id = envelope.turn_id,
                producer = envelope.producer,
                seq = envelope.seq,
                "dropping duplicate envelope"
            );
            return false;
        }
        *last = envelope.seq;
        true
    }

    /// Number of duplicate envelopes dropped so far
    #[must_use]
    pub const fn duplicates_dropped(&self) -> u64 {
        self.duplicates
    }

    /// Close the topic; publishers fail from now on
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Open a topic for a session
///
/// `capacity` bounds how many envelopes may wait for the consumer.
#[must_use]
pub fn topic<T>(
    session_id: &str,
    topic: Topic,
    producer: &'static str,
    capacity: usize,
) -> (Publisher<T>, Subscriber<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        Publisher {
            session_id: session_id.to_string(),
            topic,
            producer,
            next_seq: 0,
            tx,
        },
        Subscriber {
            topic,
            rx,
            high_water: HashMap::new(),
            duplicates: 0,
        },
    )
}
