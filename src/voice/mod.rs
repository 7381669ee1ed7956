//! Voice processing module
//!
//! Turns the device's continuous audio stream into discrete utterances.
//! Transcription, generation and synthesis live behind the backend traits
//! (see `backends`).

mod activity;
mod segmenter;
mod wav;

pub use activity::{ActivityModel, EnergyModel, rms};
pub use segmenter::{AudioChunk, SegmentEvent, Segmenter, SegmenterConfig, Utterance};
pub use wav::{SAMPLE_RATE, pcm_from_le_bytes, pcm_to_le_bytes, samples_to_wav, wav_to_samples};
