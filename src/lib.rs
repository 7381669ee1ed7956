//! Companion Gateway - low-latency voice conversations for companion devices
//!
//! This library provides the core functionality for the companion gateway:
//! - Speech segmentation of a continuous device audio stream
//! - A per-session conversation state machine
//! - Streaming generation pipelined into sentence-level synthesis
//! - Proactive check-ins driven by declarative rules
//! - A persistent user profile, conversation history and learned facts
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Device (WebSocket /ws/{id})             │
//! └────────────────────┬────────────────────────────────┘
//!                      │ PCM in, speech out
//! ┌────────────────────▼────────────────────────────────┐
//! │                Session Coordinator                   │
//! │ Segmenter │ Machine │ STT │ LLM → Sentences │ TTS   │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │          Backends (HTTP)  │  Store (SQLite)          │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod backends;
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod voice;

pub use config::Config;
pub use daemon::Daemon;
pub use db::{DbConn, DbPool};
pub use error::{Error, Result};
pub use metrics::Metrics;
pub use pipeline::{SessionCoordinator, SessionHandle, Store};
