//! # effex-core
//!
//! Real-time audio callback engine with an asynchronous work queue.
//!
//! ## Architecture
//!
//! ```text
//! Hardware → AudioBackend → cycle driver → CallbackBridge → user callback
//!                               │                 │
//!                         ContinuationCode   SPSC rings (indirect path)
//!                               │                 │
//!                        AudioEngine state   relay thread
//!                               │
//!                    broadcast::Sender<EngineEvent>
//!
//! WorkQueue → worker pool → ResultChannel → poll / subscribe
//! ```
//!
//! The audio callback path is zero-alloc and lock-free. All heap work
//! happens on control threads, the relay thread, or the worker pool.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod backend;
pub mod bridge;
pub mod buffer;
pub mod engine;
pub mod error;
pub mod events;
pub mod source;
pub mod work;

// Convenience re-exports for downstream crates
pub use bridge::{BufferCallback, ContinuationCode, CycleInfo};
pub use engine::{
    AudioEngine, DiagnosticsSnapshot, Direction, StopPolicy, StreamConfig, StreamHandle,
    StreamState,
};
pub use error::{EffexError, Result};
pub use events::{EngineEvent, EngineEventKind, StopReason};
pub use source::{RateConverter, WavSource};
pub use work::{RandomWalk, ResultChannel, TaskId, WorkQueue, WorkQueueConfig, WorkTask, WorkUpdate};

#[cfg(feature = "audio-cpal")]
pub use backend::CpalBackend;
