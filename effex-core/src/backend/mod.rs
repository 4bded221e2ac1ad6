//! Audio backend abstraction.
//!
//! The engine consumes hardware strictly through [`AudioBackend`] /
//! [`BackendStream`]: open a stream with a per-buffer cycle function and an
//! asynchronous error hook, then start/stop it. The cpal adapter
//! ([`CpalBackend`], feature `audio-cpal`) is the production implementation;
//! tests drive the engine with scripted backends that invoke the cycle
//! function deterministically.

#[cfg(feature = "audio-cpal")]
pub mod cpal;

#[cfg(feature = "audio-cpal")]
pub use self::cpal::CpalBackend;

use crate::engine::StreamConfig;
use crate::error::Result;

/// What the cycle function tells the backend after each buffer.
///
/// Mirrors the classic audio-callback contract: `Continue` keeps the
/// hardware callback firing, `Complete` means this was the last cycle and
/// the backend must not invoke the cycle function again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleControl {
    Continue,
    Complete,
}

/// Invoked by the backend on its audio thread, once per hardware buffer.
///
/// Arguments: capture samples (pre-filled by the backend; empty for
/// playback-only streams) and the playback buffer to fill (empty for
/// capture-only streams). Everything the implementation does must be
/// RT-safe.
pub type CycleFn = Box<dyn FnMut(&[f32], &mut [f32]) -> CycleControl + Send + 'static>;

/// Asynchronous error hook: called (from any backend thread) when the
/// stream fails out-of-band — device disconnect, fatal underrun, etc.
pub type ErrorFn = Box<dyn Fn(String) + Send + Sync + 'static>;

/// A backend capable of opening audio streams.
pub trait AudioBackend: Send {
    /// Cheap capability check used by `AudioEngine::open` before committing.
    fn supports(&self, config: &StreamConfig) -> bool;

    /// Open (but do not start) a stream. The backend takes ownership of the
    /// cycle function and must invoke it only from its audio thread.
    fn open_stream(
        &mut self,
        config: &StreamConfig,
        cycle: CycleFn,
        on_error: ErrorFn,
    ) -> Result<Box<dyn BackendStream>>;
}

/// One open backend stream.
pub trait BackendStream: Send {
    fn start(&mut self) -> Result<()>;

    /// Stop the hardware callback. After this returns, the cycle function
    /// will not be invoked again; an invocation already in flight completes
    /// first.
    fn stop(&mut self) -> Result<()>;
}
