//! Preallocated audio buffer storage.
//!
//! Two pieces live here:
//!
//! - **Sample rings**: lock-free SPSC `ringbuf::HeapRb<f32>` pairs used for
//!   the real-time handoff. `push_slice`/`pop_slice` are wait-free and
//!   allocation-free, which is what lets the audio callback touch them.
//! - **[`FramePool`]**: a fixed set of preallocated [`AudioFrame`]s checked
//!   out by the relay stage and returned on drop. The pool never grows or
//!   shrinks while a stream is active, so nothing downstream of it allocates
//!   per cycle either.

use std::sync::Arc;

use parking_lot::Mutex;
use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Type alias for the producer half of a sample ring.
pub type SampleProducer = ringbuf::HeapProd<f32>;

/// Type alias for the consumer half of a sample ring.
pub type SampleConsumer = ringbuf::HeapCons<f32>;

/// Create a matched producer/consumer pair backed by a heap-allocated ring
/// buffer of `capacity` f32 samples. Allocation happens here, once, on the
/// control thread — never in the callback.
pub fn create_sample_ring(capacity: usize) -> (SampleProducer, SampleConsumer) {
    HeapRb::<f32>::new(capacity).split()
}

/// A fixed-length block of interleaved f32 samples moving through the engine.
///
/// Exclusively owned by whichever stage currently holds it (backend → bridge
/// → callback → backend); handed off, never shared.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Interleaved samples in [-1.0, 1.0]. Length = frames × channels.
    pub samples: Vec<f32>,
    /// Interleaved channel count.
    pub channels: u16,
    /// Monotonically increasing buffer-cycle index, assigned by the engine.
    pub index: u64,
}

impl AudioFrame {
    /// Allocate a zeroed frame. Called at pool construction, not per cycle.
    pub fn zeroed(frames: usize, channels: u16) -> Self {
        Self {
            samples: vec![0.0; frames * channels as usize],
            channels,
            index: 0,
        }
    }

    /// Number of frames (sample groups), not samples.
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Zero every sample without changing the length.
    pub fn silence(&mut self) {
        self.samples.fill(0.0);
    }
}

struct PoolInner {
    frames: Mutex<Vec<AudioFrame>>,
    capacity: usize,
}

/// Fixed-capacity pool of preallocated [`AudioFrame`]s.
///
/// Checkout hands exclusive ownership to the caller; dropping the guard
/// returns the frame. When all slots are out, `checkout` returns `None`
/// rather than allocating — the invariant is that the pool's footprint is
/// fixed for the lifetime of a stream.
///
/// Lock scope is a handful of instructions on the relay/control side; the
/// real-time thread never touches the pool.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    /// Preallocate `capacity` frames of `frames × channels` samples each.
    pub fn new(capacity: usize, frames: usize, channels: u16) -> Self {
        let slots = (0..capacity)
            .map(|_| AudioFrame::zeroed(frames, channels))
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                frames: Mutex::new(slots),
                capacity,
            }),
        }
    }

    /// Check out a frame, or `None` if every slot is already out.
    pub fn checkout(&self) -> Option<PooledFrame> {
        let frame = self.inner.frames.lock().pop()?;
        Some(PooledFrame {
            frame: Some(frame),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Slots currently available for checkout.
    pub fn available(&self) -> usize {
        self.inner.frames.lock().len()
    }

    /// Total slots, fixed at construction.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// RAII guard for a checked-out frame. Returns the frame on drop.
pub struct PooledFrame {
    frame: Option<AudioFrame>,
    pool: Arc<PoolInner>,
}

impl std::ops::Deref for PooledFrame {
    type Target = AudioFrame;

    fn deref(&self) -> &AudioFrame {
        self.frame.as_ref().expect("frame present until drop")
    }
}

impl std::ops::DerefMut for PooledFrame {
    fn deref_mut(&mut self) -> &mut AudioFrame {
        self.frame.as_mut().expect("frame present until drop")
    }
}

impl Drop for PooledFrame {
    fn drop(&mut self) {
        if let Some(mut frame) = self.frame.take() {
            frame.silence();
            frame.index = 0;
            self.pool.frames.lock().push(frame);
        }
    }
}
