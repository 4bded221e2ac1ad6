//! Relay thread for indirect callbacks.
//!
//! The relay is the control-domain half of the indirect path: it receives a
//! notification per buffer cycle, pops the captured samples out of the SPSC
//! ring into a pooled frame, runs the user callback, and publishes the
//! processed samples plus the callback's [`ContinuationCode`] for the audio
//! thread to pick up on its *next* cycle.
//!
//! The relay exits when the notify channel disconnects (callback swapped out
//! or stream torn down) or when the user callback panics. It never blocks
//! the audio thread: all shared state is a pair of SPSC rings and two
//! atomics.

use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::buffer::{create_sample_ring, Consumer, FramePool, Producer, SampleConsumer, SampleProducer};

use super::{
    BridgeConfig, BridgeDiagnostics, BridgeNotice, CallbackFn, ContinuationCode, CycleInfo,
    DispatchGate,
};

/// Audio-thread-side handle to a running relay.
pub struct IndirectLink {
    /// Capture samples flow RT → relay.
    pub(super) capture_prod: SampleProducer,
    /// Processed samples flow relay → RT.
    pub(super) playback_cons: SampleConsumer,
    /// Cycle notifications, bounded to `ring_depth`.
    pub(super) notify_tx: Sender<CycleInfo>,
    /// Bounds the dispatch-side wait for the previous cycle's result.
    pub(super) buffer_period: Duration,
    /// False until the first dispatch; the first cycle has no previous
    /// result to wait for, so it plays silence unconditionally.
    pub(super) primed: bool,
    code: Arc<AtomicU8>,
    parked: Arc<AtomicBool>,
}

impl IndirectLink {
    /// Build the rings, pool, and relay thread for `callback`.
    ///
    /// Called on the control thread (allocation happens here); the returned
    /// link is handed to the audio side through the install queue.
    pub(super) fn spawn(
        callback: CallbackFn,
        config: BridgeConfig,
        notice_tx: Sender<BridgeNotice>,
        diagnostics: Arc<BridgeDiagnostics>,
        gate: Arc<DispatchGate>,
    ) -> Self {
        let samples = config.samples_per_cycle();
        let ring_capacity = samples * config.ring_depth.max(1);

        let (capture_prod, capture_cons) = create_sample_ring(ring_capacity);
        let (playback_prod, playback_cons) = create_sample_ring(ring_capacity);
        let (notify_tx, notify_rx) = crossbeam_channel::bounded(config.ring_depth.max(1));

        let code = Arc::new(AtomicU8::new(ContinuationCode::Continue.as_u8()));
        let parked = Arc::new(AtomicBool::new(false));

        // One slot for the capture frame, one for the playback frame.
        let pool = FramePool::new(2, config.frames_per_buffer, config.channels);

        let worker = RelayWorker {
            callback,
            capture_cons,
            playback_prod,
            pool,
            samples_per_cycle: samples,
            code: Arc::clone(&code),
            parked: Arc::clone(&parked),
            notice_tx,
            diagnostics,
            gate,
        };

        // Detached: the loop exits as soon as notify_tx disconnects, which
        // happens when this link is dropped (swap or teardown).
        std::thread::Builder::new()
            .name("effex-relay".into())
            .spawn(move || worker.run(notify_rx))
            .expect("spawn relay thread");

        Self {
            capture_prod,
            playback_cons,
            notify_tx,
            buffer_period: config.buffer_period,
            primed: false,
            code,
            parked,
        }
    }

    /// The relay's most recently published continuation code.
    pub(super) fn latest_code(&self) -> ContinuationCode {
        ContinuationCode::from_u8(self.code.load(Ordering::Acquire))
    }

    /// `true` once the relay loop has exited (fault or teardown); the
    /// dispatch-side wait gives up immediately in that case.
    pub(super) fn relay_parked(&self) -> bool {
        self.parked.load(Ordering::Acquire)
    }
}

struct RelayWorker {
    callback: CallbackFn,
    capture_cons: SampleConsumer,
    playback_prod: SampleProducer,
    pool: FramePool,
    samples_per_cycle: usize,
    code: Arc<AtomicU8>,
    parked: Arc<AtomicBool>,
    notice_tx: Sender<BridgeNotice>,
    diagnostics: Arc<BridgeDiagnostics>,
    gate: Arc<DispatchGate>,
}

impl RelayWorker {
    fn run(mut self, notify_rx: crossbeam_channel::Receiver<CycleInfo>) {
        debug!(samples_per_cycle = self.samples_per_cycle, "relay started");

        loop {
            let info = match notify_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(info) => info,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let (Some(mut capture), Some(mut playback)) =
                (self.pool.checkout(), self.pool.checkout())
            else {
                // Cannot happen with a 2-slot pool and sequential cycles,
                // but skipping a cycle beats blocking anything.
                warn!("relay frame pool exhausted — skipping cycle");
                continue;
            };

            capture.index = info.frame_index;
            let got = self.capture_cons.pop_slice(&mut capture.samples);
            if got < capture.samples.len() {
                // Partial capture after an overrun; the tail stays silent.
                capture.samples[got..].fill(0.0);
            }

            playback.silence();
            playback.index = info.frame_index;

            // The gate closes during stop(); a cycle that was queued before
            // the stop is dropped rather than invoked.
            if !self.gate.enter() {
                continue;
            }
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                (self.callback)(&info, &capture.samples, &mut playback.samples)
            }));
            self.gate.exit();

            match outcome {
                Ok(code) => {
                    let pushed = self.playback_prod.push_slice(&playback.samples);
                    if pushed < playback.samples.len() {
                        // Audio side stopped draining; drop the excess rather
                        // than wait.
                        debug!(
                            dropped = playback.samples.len() - pushed,
                            "playback ring full"
                        );
                    }
                    self.code.store(code.as_u8(), Ordering::Release);
                    if code.is_halt() {
                        debug!(?code, frame_index = info.frame_index, "relay observed halt");
                    }
                }
                Err(payload) => {
                    self.diagnostics.faults.fetch_add(1, Ordering::Relaxed);
                    self.code
                        .store(ContinuationCode::AbortImmediately.as_u8(), Ordering::Release);
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_owned())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_owned());
                    warn!(message = %message, "indirect callback panicked — aborting stream");
                    let _ = self.notice_tx.try_send(BridgeNotice::Fault(message));
                    break;
                }
            }
        }

        self.parked.store(true, Ordering::Release);
        debug!("relay exited");
    }
}
