//! Callback bridge between the real-time audio thread and control code.
//!
//! # Design constraints
//!
//! `dispatch` runs on the backend's audio thread at elevated priority. It
//! **must not**:
//! - Allocate heap memory
//! - Block on a mutex or condvar
//! - Perform I/O (including logging)
//!
//! Two callback flavours exist:
//!
//! - **Direct**: pure per-buffer computation, safe to run inline on the audio
//!   thread. Invoked synchronously; its return value is the cycle's
//!   [`ContinuationCode`].
//! - **Indirect**: must run on a normal (control-domain) thread — it touches
//!   state the audio thread cannot. `dispatch` pushes the capture buffer into
//!   a pre-reserved SPSC ring slot, publishes a notification, and pops the
//!   *previous* cycle's playback result (silence when none is ready yet).
//!   This trades one buffer period of latency for never blocking the audio
//!   thread on control code.
//!
//! Installing a callback while a stream runs is queued through a lock-free
//! channel and applied only between buffer cycles, so an in-flight buffer
//! always completes against a single consistent callback.
//!
//! A panic inside a user callback is caught at the dispatch boundary,
//! converted to an automatic `AbortImmediately`, and reported once as a
//! `CallbackFault` — it never unwinds into the audio thread's stack.

pub mod relay;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::buffer::{Consumer, Observer, Producer};
use relay::IndirectLink;

/// Enumerated outcome of one callback invocation. Drives the engine's next
/// action at the buffer boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContinuationCode {
    /// Keep the stream running.
    #[default]
    Continue,
    /// Complete this buffer normally, then halt the stream.
    StopAfterBuffer,
    /// Halt now; the remainder of the current playback buffer is silenced.
    AbortImmediately,
}

impl ContinuationCode {
    /// `true` for any non-`Continue` code.
    pub fn is_halt(self) -> bool {
        self != ContinuationCode::Continue
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ContinuationCode::Continue => 0,
            ContinuationCode::StopAfterBuffer => 1,
            ContinuationCode::AbortImmediately => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => ContinuationCode::StopAfterBuffer,
            2 => ContinuationCode::AbortImmediately,
            _ => ContinuationCode::Continue,
        }
    }
}

/// Per-cycle metadata handed to callbacks.
#[derive(Debug, Clone, Copy)]
pub struct CycleInfo {
    /// Strictly increasing frame index: cycle k starts at
    /// `k * frames_per_buffer`.
    pub frame_index: u64,
    /// Time since the stream started.
    pub timestamp: Duration,
}

/// The per-buffer processing function supplied by the caller.
///
/// Arguments: cycle metadata, capture buffer (interleaved, read-only),
/// playback buffer (interleaved, to be filled). Returns the continuation
/// code for this cycle.
pub type CallbackFn =
    Box<dyn FnMut(&CycleInfo, &[f32], &mut [f32]) -> ContinuationCode + Send + 'static>;

/// User-facing callback descriptor passed to `AudioEngine::start` /
/// `CallbackInstaller::install`.
pub enum BufferCallback {
    /// Runs inline on the audio thread. Must be RT-safe itself.
    Direct(CallbackFn),
    /// Runs on a dedicated relay thread; the audio thread only exchanges
    /// ring-buffered samples with it.
    Indirect(CallbackFn),
}

impl BufferCallback {
    pub fn direct(
        f: impl FnMut(&CycleInfo, &[f32], &mut [f32]) -> ContinuationCode + Send + 'static,
    ) -> Self {
        BufferCallback::Direct(Box::new(f))
    }

    pub fn indirect(
        f: impl FnMut(&CycleInfo, &[f32], &mut [f32]) -> ContinuationCode + Send + 'static,
    ) -> Self {
        BufferCallback::Indirect(Box::new(f))
    }
}

/// Out-of-band notices raised from the dispatch path or the relay.
///
/// Carried on a small bounded channel (preallocated, `try_send` only) so the
/// audio thread can report without blocking; the engine's event pump turns
/// them into [`crate::events::EngineEvent`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeNotice {
    /// A user callback panicked; message is the panic payload if printable.
    Fault(String),
    /// Capture samples were dropped because the indirect ring was full.
    Overrun(usize),
}

/// Shared counters for observability. Written with relaxed atomics from
/// whichever side observes the condition.
#[derive(Default)]
pub struct BridgeDiagnostics {
    /// Capture samples dropped on the indirect path.
    pub overrun_samples: AtomicUsize,
    /// Playback samples substituted with silence on the indirect path.
    pub underrun_samples: AtomicUsize,
    /// Callback panics caught at the dispatch boundary.
    pub faults: AtomicUsize,
}

/// Gate consulted by the relay before every user-callback invocation.
///
/// `AudioEngine::stop` disables the gate and then waits for `busy` to reach
/// zero, which is what makes "no callback invocation after stop() returns"
/// hold on the indirect path too: the relay increments `busy` *before*
/// checking `enabled`, so any invocation that proceeds is visible to the
/// stop-side wait.
#[derive(Default)]
pub struct DispatchGate {
    enabled: AtomicBool,
    busy: AtomicUsize,
}

impl DispatchGate {
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Invocations currently in flight behind the gate.
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Try to enter the gate. Returns `false` (without entering) when the
    /// gate is disabled; the caller must call [`DispatchGate::exit`] after a
    /// successful entry.
    pub(crate) fn enter(&self) -> bool {
        self.busy.fetch_add(1, Ordering::SeqCst);
        if self.enabled.load(Ordering::SeqCst) {
            true
        } else {
            self.busy.fetch_sub(1, Ordering::SeqCst);
            false
        }
    }

    pub(crate) fn exit(&self) {
        self.busy.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Sizing and timing parameters for the indirect path, derived from the
/// stream config by the engine.
#[derive(Debug, Clone, Copy)]
pub struct BridgeConfig {
    pub frames_per_buffer: usize,
    pub channels: u16,
    /// Hardware buffer period; bounds the dispatch-side wait for the
    /// previous cycle's playback result.
    pub buffer_period: Duration,
    /// In-flight buffers each indirect ring can hold.
    pub ring_depth: usize,
}

impl BridgeConfig {
    /// Interleaved samples exchanged per cycle.
    pub fn samples_per_cycle(&self) -> usize {
        self.frames_per_buffer * self.channels as usize
    }
}

/// Capacity of the notice channel. Notices are rare (faults, overruns); if
/// the pump falls this far behind, dropping further notices is acceptable.
const NOTICE_CAP: usize = 16;

enum Installed {
    Direct { cb: CallbackFn, faulted: bool },
    Indirect(IndirectLink),
}

/// Control-side handle for installing callbacks.
///
/// Builds the full indirect plumbing (rings, relay thread) here on the
/// control thread, then hands the finished installation to the audio side
/// through a lock-free channel. The audio side only ever swaps a pointer.
pub struct CallbackInstaller {
    pending_tx: Sender<Installed>,
    config: BridgeConfig,
    notice_tx: Sender<BridgeNotice>,
    diagnostics: Arc<BridgeDiagnostics>,
    gate: Arc<DispatchGate>,
}

impl CallbackInstaller {
    /// Queue `callback` for installation at the next buffer boundary.
    ///
    /// Never blocks; the swap takes effect between cycles, never mid-cycle.
    pub fn install(&self, callback: BufferCallback) {
        let installed = match callback {
            BufferCallback::Direct(cb) => Installed::Direct { cb, faulted: false },
            BufferCallback::Indirect(cb) => Installed::Indirect(IndirectLink::spawn(
                cb,
                self.config,
                self.notice_tx.clone(),
                Arc::clone(&self.diagnostics),
                Arc::clone(&self.gate),
            )),
        };
        // Unbounded: installs come from the control thread, which may
        // allocate. The RT side only try_recv()s.
        let _ = self.pending_tx.send(installed);
    }

    pub fn diagnostics(&self) -> Arc<BridgeDiagnostics> {
        Arc::clone(&self.diagnostics)
    }

    /// The gate shared with every relay this installer spawns.
    pub fn gate(&self) -> Arc<DispatchGate> {
        Arc::clone(&self.gate)
    }
}

/// Audio-thread side of the bridge. Owned by the engine's cycle driver.
pub struct CallbackBridge {
    installed: Option<Installed>,
    pending_rx: Receiver<Installed>,
    notice_tx: Sender<BridgeNotice>,
    diagnostics: Arc<BridgeDiagnostics>,
}

/// Create a matched installer/bridge pair plus the notice receiver the
/// engine's event pump drains.
pub fn channel(config: BridgeConfig) -> (CallbackInstaller, CallbackBridge, Receiver<BridgeNotice>) {
    let (pending_tx, pending_rx) = crossbeam_channel::unbounded();
    let (notice_tx, notice_rx) = crossbeam_channel::bounded(NOTICE_CAP);
    let diagnostics = Arc::new(BridgeDiagnostics::default());
    let gate = Arc::new(DispatchGate::default());
    gate.enable();

    let installer = CallbackInstaller {
        pending_tx,
        config,
        notice_tx: notice_tx.clone(),
        diagnostics: Arc::clone(&diagnostics),
        gate,
    };
    let bridge = CallbackBridge {
        installed: None,
        pending_rx,
        notice_tx,
        diagnostics,
    };
    (installer, bridge, notice_rx)
}

impl CallbackBridge {
    /// Apply any queued callback swap. Called by the cycle driver at the top
    /// of each buffer cycle, never mid-cycle. `try_recv` on a crossbeam
    /// channel is lock-free.
    pub fn apply_pending(&mut self) {
        while let Ok(installed) = self.pending_rx.try_recv() {
            // Dropping the previous Installed tears down its relay (if any)
            // by disconnecting the notify channel.
            self.installed = Some(installed);
        }
    }

    /// `true` once a callback has been installed.
    pub fn has_callback(&self) -> bool {
        self.installed.is_some()
    }

    /// Invoke the installed callback for one buffer cycle.
    ///
    /// Audio-thread only. Returns `Continue` when nothing is installed (the
    /// engine refuses to start without a callback; this covers the window
    /// right after an abort).
    pub fn dispatch(
        &mut self,
        info: &CycleInfo,
        capture: &[f32],
        playback: &mut [f32],
    ) -> ContinuationCode {
        match self.installed {
            None => ContinuationCode::Continue,
            Some(Installed::Direct {
                ref mut cb,
                ref mut faulted,
            }) => {
                if *faulted {
                    // A faulted callback is never re-invoked; keep signalling
                    // the abort until the engine halts the stream.
                    playback.fill(0.0);
                    return ContinuationCode::AbortImmediately;
                }
                match catch_unwind(AssertUnwindSafe(|| cb(info, capture, playback))) {
                    Ok(code) => code,
                    Err(payload) => {
                        *faulted = true;
                        self.diagnostics.faults.fetch_add(1, Ordering::Relaxed);
                        report_fault(&self.notice_tx, payload);
                        playback.fill(0.0);
                        ContinuationCode::AbortImmediately
                    }
                }
            }
            Some(Installed::Indirect(ref mut link)) => {
                // 1. Publish capture samples into the pre-reserved ring slot.
                let pushed = link.capture_prod.push_slice(capture);
                if pushed < capture.len() {
                    let dropped = capture.len() - pushed;
                    self.diagnostics
                        .overrun_samples
                        .fetch_add(dropped, Ordering::Relaxed);
                    let _ = self.notice_tx.try_send(BridgeNotice::Overrun(dropped));
                }

                // 2. Notify the relay. A full queue means the relay is a full
                //    ring_depth behind; the overrun accounting above already
                //    covers the fallout.
                match link.notify_tx.try_send(*info) {
                    Ok(()) | Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Disconnected(_)) => {
                        // Relay died (callback fault); its last published
                        // code below will be AbortImmediately.
                    }
                }

                // 3. The very first cycle has no previous result to wait
                //    for; it plays silence by construction (the one-period
                //    latency trade). Later cycles busy-free-wait, bounded by
                //    one buffer period, for the previous cycle's playback
                //    result. Spin hint only — no blocking primitive is ever
                //    taken here.
                if !link.primed {
                    link.primed = true;
                    playback.fill(0.0);
                    return link.latest_code();
                }

                let needed = playback.len();
                let deadline = std::time::Instant::now() + link.buffer_period;
                while link.playback_cons.occupied_len() < needed
                    && std::time::Instant::now() < deadline
                    && !link.relay_parked()
                {
                    std::hint::spin_loop();
                }

                let got = link.playback_cons.pop_slice(playback);
                if got < needed {
                    playback[got..].fill(0.0);
                    self.diagnostics
                        .underrun_samples
                        .fetch_add(needed - got, Ordering::Relaxed);
                }

                // 4. Return the relay's most recently published code.
                link.latest_code()
            }
        }
    }
}

fn report_fault(notice_tx: &Sender<BridgeNotice>, payload: Box<dyn std::any::Any + Send>) {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned());
    let _ = notice_tx.try_send(BridgeNotice::Fault(message));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn test_config() -> BridgeConfig {
        BridgeConfig {
            frames_per_buffer: 4,
            channels: 1,
            buffer_period: Duration::from_millis(20),
            ring_depth: 4,
        }
    }

    fn info(cycle: u64) -> CycleInfo {
        CycleInfo {
            frame_index: cycle * 4,
            timestamp: Duration::from_millis(cycle),
        }
    }

    #[test]
    fn direct_callback_runs_inline_and_returns_its_code() {
        let (installer, mut bridge, _notices) = channel(test_config());
        installer.install(BufferCallback::direct(|_, capture, playback| {
            playback.copy_from_slice(capture);
            ContinuationCode::Continue
        }));
        bridge.apply_pending();
        assert!(bridge.has_callback());

        let capture = [0.1, 0.2, 0.3, 0.4];
        let mut playback = [0.0; 4];
        let code = bridge.dispatch(&info(0), &capture, &mut playback);
        assert_eq!(code, ContinuationCode::Continue);
        assert_eq!(playback, capture);
    }

    #[test]
    fn install_is_deferred_until_apply_pending() {
        let (installer, mut bridge, _notices) = channel(test_config());
        installer.install(BufferCallback::direct(|_, _, _| ContinuationCode::Continue));
        assert!(!bridge.has_callback(), "swap must wait for a cycle boundary");
        bridge.apply_pending();
        assert!(bridge.has_callback());
    }

    #[test]
    fn latest_queued_install_wins_at_the_boundary() {
        let (installer, mut bridge, _notices) = channel(test_config());
        installer.install(BufferCallback::direct(|_, _, playback: &mut [f32]| {
            playback.fill(1.0);
            ContinuationCode::Continue
        }));
        installer.install(BufferCallback::direct(|_, _, playback: &mut [f32]| {
            playback.fill(2.0);
            ContinuationCode::Continue
        }));
        bridge.apply_pending();

        let mut playback = [0.0; 4];
        bridge.dispatch(&info(0), &[0.0; 4], &mut playback);
        assert_eq!(playback, [2.0; 4]);
    }

    #[test]
    fn panicking_direct_callback_becomes_abort_and_fault_notice() {
        let (installer, mut bridge, notices) = channel(test_config());
        installer.install(BufferCallback::direct(|_, _, _| {
            panic!("boom in user code");
        }));
        bridge.apply_pending();

        let mut playback = [0.5; 4];
        let code = bridge.dispatch(&info(0), &[0.0; 4], &mut playback);
        assert_eq!(code, ContinuationCode::AbortImmediately);
        assert_eq!(playback, [0.0; 4], "playback silenced on fault");

        match notices.try_recv() {
            Ok(BridgeNotice::Fault(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected fault notice, got {other:?}"),
        }

        // The faulted callback must never run again.
        let code = bridge.dispatch(&info(1), &[0.0; 4], &mut playback);
        assert_eq!(code, ContinuationCode::AbortImmediately);
        assert_eq!(notices.try_recv().ok(), None, "fault reported only once");
    }

    #[test]
    fn indirect_path_delivers_previous_cycle_with_one_period_latency() {
        let (installer, mut bridge, _notices) = channel(test_config());
        installer.install(BufferCallback::indirect(|_, capture, playback| {
            playback.copy_from_slice(capture);
            ContinuationCode::Continue
        }));
        bridge.apply_pending();

        let mut playback = [9.0f32; 4];
        // Cycle 0: no previous result exists — silence is substituted.
        let code = bridge.dispatch(&info(0), &[0.1, 0.2, 0.3, 0.4], &mut playback);
        assert_eq!(code, ContinuationCode::Continue);

        // Give the relay a moment, then cycle 1 must replay cycle 0's input.
        thread::sleep(Duration::from_millis(30));
        let code = bridge.dispatch(&info(1), &[0.5; 4], &mut playback);
        assert_eq!(code, ContinuationCode::Continue);
        assert_eq!(playback, [0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn indirect_halt_code_is_honored_at_a_later_boundary() {
        let (installer, mut bridge, _notices) = channel(test_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = Arc::clone(&calls);
        installer.install(BufferCallback::indirect(move |_, _, _| {
            calls_cb.fetch_add(1, Ordering::SeqCst);
            ContinuationCode::StopAfterBuffer
        }));
        bridge.apply_pending();

        let mut playback = [0.0f32; 4];
        bridge.dispatch(&info(0), &[0.0; 4], &mut playback);
        thread::sleep(Duration::from_millis(30));
        let code = bridge.dispatch(&info(1), &[0.0; 4], &mut playback);
        assert_eq!(code, ContinuationCode::StopAfterBuffer);
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn panicking_indirect_callback_aborts_via_published_code() {
        let (installer, mut bridge, notices) = channel(test_config());
        installer.install(BufferCallback::indirect(|_, _, _| {
            panic!("indirect boom");
        }));
        bridge.apply_pending();

        let mut playback = [0.0f32; 4];
        bridge.dispatch(&info(0), &[0.0; 4], &mut playback);
        thread::sleep(Duration::from_millis(30));
        let code = bridge.dispatch(&info(1), &[0.0; 4], &mut playback);
        assert_eq!(code, ContinuationCode::AbortImmediately);

        let notice = notices
            .recv_timeout(Duration::from_millis(200))
            .expect("fault notice");
        assert!(matches!(notice, BridgeNotice::Fault(_)));
    }

    #[test]
    fn continuation_code_round_trips_through_u8() {
        for code in [
            ContinuationCode::Continue,
            ContinuationCode::StopAfterBuffer,
            ContinuationCode::AbortImmediately,
        ] {
            assert_eq!(ContinuationCode::from_u8(code.as_u8()), code);
        }
    }
}
