//! Stream lifecycle and the per-buffer cycle driver.
//!
//! ```text
//!  control thread                         audio thread (backend-owned)
//!  ──────────────                         ────────────────────────────
//!  AudioEngine::open ──► backend.open_stream(cycle driver)
//!  AudioEngine::start ─► backend.start ──► driver: apply_pending
//!                                                  bridge.dispatch
//!                                                  act on ContinuationCode
//!  AudioEngine::stop ──► gate.disable
//!                        backend.stop
//!                        bounded wait for in-flight cycle
//!
//!  event pump thread: BridgeNotice + backend errors ──► broadcast events
//! ```
//!
//! The lifecycle is a small state machine: `Idle → Running → Stopping →
//! Idle`, with `Closed` terminal for the open stream. The state lives in an
//! atomic because the cycle driver reads it (and transitions `Running →
//! Stopping` on a halt code) from the audio thread, which must never take a
//! mutex the control side holds.
//!
//! `stop()` is bounded: it quiesces the backend, then waits for the
//! in-flight cycle (and any relay invocation behind the dispatch gate) to
//! finish. If the wait exceeds [`StopPolicy::timeout`] the stream is torn
//! down anyway and [`EffexError::ForcedStop`] comes back, so a wedged
//! callback can never hang the control thread forever.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crossbeam_channel::{never, select, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::backend::{AudioBackend, BackendStream, CycleControl, CycleFn, ErrorFn};
use crate::bridge::{
    self, BridgeConfig, BridgeDiagnostics, BridgeNotice, BufferCallback, CallbackInstaller,
    ContinuationCode, CycleInfo, DispatchGate,
};
use crate::error::{EffexError, Result};
use crate::events::{EngineEvent, EngineEventKind, StopReason};

/// In-flight buffers each indirect ring can hold.
const RING_DEPTH: usize = 4;

/// Capacity of the driver → pump message channel. Messages are rare
/// (lifecycle transitions, backend failures); `try_send` only.
const PUMP_CAP: usize = 16;

/// Broadcast capacity for engine events.
const EVENT_CAP: usize = 64;

/// Which way samples flow through a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// Input only: the callback's playback slice is empty.
    Capture,
    /// Output only: the callback's capture slice is empty.
    Playback,
    /// Input and output with matched buffer sizes.
    Duplex,
}

/// Hardware stream parameters, validated at `open`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamConfig {
    pub sample_rate: u32,
    /// Interleaved channel count, identical for capture and playback.
    pub channels: u16,
    /// Frames (sample groups) per buffer cycle.
    pub frames_per_buffer: u32,
    pub direction: Direction,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            frames_per_buffer: 1024,
            direction: Direction::Duplex,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if !(4_000..=384_000).contains(&self.sample_rate) {
            return Err(EffexError::Config(format!(
                "sample rate {} out of range (4000..=384000)",
                self.sample_rate
            )));
        }
        if !(1..=32).contains(&self.channels) {
            return Err(EffexError::Config(format!(
                "channel count {} out of range (1..=32)",
                self.channels
            )));
        }
        if !(16..=16_384).contains(&self.frames_per_buffer) {
            return Err(EffexError::Config(format!(
                "frames per buffer {} out of range (16..=16384)",
                self.frames_per_buffer
            )));
        }
        Ok(())
    }

    /// Wall-clock duration of one buffer cycle.
    pub fn buffer_period(&self) -> Duration {
        Duration::from_secs_f64(f64::from(self.frames_per_buffer) / f64::from(self.sample_rate))
    }

    /// Interleaved samples exchanged per cycle.
    pub fn samples_per_cycle(&self) -> usize {
        self.frames_per_buffer as usize * self.channels as usize
    }
}

/// Bound on how long `stop()` may wait for an in-flight cycle.
#[derive(Debug, Clone, Copy)]
pub struct StopPolicy {
    pub timeout: Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
        }
    }
}

/// Lifecycle state of the engine's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamState {
    /// No stream running. Entered after open, after stop, and after a
    /// backend failure force-closes the stream.
    Idle,
    /// The backend is invoking the cycle driver.
    Running,
    /// A halt was requested (by `stop()` or a callback code); cycles are no
    /// longer dispatched but the stream has not been finalised yet.
    Stopping,
    /// The stream was closed. `open` a new one to continue.
    Closed,
}

impl StreamState {
    fn as_u8(self) -> u8 {
        match self {
            StreamState::Idle => 0,
            StreamState::Running => 1,
            StreamState::Stopping => 2,
            StreamState::Closed => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => StreamState::Running,
            2 => StreamState::Stopping,
            3 => StreamState::Closed,
            _ => StreamState::Idle,
        }
    }
}

/// Identifier and config snapshot for an open stream.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub id: u64,
    pub config: StreamConfig,
}

/// Engine-side counters, merged with the bridge's in
/// [`AudioEngine::diagnostics`].
#[derive(Default)]
struct EngineCounters {
    cycles: AtomicU64,
    forced_stops: AtomicUsize,
}

/// Point-in-time copy of every engine counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    /// Buffer cycles dispatched since the last `start`.
    pub cycles: u64,
    /// Capture samples dropped on the indirect path.
    pub overrun_samples: usize,
    /// Playback samples substituted with silence on the indirect path.
    pub underrun_samples: usize,
    /// Callback panics caught at the dispatch boundary.
    pub faults: usize,
    /// Times `stop()` hit its bound and tore the stream down forcibly.
    pub forced_stops: usize,
}

enum PumpMsg {
    StreamError(String),
    Stopped(StopReason),
}

struct OpenStream {
    handle: StreamHandle,
    stream: Box<dyn BackendStream>,
    installer: CallbackInstaller,
    gate: Arc<DispatchGate>,
    pump_tx: Sender<PumpMsg>,
    cycles_entered: Arc<AtomicU64>,
    cycles_exited: Arc<AtomicU64>,
    /// Set when a callback halted the stream (code or panic). The backend
    /// has retired its cycle function at that point, so the stream cannot
    /// be restarted — only closed and reopened.
    halted: Arc<AtomicBool>,
    bridge_diag: Arc<BridgeDiagnostics>,
}

/// Owns one audio stream and its callback plumbing.
pub struct AudioEngine {
    backend: Mutex<Box<dyn AudioBackend>>,
    stream: Arc<Mutex<Option<OpenStream>>>,
    state: Arc<AtomicU8>,
    events_tx: broadcast::Sender<EngineEvent>,
    event_seq: Arc<AtomicU64>,
    counters: Arc<EngineCounters>,
    stop_policy: StopPolicy,
    next_stream_id: AtomicU64,
}

impl AudioEngine {
    pub fn new(backend: Box<dyn AudioBackend>) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAP);
        Self {
            backend: Mutex::new(backend),
            stream: Arc::new(Mutex::new(None)),
            state: Arc::new(AtomicU8::new(StreamState::Idle.as_u8())),
            events_tx,
            event_seq: Arc::new(AtomicU64::new(0)),
            counters: Arc::new(EngineCounters::default()),
            stop_policy: StopPolicy::default(),
            next_stream_id: AtomicU64::new(1),
        }
    }

    pub fn with_stop_policy(mut self, policy: StopPolicy) -> Self {
        self.stop_policy = policy;
        self
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Subscribe to engine events. Late subscribers only see events emitted
    /// after the call; a slow receiver is lagged, never blocks the engine.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }

    /// Validate `config`, open a backend stream for it, and wire up the
    /// callback bridge and event pump. The stream starts out idle.
    pub fn open(&self, config: StreamConfig) -> Result<StreamHandle> {
        config.validate()?;

        let mut slot = self.stream.lock();
        if slot.is_some() {
            return Err(EffexError::State(
                "a stream is already open; close it first".into(),
            ));
        }

        let mut backend = self.backend.lock();
        if !backend.supports(&config) {
            return Err(EffexError::Config(
                "backend does not support the requested stream configuration".into(),
            ));
        }

        let bridge_config = BridgeConfig {
            frames_per_buffer: config.frames_per_buffer as usize,
            channels: config.channels,
            buffer_period: config.buffer_period(),
            ring_depth: RING_DEPTH,
        };
        let (installer, bridge, notice_rx) = bridge::channel(bridge_config);
        let gate = installer.gate();
        let bridge_diag = installer.diagnostics();

        let (pump_tx, pump_rx) = crossbeam_channel::bounded(PUMP_CAP);
        self.spawn_event_pump(notice_rx, pump_rx)?;

        let cycles_entered = Arc::new(AtomicU64::new(0));
        let cycles_exited = Arc::new(AtomicU64::new(0));
        let halted = Arc::new(AtomicBool::new(false));
        let driver = make_cycle_driver(
            bridge,
            Arc::clone(&self.state),
            Arc::clone(&cycles_entered),
            Arc::clone(&cycles_exited),
            Arc::clone(&halted),
            Arc::clone(&self.counters),
            pump_tx.clone(),
            u64::from(config.frames_per_buffer),
        );

        let error_tx = pump_tx.clone();
        let on_error: ErrorFn = Box::new(move |message| {
            let _ = error_tx.try_send(PumpMsg::StreamError(message));
        });

        let stream = backend.open_stream(&config, driver, on_error)?;

        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let handle = StreamHandle {
            id,
            config: config.clone(),
        };
        info!(
            stream_id = id,
            sample_rate = config.sample_rate,
            channels = config.channels,
            frames_per_buffer = config.frames_per_buffer,
            direction = ?config.direction,
            "stream opened"
        );

        *slot = Some(OpenStream {
            handle: handle.clone(),
            stream,
            installer,
            gate,
            pump_tx,
            cycles_entered,
            cycles_exited,
            halted,
            bridge_diag,
        });
        self.state
            .store(StreamState::Idle.as_u8(), Ordering::SeqCst);
        Ok(handle)
    }

    /// Install `callback` and start the stream.
    pub fn start(&self, callback: BufferCallback) -> Result<()> {
        let mut slot = self.stream.lock();
        let open = slot
            .as_mut()
            .ok_or_else(|| EffexError::State("no open stream".into()))?;

        match self.state() {
            StreamState::Idle => {}
            StreamState::Running => {
                return Err(EffexError::State("stream is already running".into()))
            }
            StreamState::Stopping => {
                return Err(EffexError::State(
                    "stream is stopping; call stop() before restarting".into(),
                ))
            }
            // Unreachable while the slot is occupied.
            StreamState::Closed => return Err(EffexError::State("stream is closed".into())),
        }
        if open.halted.load(Ordering::SeqCst) {
            // The backend retired its cycle function when the callback
            // halted; starting again would report Running over a dead
            // stream.
            return Err(EffexError::State(
                "stream was halted by its callback; close and reopen it".into(),
            ));
        }

        open.gate.enable();
        open.installer.install(callback);
        self.counters.cycles.store(0, Ordering::Relaxed);
        self.state
            .store(StreamState::Running.as_u8(), Ordering::SeqCst);

        if let Err(e) = open.stream.start() {
            self.state
                .store(StreamState::Idle.as_u8(), Ordering::SeqCst);
            return Err(e);
        }
        info!(stream_id = open.handle.id, "stream started");
        Ok(())
    }

    /// Queue a replacement callback. The swap takes effect at the next
    /// buffer boundary; the in-flight cycle always completes against the old
    /// callback and no cycle ever sees both.
    pub fn install(&self, callback: BufferCallback) -> Result<()> {
        let slot = self.stream.lock();
        let open = slot
            .as_ref()
            .ok_or_else(|| EffexError::State("no open stream".into()))?;
        open.installer.install(callback);
        Ok(())
    }

    /// Halt the stream and wait (bounded) for the in-flight cycle.
    ///
    /// Valid from `Running`, or from `Stopping` to finalise a stream a
    /// callback already halted. After this returns — `Ok` or
    /// [`EffexError::ForcedStop`] — the user callback is not invoked again
    /// and the state is `Idle`.
    pub fn stop(&self) -> Result<()> {
        let mut slot = self.stream.lock();
        let open = slot
            .as_mut()
            .ok_or_else(|| EffexError::State("no open stream".into()))?;

        let was_running = match self.state() {
            StreamState::Running => true,
            StreamState::Stopping => false,
            other => {
                return Err(EffexError::State(format!(
                    "stream is not running (state: {other:?})"
                )))
            }
        };

        self.state
            .store(StreamState::Stopping.as_u8(), Ordering::SeqCst);
        open.gate.disable();
        open.stream.stop()?;

        let deadline = Instant::now() + self.stop_policy.timeout;
        loop {
            let entered = open.cycles_entered.load(Ordering::SeqCst);
            let exited = open.cycles_exited.load(Ordering::SeqCst);
            if entered == exited && open.gate.busy() == 0 {
                break;
            }
            if Instant::now() >= deadline {
                self.counters.forced_stops.fetch_add(1, Ordering::Relaxed);
                self.state
                    .store(StreamState::Idle.as_u8(), Ordering::SeqCst);
                let _ = open.pump_tx.try_send(PumpMsg::Stopped(StopReason::Requested));
                let waited_ms = self.stop_policy.timeout.as_millis() as u64;
                warn!(
                    stream_id = open.handle.id,
                    waited_ms, "stop bound exceeded; tearing stream down forcibly"
                );
                return Err(EffexError::ForcedStop { waited_ms });
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        self.state
            .store(StreamState::Idle.as_u8(), Ordering::SeqCst);
        if was_running {
            let _ = open.pump_tx.try_send(PumpMsg::Stopped(StopReason::Requested));
        }
        info!(stream_id = open.handle.id, "stream stopped");
        Ok(())
    }

    /// Release the stream and its backend resources. Only valid from idle.
    pub fn close(&self) -> Result<()> {
        let mut slot = self.stream.lock();
        if slot.is_none() {
            return Err(EffexError::State("no open stream".into()));
        }
        match self.state() {
            StreamState::Idle => {}
            other => {
                return Err(EffexError::State(format!(
                    "stop the stream before closing (state: {other:?})"
                )))
            }
        }
        let open = slot.take();
        self.state
            .store(StreamState::Closed.as_u8(), Ordering::SeqCst);
        if let Some(open) = open {
            info!(stream_id = open.handle.id, "stream closed");
        }
        Ok(())
    }

    /// Snapshot of every counter. Zeroes for the bridge counters when no
    /// stream is open.
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        let slot = self.stream.lock();
        let (overruns, underruns, faults) = slot
            .as_ref()
            .map(|open| {
                (
                    open.bridge_diag.overrun_samples.load(Ordering::Relaxed),
                    open.bridge_diag.underrun_samples.load(Ordering::Relaxed),
                    open.bridge_diag.faults.load(Ordering::Relaxed),
                )
            })
            .unwrap_or((0, 0, 0));
        DiagnosticsSnapshot {
            cycles: self.counters.cycles.load(Ordering::Relaxed),
            overrun_samples: overruns,
            underrun_samples: underruns,
            faults,
            forced_stops: self.counters.forced_stops.load(Ordering::Relaxed),
        }
    }

    fn spawn_event_pump(
        &self,
        notice_rx: Receiver<BridgeNotice>,
        pump_rx: Receiver<PumpMsg>,
    ) -> Result<()> {
        let events_tx = self.events_tx.clone();
        let event_seq = Arc::clone(&self.event_seq);
        let state = Arc::clone(&self.state);
        let slot = Arc::clone(&self.stream);
        std::thread::Builder::new()
            .name("effex-events".into())
            .spawn(move || run_event_pump(notice_rx, pump_rx, events_tx, event_seq, state, slot))
            .map_err(|e| EffexError::Stream(format!("spawn event pump: {e}")))?;
        Ok(())
    }
}

/// Build the closure the backend invokes once per hardware buffer.
///
/// Everything captured here is either owned, an `Arc` over atomics, or a
/// lock-free channel endpoint; the closure itself never allocates, blocks,
/// or logs.
fn make_cycle_driver(
    mut bridge: bridge::CallbackBridge,
    state: Arc<AtomicU8>,
    cycles_entered: Arc<AtomicU64>,
    cycles_exited: Arc<AtomicU64>,
    halted: Arc<AtomicBool>,
    counters: Arc<EngineCounters>,
    pump_tx: Sender<PumpMsg>,
    frames_per_buffer: u64,
) -> CycleFn {
    let mut frame_index: u64 = 0;
    let started = Instant::now();
    let running = StreamState::Running.as_u8();
    let stopping = StreamState::Stopping.as_u8();

    Box::new(move |capture: &[f32], playback: &mut [f32]| {
        // Enter before checking: an invocation racing stop() must be
        // visible to the entered/exited drain before stop() can return
        // (same discipline as DispatchGate::enter).
        cycles_entered.fetch_add(1, Ordering::SeqCst);
        if state.load(Ordering::SeqCst) != running {
            // A hardware callback can land in the stopping window. It plays
            // silence and asks for more; the backend's own pause retires it
            // without latching the stream done, so a plain stop can be
            // followed by start().
            playback.fill(0.0);
            cycles_exited.fetch_add(1, Ordering::SeqCst);
            return CycleControl::Continue;
        }

        bridge.apply_pending();
        let info = CycleInfo {
            frame_index,
            timestamp: started.elapsed(),
        };
        let code = bridge.dispatch(&info, capture, playback);
        frame_index += frames_per_buffer;
        counters.cycles.fetch_add(1, Ordering::Relaxed);

        let control = match code {
            ContinuationCode::Continue => CycleControl::Continue,
            ContinuationCode::StopAfterBuffer => {
                halted.store(true, Ordering::SeqCst);
                let _ = state.compare_exchange(running, stopping, Ordering::SeqCst, Ordering::SeqCst);
                let _ = pump_tx.try_send(PumpMsg::Stopped(StopReason::CallbackStop));
                CycleControl::Complete
            }
            ContinuationCode::AbortImmediately => {
                // How far the callback got through the buffer is unknowable
                // from here, so the whole buffer plays silence.
                playback.fill(0.0);
                halted.store(true, Ordering::SeqCst);
                let _ = state.compare_exchange(running, stopping, Ordering::SeqCst, Ordering::SeqCst);
                let _ = pump_tx.try_send(PumpMsg::Stopped(StopReason::CallbackAbort));
                CycleControl::Complete
            }
        };
        cycles_exited.fetch_add(1, Ordering::SeqCst);
        control
    })
}

/// Drains bridge notices and driver messages into the broadcast channel.
///
/// One pump runs per open stream; it exits once both of its inputs
/// disconnect, which happens when the `OpenStream` is dropped. A backend
/// stream error force-closes the stream from here.
fn run_event_pump(
    notice_rx: Receiver<BridgeNotice>,
    pump_rx: Receiver<PumpMsg>,
    events_tx: broadcast::Sender<EngineEvent>,
    event_seq: Arc<AtomicU64>,
    state: Arc<AtomicU8>,
    slot: Arc<Mutex<Option<OpenStream>>>,
) {
    let emit = |kind: EngineEventKind| {
        let event = EngineEvent {
            seq: event_seq.fetch_add(1, Ordering::SeqCst),
            kind,
        };
        // No subscribers is fine; events are fire-and-forget.
        let _ = events_tx.send(event);
    };

    let mut notice_rx = notice_rx;
    let mut pump_rx = pump_rx;
    let mut notice_open = true;
    let mut pump_open = true;

    while notice_open || pump_open {
        select! {
            recv(notice_rx) -> msg => match msg {
                Ok(BridgeNotice::Fault(message)) => {
                    warn!(message = %message, "callback fault");
                    emit(EngineEventKind::CallbackFault { message });
                }
                Ok(BridgeNotice::Overrun(dropped_samples)) => {
                    debug!(dropped_samples, "capture overrun");
                    emit(EngineEventKind::Overrun { dropped_samples });
                }
                Err(_) => {
                    notice_open = false;
                    notice_rx = never();
                }
            },
            recv(pump_rx) -> msg => match msg {
                Ok(PumpMsg::StreamError(message)) => {
                    error!(message = %message, "backend stream error; force-closing stream");
                    // Dropping the OpenStream tears down the backend handle
                    // and the bridge; the stream must be reopened.
                    *slot.lock() = None;
                    state.store(StreamState::Idle.as_u8(), Ordering::SeqCst);
                    emit(EngineEventKind::StreamError { message });
                    emit(EngineEventKind::Stopped {
                        reason: StopReason::BackendError,
                    });
                }
                Ok(PumpMsg::Stopped(reason)) => {
                    emit(EngineEventKind::Stopped { reason });
                }
                Err(_) => {
                    pump_open = false;
                    pump_rx = never();
                }
            },
        }
    }
    debug!("event pump exited");
}
