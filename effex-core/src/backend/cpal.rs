//! cpal adapter for [`AudioBackend`].
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS), so the streams are built and held on a dedicated holder thread;
//! the [`BackendStream`] handle only exchanges commands with it. A sync
//! channel propagates open errors back to the caller, the same handshake the
//! capture-only version of this crate family uses.
//!
//! # Duplex wiring
//!
//! cpal exposes separate input and output streams. For duplex the input
//! callback pushes captured samples into an internal SPSC ring and the
//! output callback drives the cycle: it drains one buffer's worth of capture
//! samples (zero-filling after an underrun) and hands both slices to the
//! cycle function. Capture-only streams drive the cycle from the input
//! callback with an empty playback slice.
//!
//! Only f32 device formats are accepted; everything this engine exchanges is
//! f32 PCM and modern hosts negotiate it natively.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, SampleRate,
};
use crossbeam_channel::{Receiver, Sender};
use tracing::{error, info, warn};

use crate::buffer::{create_sample_ring, Consumer, Producer};
use crate::engine::{Direction, StreamConfig};
use crate::error::{EffexError, Result};

use super::{AudioBackend, BackendStream, CycleControl, CycleFn, ErrorFn};

/// Capture ring headroom, in buffers, between the input and output callbacks.
const DUPLEX_RING_DEPTH: usize = 8;

/// Production backend talking to the default cpal host.
#[derive(Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for CpalBackend {
    fn supports(&self, config: &StreamConfig) -> bool {
        let host = cpal::default_host();
        let needs_input = config.direction != Direction::Playback;
        let needs_output = config.direction != Direction::Capture;
        if needs_input && host.default_input_device().is_none() {
            return false;
        }
        if needs_output && host.default_output_device().is_none() {
            return false;
        }
        true
    }

    fn open_stream(
        &mut self,
        config: &StreamConfig,
        cycle: CycleFn,
        on_error: ErrorFn,
    ) -> Result<Box<dyn BackendStream>> {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded::<HolderCmd>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let config = config.clone();
        let active = Arc::new(AtomicBool::new(false));
        let holder_active = Arc::clone(&active);

        // Streams must be created and dropped on the same thread.
        std::thread::Builder::new()
            .name("effex-cpal".into())
            .spawn(move || holder_main(config, cycle, on_error, holder_active, cmd_rx, ready_tx))
            .map_err(|e| EffexError::Stream(format!("spawn cpal holder: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalStreamHandle { cmd_tx, active })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EffexError::Stream("cpal holder thread died".into())),
        }
    }
}

enum HolderCmd {
    Start(Sender<Result<()>>),
    Stop(Sender<Result<()>>),
}

struct CpalStreamHandle {
    cmd_tx: Sender<HolderCmd>,
    active: Arc<AtomicBool>,
}

impl CpalStreamHandle {
    fn roundtrip(&self, make: impl FnOnce(Sender<Result<()>>) -> HolderCmd) -> Result<()> {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        self.cmd_tx
            .send(make(ack_tx))
            .map_err(|_| EffexError::Stream("cpal holder thread gone".into()))?;
        ack_rx
            .recv()
            .map_err(|_| EffexError::Stream("cpal holder thread gone".into()))?
    }
}

impl BackendStream for CpalStreamHandle {
    fn start(&mut self) -> Result<()> {
        self.roundtrip(HolderCmd::Start)
    }

    fn stop(&mut self) -> Result<()> {
        // Callbacks check this flag first and no-op once it clears; the
        // pause below then quiesces the hardware side.
        self.active.store(false, Ordering::Release);
        self.roundtrip(HolderCmd::Stop)
    }
}

impl Drop for CpalStreamHandle {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
        // Disconnecting cmd_tx makes the holder drop its streams and exit.
    }
}

fn holder_main(
    config: StreamConfig,
    cycle: CycleFn,
    on_error: ErrorFn,
    active: Arc<AtomicBool>,
    cmd_rx: Receiver<HolderCmd>,
    ready_tx: std::sync::mpsc::Sender<Result<()>>,
) {
    let streams = match build_streams(&config, cycle, on_error, Arc::clone(&active)) {
        Ok(s) => {
            let _ = ready_tx.send(Ok(()));
            s
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            HolderCmd::Start(ack) => {
                active.store(true, Ordering::Release);
                let result = streams.play();
                let _ = ack.send(result);
            }
            HolderCmd::Stop(ack) => {
                active.store(false, Ordering::Release);
                let result = streams.pause();
                let _ = ack.send(result);
            }
        }
    }
    // Streams drop here, on the thread that created them.
    info!("cpal holder thread exiting");
}

struct Streams {
    input: Option<cpal::Stream>,
    output: Option<cpal::Stream>,
}

impl Streams {
    fn play(&self) -> Result<()> {
        for stream in self.input.iter().chain(self.output.iter()) {
            stream
                .play()
                .map_err(|e| EffexError::Stream(e.to_string()))?;
        }
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        for stream in self.input.iter().chain(self.output.iter()) {
            stream
                .pause()
                .map_err(|e| EffexError::Stream(e.to_string()))?;
        }
        Ok(())
    }
}

fn build_streams(
    config: &StreamConfig,
    mut cycle: CycleFn,
    on_error: ErrorFn,
    active: Arc<AtomicBool>,
) -> Result<Streams> {
    let host = cpal::default_host();
    let on_error = Arc::new(on_error);
    let samples_per_cycle = config.frames_per_buffer as usize * config.channels as usize;

    let cpal_config = cpal::StreamConfig {
        channels: config.channels,
        sample_rate: SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Fixed(config.frames_per_buffer),
    };

    match config.direction {
        Direction::Capture => {
            let device = host
                .default_input_device()
                .ok_or_else(|| EffexError::Stream("no default input device".into()))?;
            check_f32_input(&device)?;
            info!(device = device.name().unwrap_or_default().as_str(), "opening capture stream");

            let err_fn = error_hook(Arc::clone(&on_error), Arc::clone(&active));
            let active_cb = Arc::clone(&active);
            let mut done = false;
            let input = device
                .build_input_stream(
                    &cpal_config,
                    move |data: &[f32], _info| {
                        if done || !active_cb.load(Ordering::Acquire) {
                            return;
                        }
                        if cycle(data, &mut []) == CycleControl::Complete {
                            done = true;
                            active_cb.store(false, Ordering::Release);
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| EffexError::Stream(e.to_string()))?;

            Ok(Streams {
                input: Some(input),
                output: None,
            })
        }

        Direction::Playback => {
            let device = host
                .default_output_device()
                .ok_or_else(|| EffexError::Stream("no default output device".into()))?;
            info!(device = device.name().unwrap_or_default().as_str(), "opening playback stream");

            let err_fn = error_hook(Arc::clone(&on_error), Arc::clone(&active));
            let active_cb = Arc::clone(&active);
            let mut done = false;
            let output = device
                .build_output_stream(
                    &cpal_config,
                    move |data: &mut [f32], _info| {
                        if done || !active_cb.load(Ordering::Acquire) {
                            data.fill(0.0);
                            return;
                        }
                        if cycle(&[], data) == CycleControl::Complete {
                            done = true;
                            active_cb.store(false, Ordering::Release);
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| EffexError::Stream(e.to_string()))?;

            Ok(Streams {
                input: None,
                output: Some(output),
            })
        }

        Direction::Duplex => {
            let input_device = host
                .default_input_device()
                .ok_or_else(|| EffexError::Stream("no default input device".into()))?;
            let output_device = host
                .default_output_device()
                .ok_or_else(|| EffexError::Stream("no default output device".into()))?;
            check_f32_input(&input_device)?;
            info!(
                input = input_device.name().unwrap_or_default().as_str(),
                output = output_device.name().unwrap_or_default().as_str(),
                "opening duplex stream pair"
            );

            let (mut capture_prod, mut capture_cons) =
                create_sample_ring(samples_per_cycle * DUPLEX_RING_DEPTH);

            let input_active = Arc::clone(&active);
            let input = input_device
                .build_input_stream(
                    &cpal_config,
                    move |data: &[f32], _info| {
                        if !input_active.load(Ordering::Acquire) {
                            return;
                        }
                        let written = capture_prod.push_slice(data);
                        if written < data.len() {
                            // Output side stalled; samples drop here rather
                            // than anything blocking.
                            warn!("duplex capture ring full: dropped {} samples", data.len() - written);
                        }
                    },
                    error_hook(Arc::clone(&on_error), Arc::clone(&active)),
                    None,
                )
                .map_err(|e| EffexError::Stream(e.to_string()))?;

            // Scratch reused every callback; sized once, never regrown.
            let mut capture_buf = vec![0.0f32; samples_per_cycle];
            let output_active = Arc::clone(&active);
            let mut done = false;
            let output = output_device
                .build_output_stream(
                    &cpal_config,
                    move |data: &mut [f32], _info| {
                        if done || !output_active.load(Ordering::Acquire) {
                            data.fill(0.0);
                            return;
                        }
                        let take = data.len().min(capture_buf.len());
                        let got = capture_cons.pop_slice(&mut capture_buf[..take]);
                        capture_buf[got..take].fill(0.0);
                        if cycle(&capture_buf[..take], data) == CycleControl::Complete {
                            done = true;
                            output_active.store(false, Ordering::Release);
                        }
                    },
                    error_hook(Arc::clone(&on_error), Arc::clone(&active)),
                    None,
                )
                .map_err(|e| EffexError::Stream(e.to_string()))?;

            Ok(Streams {
                input: Some(input),
                output: Some(output),
            })
        }
    }
}

fn error_hook(
    on_error: Arc<ErrorFn>,
    active: Arc<AtomicBool>,
) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| {
        error!("cpal stream error: {err}");
        active.store(false, Ordering::Release);
        on_error(err.to_string());
    }
}

fn check_f32_input(device: &cpal::Device) -> Result<()> {
    let supported = device
        .default_input_config()
        .map_err(|e| EffexError::Stream(e.to_string()))?;
    if supported.sample_format() != SampleFormat::F32 {
        return Err(EffexError::Stream(format!(
            "unsupported input sample format: {:?} (f32 required)",
            supported.sample_format()
        )));
    }
    Ok(())
}
