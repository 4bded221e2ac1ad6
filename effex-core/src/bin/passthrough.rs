//! Duplex passthrough demo: capture → identity callback → playback.
//!
//! Runs a live loopback for a fixed duration, prints engine events and a
//! diagnostics summary, and exercises the same open/start/stop/close path a
//! real host would. With `--indirect` the callback runs on the relay thread
//! instead of inline on the audio thread. With `--wav <file>` the stream
//! plays the file instead: the source is matched to the stream's channel
//! count and sample rate, fed buffer by buffer, and the callback halts the
//! stream itself once the material runs out.

#[cfg(not(feature = "audio-cpal"))]
fn main() {
    eprintln!("passthrough requires the 'audio-cpal' feature");
    std::process::exit(1);
}

#[cfg(feature = "audio-cpal")]
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "effex=info".parse().unwrap()),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("passthrough failed: {e}");
        std::process::exit(1);
    }
}

#[cfg(feature = "audio-cpal")]
fn run() -> effex_core::Result<()> {
    use effex_core::{
        AudioEngine, BufferCallback, ContinuationCode, CpalBackend, Direction, EngineEventKind,
        StreamConfig, WavSource,
    };
    use std::path::PathBuf;
    use std::time::{Duration, Instant};
    use tracing::info;

    struct Args {
        seconds: u64,
        indirect: bool,
        wav: Option<PathBuf>,
        config: StreamConfig,
    }

    fn parse_args() -> Result<Args, String> {
        let mut seconds: u64 = 5;
        let mut indirect = false;
        let mut wav = None;
        let mut config = StreamConfig {
            direction: Direction::Duplex,
            ..StreamConfig::default()
        };

        let mut it = std::env::args().skip(1);
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--seconds" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --seconds".into());
                    };
                    seconds = v
                        .parse::<u64>()
                        .map_err(|_| "invalid value for --seconds".to_string())?
                        .clamp(1, 600);
                }
                "--rate" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --rate".into());
                    };
                    config.sample_rate = v
                        .parse()
                        .map_err(|_| "invalid value for --rate".to_string())?;
                }
                "--frames" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --frames".into());
                    };
                    config.frames_per_buffer = v
                        .parse()
                        .map_err(|_| "invalid value for --frames".to_string())?;
                }
                "--wav" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --wav".into());
                    };
                    wav = Some(PathBuf::from(v));
                }
                "--indirect" => indirect = true,
                "--help" | "-h" => {
                    println!(
                        "Usage: cargo run -p effex-core --bin passthrough -- \\
  [--seconds <n>] [--rate <hz>] [--frames <per-buffer>] [--indirect] [--wav <file>]"
                    );
                    std::process::exit(0);
                }
                other => return Err(format!("unknown argument: {other}")),
            }
        }
        Ok(Args {
            seconds,
            indirect,
            wav,
            config,
        })
    }

    let mut args = parse_args().map_err(effex_core::EffexError::Config)?;
    if args.wav.is_some() {
        args.config.direction = Direction::Playback;
    }

    let engine = AudioEngine::new(Box::new(CpalBackend::new()));
    let mut events = engine.subscribe_events();
    let handle = engine.open(args.config.clone())?;

    let deadline;
    if let Some(path) = &args.wav {
        let source = WavSource::load(path)?;
        info!(
            path = %path.display(),
            frames = source.frame_count(),
            channels = source.channels,
            sample_rate = source.sample_rate,
            "playing wav file"
        );
        let samples = source.prepare(args.config.channels, args.config.sample_rate)?;
        let play_secs = samples.len() as u64
            / u64::from(args.config.channels)
            / u64::from(args.config.sample_rate);
        deadline = Instant::now() + Duration::from_secs(play_secs + 2);

        let mut pos = 0usize;
        let feed = move |_info: &effex_core::CycleInfo,
                         _capture: &[f32],
                         playback: &mut [f32]|
              -> ContinuationCode {
            let n = playback.len().min(samples.len() - pos);
            playback[..n].copy_from_slice(&samples[pos..pos + n]);
            playback[n..].fill(0.0);
            pos += n;
            if pos >= samples.len() {
                ContinuationCode::StopAfterBuffer
            } else {
                ContinuationCode::Continue
            }
        };
        let callback = if args.indirect {
            BufferCallback::indirect(feed)
        } else {
            BufferCallback::direct(feed)
        };
        engine.start(callback)?;
    } else {
        info!(stream_id = handle.id, "stream open; starting passthrough");

        fn identity(
            _info: &effex_core::CycleInfo,
            capture: &[f32],
            playback: &mut [f32],
        ) -> ContinuationCode {
            let n = capture.len().min(playback.len());
            playback[..n].copy_from_slice(&capture[..n]);
            playback[n..].fill(0.0);
            ContinuationCode::Continue
        }
        let callback = if args.indirect {
            BufferCallback::indirect(identity)
        } else {
            BufferCallback::direct(identity)
        };
        engine.start(callback)?;
        deadline = Instant::now() + Duration::from_secs(args.seconds);
    }

    while Instant::now() < deadline {
        match events.try_recv() {
            Ok(event) => {
                let stopped = matches!(event.kind, EngineEventKind::Stopped { .. });
                println!("event: {}", serde_json::to_string(&event).unwrap_or_default());
                // A wav feed halts on its own once the material runs out.
                if stopped && args.wav.is_some() {
                    break;
                }
            }
            Err(_) => std::thread::sleep(Duration::from_millis(50)),
        }
    }

    engine.stop()?;
    engine.close()?;

    let diag = engine.diagnostics();
    println!(
        "cycles={} overrun_samples={} underrun_samples={} faults={} forced_stops={}",
        diag.cycles, diag.overrun_samples, diag.underrun_samples, diag.faults, diag.forced_stops
    );
    Ok(())
}
