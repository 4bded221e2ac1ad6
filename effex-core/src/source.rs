//! File-backed sample sources and rate conversion.
//!
//! Control-side helpers for feeding streams from disk: a WAV loader that
//! normalises every supported encoding to f32, and a `RateConverter` that
//! brings file material to the device rate. Both run on control threads
//! where allocation is fine; the audio thread only ever sees the resulting
//! sample buffers.

use std::path::Path;

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{EffexError, Result};

/// Decoded WAV audio: interleaved f32 in [-1.0, 1.0].
#[derive(Debug, Clone)]
pub struct WavSource {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl WavSource {
    /// Load a WAV file, converting integer encodings to normalised f32.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = hound::WavReader::open(path)
            .map_err(|e| EffexError::Config(format!("{}: {e}", path.display())))?;
        let spec = reader.spec();

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| EffexError::Config(format!("{}: {e}", path.display())))?,
            hound::SampleFormat::Int => {
                if spec.bits_per_sample <= 16 {
                    reader
                        .samples::<i16>()
                        .map(|s| s.map(|v| f32::from(v) / f32::from(i16::MAX)))
                        .collect::<std::result::Result<_, _>>()
                        .map_err(|e| EffexError::Config(format!("{}: {e}", path.display())))?
                } else {
                    let max = ((1_i64 << (spec.bits_per_sample - 1)) - 1) as f32;
                    reader
                        .samples::<i32>()
                        .map(|s| s.map(|v| v as f32 / max))
                        .collect::<std::result::Result<_, _>>()
                        .map_err(|e| EffexError::Config(format!("{}: {e}", path.display())))?
                }
            }
        };

        Ok(Self {
            samples,
            channels: spec.channels.max(1),
            sample_rate: spec.sample_rate,
        })
    }

    /// Sample groups, not samples.
    pub fn frame_count(&self) -> usize {
        self.samples.len() / usize::from(self.channels)
    }

    /// Average all channels down to one.
    pub fn to_mono(&self) -> Vec<f32> {
        let channels = usize::from(self.channels);
        if channels == 1 {
            return self.samples.clone();
        }
        self.samples
            .chunks(channels)
            .map(|frame| frame.iter().copied().sum::<f32>() / channels as f32)
            .collect()
    }

    /// Spread a mono signal across `channels` interleaved channels.
    pub fn upmix(mono: &[f32], channels: u16) -> Vec<f32> {
        let channels = usize::from(channels.max(1));
        let mut out = Vec::with_capacity(mono.len() * channels);
        for &sample in mono {
            out.extend(std::iter::repeat(sample).take(channels));
        }
        out
    }

    /// Match this source to a stream's channel count and sample rate,
    /// returning interleaved samples ready to feed a playback callback.
    ///
    /// Channel mismatches go through a mono mixdown (stereo file on a mono
    /// stream) or a mono spread (the reverse); rate mismatches go through
    /// [`RateConverter`], tail included.
    pub fn prepare(&self, channels: u16, sample_rate: u32) -> Result<Vec<f32>> {
        let matched = if self.channels == channels {
            self.samples.clone()
        } else if channels == 1 {
            self.to_mono()
        } else {
            Self::upmix(&self.to_mono(), channels)
        };

        let mut converter =
            RateConverter::new(self.sample_rate, sample_rate, channels, PREPARE_CHUNK_FRAMES)?;
        let mut out = converter.process(&matched);
        out.extend(converter.flush());
        Ok(out)
    }
}

/// Frames per resampler chunk used by [`WavSource::prepare`].
const PREPARE_CHUNK_FRAMES: usize = 1024;

/// Converts interleaved f32 audio from one fixed sample rate to another,
/// keeping the stream's channel count intact.
///
/// When source rate == target rate this is a passthrough — no rubato
/// session is created at all. Otherwise interleaved input accumulates until
/// a full chunk of frames is available, gets deinterleaved into per-channel
/// lanes for the resampler, and comes back out interleaved at the target
/// rate. The remainder of a partial chunk is kept for the next call (or for
/// [`flush`](Self::flush) at end of material).
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    channels: usize,
    /// Frames (not samples) rubato consumes per process call.
    chunk_frames: usize,
    /// Interleaved samples awaiting a full chunk.
    pending: Vec<f32>,
    /// Per-channel input lanes: `[channels][chunk_frames]`.
    planar_in: Vec<Vec<f32>>,
    /// Per-channel output lanes: `[channels][output_frames_max]`.
    planar_out: Vec<Vec<f32>>,
}

impl RateConverter {
    pub fn new(
        source_rate: u32,
        target_rate: u32,
        channels: u16,
        chunk_frames: usize,
    ) -> Result<Self> {
        let channels = usize::from(channels.max(1));
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                channels,
                chunk_frames,
                pending: Vec::new(),
                planar_in: Vec::new(),
                planar_out: Vec::new(),
            });
        }

        let ratio = f64::from(target_rate) / f64::from(source_rate);
        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio — no dynamic adjustment
            PolynomialDegree::Cubic,
            chunk_frames,
            channels,
        )
        .map_err(|e| EffexError::Config(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let planar_in = vec![vec![0f32; chunk_frames]; channels];
        let planar_out = vec![vec![0f32; max_out]; channels];

        tracing::info!(source_rate, target_rate, channels, chunk_frames, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            channels,
            chunk_frames,
            pending: Vec::new(),
            planar_in,
            planar_out,
        })
    }

    /// Feed interleaved samples, returning interleaved output at the target
    /// rate (may be empty while a chunk accumulates). Passthrough mode
    /// returns the input as-is.
    pub fn process(&mut self, interleaved: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return interleaved.to_vec();
        };

        self.pending.extend_from_slice(interleaved);
        let chunk_samples = self.chunk_frames * self.channels;

        let mut result = Vec::new();
        while self.pending.len() >= chunk_samples {
            for (ch, lane) in self.planar_in.iter_mut().enumerate() {
                for (frame, slot) in lane.iter_mut().enumerate() {
                    *slot = self.pending[frame * self.channels + ch];
                }
            }
            match resampler.process_into_buffer(&self.planar_in, &mut self.planar_out, None) {
                Ok((_consumed, produced)) => {
                    result.reserve(produced * self.channels);
                    for frame in 0..produced {
                        for lane in &self.planar_out {
                            result.push(lane[frame]);
                        }
                    }
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }
            self.pending.drain(..chunk_samples);
        }
        result
    }

    /// Pad the pending partial chunk with silence and convert it. Call once
    /// at end of material; a converter with nothing pending returns nothing.
    pub fn flush(&mut self) -> Vec<f32> {
        if self.resampler.is_none() || self.pending.is_empty() {
            return Vec::new();
        }
        let chunk_samples = self.chunk_frames * self.channels;
        let partial = self.pending.len() % chunk_samples;
        if partial != 0 {
            self.pending
                .resize(self.pending.len() + chunk_samples - partial, 0.0);
        }
        self.process(&[])
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Interleave a constant-per-channel stereo signal.
    fn constant_stereo(frames: usize, left: f32, right: f32) -> Vec<f32> {
        let mut out = Vec::with_capacity(frames * 2);
        for _ in 0..frames {
            out.push(left);
            out.push(right);
        }
        out
    }

    #[test]
    fn matched_rates_pass_interleaved_audio_through() {
        let mut rc = RateConverter::new(44_100, 44_100, 2, 512).unwrap();
        assert!(rc.is_passthrough());
        let samples = constant_stereo(300, 0.25, -0.75);
        assert_eq!(rc.process(&samples), samples);
        assert!(rc.flush().is_empty());
    }

    #[test]
    fn stereo_conversion_preserves_channel_separation() {
        let mut rc = RateConverter::new(48_000, 44_100, 2, 512).unwrap();
        assert!(!rc.is_passthrough());
        let out = rc.process(&constant_stereo(2048, 0.5, -0.5));

        // 2048 frames at 48 kHz come out near 1882 frames at 44.1 kHz.
        assert_eq!(out.len() % 2, 0);
        let frames = out.len() / 2;
        assert!(
            (frames as isize - 1882).unsigned_abs() <= 32,
            "output frames={frames} expected≈1882"
        );

        // Away from the warmup transient, each lane holds its own constant.
        for frame in 64..frames - 64 {
            approx::assert_abs_diff_eq!(out[frame * 2], 0.5, epsilon = 0.05);
            approx::assert_abs_diff_eq!(out[frame * 2 + 1], -0.5, epsilon = 0.05);
        }
    }

    #[test]
    fn partial_chunks_accumulate_across_calls() {
        let mut rc = RateConverter::new(48_000, 44_100, 2, 512).unwrap();
        assert!(rc.process(&constant_stereo(300, 0.1, 0.1)).is_empty());
        assert!(
            !rc.process(&constant_stereo(300, 0.1, 0.1)).is_empty(),
            "second push should cross the chunk boundary"
        );
    }

    #[test]
    fn flush_converts_the_padded_tail() {
        let mut rc = RateConverter::new(48_000, 44_100, 2, 512).unwrap();
        assert!(rc.process(&constant_stereo(100, 0.3, 0.3)).is_empty());
        let tail = rc.flush();
        assert!(!tail.is_empty(), "pending frames must come out on flush");
        assert_eq!(tail.len() % 2, 0);
        assert!(rc.flush().is_empty(), "flush drains the converter");
    }

    #[test]
    fn prepare_spreads_a_mono_source_across_stream_channels() {
        let source = WavSource {
            samples: vec![0.1, 0.2, 0.3],
            channels: 1,
            sample_rate: 8_000,
        };
        // Same rate: only the channel layout changes.
        let prepared = source.prepare(2, 8_000).unwrap();
        assert_eq!(prepared, vec![0.1, 0.1, 0.2, 0.2, 0.3, 0.3]);
    }

    #[test]
    fn prepare_resamples_to_the_stream_rate() {
        let source = WavSource {
            samples: vec![0.25; 4_800],
            channels: 1,
            sample_rate: 48_000,
        };
        let prepared = source.prepare(2, 24_000).unwrap();
        assert_eq!(prepared.len() % 2, 0);
        // 4800 mono frames at 48 kHz land near 2400 stereo frames at 24 kHz
        // (flush pads the last chunk, so slightly over is fine).
        let frames = prepared.len() / 2;
        assert!(
            (2_300..=2_700).contains(&frames),
            "prepared frames={frames} expected≈2400"
        );
    }

    #[test]
    fn mono_mixdown_averages_channels() {
        let source = WavSource {
            samples: vec![1.0, -1.0, 0.5, 0.5],
            channels: 2,
            sample_rate: 44_100,
        };
        assert_eq!(source.frame_count(), 2);
        let mono = source.to_mono();
        approx::assert_abs_diff_eq!(mono[0], 0.0);
        approx::assert_abs_diff_eq!(mono[1], 0.5);
    }

    #[test]
    fn upmix_interleaves_every_channel() {
        assert_eq!(
            WavSource::upmix(&[0.1, 0.2], 2),
            vec![0.1, 0.1, 0.2, 0.2]
        );
    }

    #[test]
    fn load_round_trips_a_written_wav() {
        let dir = std::env::temp_dir().join("effex-wav-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tone.wav");

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for v in [0i16, i16::MAX / 2, i16::MIN / 2, 0] {
            writer.write_sample(v).unwrap();
        }
        writer.finalize().unwrap();

        let source = WavSource::load(&path).unwrap();
        assert_eq!(source.channels, 1);
        assert_eq!(source.sample_rate, 8_000);
        assert_eq!(source.frame_count(), 4);
        approx::assert_abs_diff_eq!(source.samples[1], 0.5, epsilon = 1e-3);
        std::fs::remove_file(&path).ok();
    }
}
