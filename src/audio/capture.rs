//! Microphone capture pipeline.
//!
//! The cpal input callback folds multi-channel audio to mono, quantizes to
//! 16-bit, resamples to the 16 kHz wire rate, and pushes into a shared
//! buffer the session's transport loop drains on a fixed tick. The raw
//! stream is also tapped for the input level meter before framing.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::audio::meter::LevelTap;
use crate::audio::pcm::INPUT_SAMPLE_RATE;
use crate::error::{classify_device_error, DeviceErrorKind, SessionError};

/// Drain cadence for the outbound frame tick. Small enough to bound
/// latency, large enough to keep frames off the audio callback's back.
pub const CAPTURE_TICK_MS: u64 = 50;

fn fold_to_mono_f32(data: &[f32], channels: usize) -> Vec<i16> {
    data.chunks(channels)
        .map(|frame| {
            let sum: f32 = frame.iter().sum();
            let avg = sum / channels as f32;
            (avg.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
        })
        .collect()
}

fn fold_to_mono_i16(data: &[i16], channels: usize) -> Vec<i16> {
    data.chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Linear-interpolation resampler for the capture path.
fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = (samples.len() as f64 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f64 / ratio;
            let idx0 = src_idx as usize;
            let idx1 = (idx0 + 1).min(samples.len() - 1);
            let frac = src_idx - idx0 as f64;
            let s0 = samples[idx0.min(samples.len() - 1)] as f64;
            let s1 = samples[idx1] as f64;
            (s0 + (s1 - s0) * frac) as i16
        })
        .collect()
}

/// Owns the microphone stream and the shared frame buffer.
pub struct CapturePipeline {
    buffer: Arc<Mutex<Vec<i16>>>,
    streaming: Arc<AtomicBool>,
    _stream: cpal::Stream,
}

impl CapturePipeline {
    /// Acquire the default input device and start capturing. Samples are
    /// buffered only after `set_streaming(true)`; the level tap is fed
    /// either way. Failure aborts the whole connect attempt.
    pub fn open(tap: Arc<LevelTap>, stop: Arc<AtomicBool>) -> Result<Self, SessionError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(SessionError::Device {
            kind: DeviceErrorKind::NotFound,
            message: "no audio input device available".to_string(),
        })?;

        let config = device
            .default_input_config()
            .map_err(|e| SessionError::Device {
                kind: classify_device_error(&e.to_string()),
                message: format!("failed to query input device: {}", e),
            })?;

        let sample_rate = config.sample_rate();
        let channels = config.channels() as usize;

        let buffer: Arc<Mutex<Vec<i16>>> = Arc::new(Mutex::new(Vec::new()));
        let streaming = Arc::new(AtomicBool::new(false));

        let err_fn = |err| eprintln!("[audio] input stream error: {}", err);

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => {
                let buffer = buffer.clone();
                let streaming = streaming.clone();
                let stop = stop.clone();
                device.build_input_stream(
                    &config.into(),
                    move |data: &[f32], _: &_| {
                        if stop.load(Ordering::Relaxed) {
                            return;
                        }
                        let mono = fold_to_mono_f32(data, channels);
                        let resampled = resample_linear(&mono, sample_rate, INPUT_SAMPLE_RATE);
                        tap.push(&resampled);
                        if streaming.load(Ordering::Relaxed) {
                            if let Ok(mut buf) = buffer.lock() {
                                buf.extend_from_slice(&resampled);
                            }
                        }
                    },
                    err_fn,
                    None,
                )
            }
            cpal::SampleFormat::I16 => {
                let buffer = buffer.clone();
                let streaming = streaming.clone();
                let stop = stop.clone();
                device.build_input_stream(
                    &config.into(),
                    move |data: &[i16], _: &_| {
                        if stop.load(Ordering::Relaxed) {
                            return;
                        }
                        let mono = fold_to_mono_i16(data, channels);
                        let resampled = resample_linear(&mono, sample_rate, INPUT_SAMPLE_RATE);
                        tap.push(&resampled);
                        if streaming.load(Ordering::Relaxed) {
                            if let Ok(mut buf) = buffer.lock() {
                                buf.extend_from_slice(&resampled);
                            }
                        }
                    },
                    err_fn,
                    None,
                )
            }
            other => {
                return Err(SessionError::Device {
                    kind: DeviceErrorKind::Other,
                    message: format!("unsupported input sample format: {:?}", other),
                })
            }
        }
        .map_err(|e| SessionError::Device {
            kind: classify_device_error(&e.to_string()),
            message: format!("failed to open microphone: {}", e),
        })?;

        stream.play().map_err(|e| SessionError::Device {
            kind: classify_device_error(&e.to_string()),
            message: format!("failed to start microphone: {}", e),
        })?;

        Ok(Self {
            buffer,
            streaming,
            _stream: stream,
        })
    }

    /// Handle for the transport loop to gate and drain frames without
    /// owning the (non-Send) stream.
    pub fn frame_source(&self) -> FrameSource {
        FrameSource {
            buffer: self.buffer.clone(),
            streaming: self.streaming.clone(),
        }
    }
}

/// Send-safe view of the capture buffer and its streaming gate.
#[derive(Clone)]
pub struct FrameSource {
    buffer: Arc<Mutex<Vec<i16>>>,
    streaming: Arc<AtomicBool>,
}

impl FrameSource {
    /// Gate frame buffering. Off until the transport is open so audio
    /// captured during setup doesn't pile up.
    pub fn set_streaming(&self, on: bool) {
        self.streaming.store(on, Ordering::SeqCst);
        if !on {
            if let Ok(mut buf) = self.buffer.lock() {
                buf.clear();
            }
        }
    }

    pub fn drain(&self) -> Vec<i16> {
        self.buffer
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }
}
