//! Gapless playback of streamed model audio.
//!
//! The `Scheduler` is pure bookkeeping: it owns the monotonically advancing
//! next-start cursor and the set of in-flight units, and renders them onto an
//! output clock. The `PlaybackEngine` drives it from a cpal output stream.
//! Interruption (barge-in) hard-stops every in-flight unit and resets the
//! cursor so the next unit starts fresh from the current clock time.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::audio::meter::LevelTap;
use crate::error::{classify_device_error, DeviceErrorKind, SessionError};

/// Fixed gain applied before the compressor.
const OUTPUT_GAIN: f32 = 1.0;

/// A decoded buffer with its slot on the output clock.
pub struct PlaybackUnit {
    pub id: u64,
    /// Seconds on the output clock.
    pub start_time: f64,
    /// Seconds.
    pub duration: f64,
    samples: Vec<f32>,
    sample_rate: u32,
}

impl PlaybackUnit {
    /// Sample at clock time `t`, linearly interpolated. Zero outside the
    /// unit's window.
    fn sample_at(&self, t: f64) -> f32 {
        if t < self.start_time || t >= self.start_time + self.duration || self.samples.is_empty() {
            return 0.0;
        }
        let pos = (t - self.start_time) * self.sample_rate as f64;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let last = self.samples.len() - 1;
        let s0 = self.samples[idx.min(last)];
        let s1 = self.samples[(idx + 1).min(last)];
        s0 + (s1 - s0) * frac
    }
}

/// Scheduling state for the playback path.
pub struct Scheduler {
    next_start_time: f64,
    next_id: u64,
    in_flight: Vec<PlaybackUnit>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            next_start_time: 0.0,
            next_id: 1,
            in_flight: Vec::new(),
        }
    }

    /// Queue a decoded buffer. Starts at `max(next_start_time, now)` so the
    /// stream self-heals when it falls behind the clock, and back-to-back
    /// when the producer keeps pace. Returns (id, start time).
    pub fn schedule(&mut self, now: f64, samples: Vec<f32>, sample_rate: u32) -> (u64, f64) {
        let start = self.next_start_time.max(now);
        let duration = samples.len() as f64 / sample_rate as f64;
        let id = self.next_id;
        self.next_id += 1;
        self.next_start_time = start + duration;
        self.in_flight.push(PlaybackUnit {
            id,
            start_time: start,
            duration,
            samples,
            sample_rate,
        });
        (id, start)
    }

    /// Remove a unit that finished naturally.
    pub fn finish(&mut self, id: u64) {
        self.in_flight.retain(|unit| unit.id != id);
    }

    /// Barge-in: drop everything in flight and reset the cursor to zero.
    /// The next scheduled unit starts from the live clock, not behind
    /// stale queued audio.
    pub fn interrupt(&mut self) {
        self.in_flight.clear();
        self.next_start_time = 0.0;
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Render mono output starting at clock time `t0`, finishing units
    /// whose window has fully passed.
    pub fn render(&mut self, t0: f64, out_rate: u32, out: &mut [f32]) {
        for (i, slot) in out.iter_mut().enumerate() {
            let t = t0 + i as f64 / out_rate as f64;
            let mut mixed = 0.0f32;
            for unit in &self.in_flight {
                mixed += unit.sample_at(t);
            }
            *slot = mixed;
        }
        let end = t0 + out.len() as f64 / out_rate as f64;
        let done: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|unit| unit.start_time + unit.duration <= end)
            .map(|unit| unit.id)
            .collect();
        for id in done {
            self.finish(id);
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Soft-knee dynamics compressor with fixed tuning, for consistent
/// perceived loudness of model speech.
pub struct Compressor {
    threshold: f32,
    ratio: f32,
    attack: f32,
    release: f32,
    envelope: f32,
}

impl Compressor {
    pub fn new(sample_rate: u32) -> Self {
        // -24 dB threshold, 3:1 ratio, 3 ms attack, 250 ms release.
        let threshold = 10f32.powf(-24.0 / 20.0);
        let coeff = |seconds: f32| (-1.0 / (sample_rate as f32 * seconds)).exp();
        Self {
            threshold,
            ratio: 3.0,
            attack: coeff(0.003),
            release: coeff(0.250),
            envelope: 0.0,
        }
    }

    pub fn process(&mut self, sample: f32) -> f32 {
        let level = sample.abs();
        let coeff = if level > self.envelope {
            self.attack
        } else {
            self.release
        };
        self.envelope = coeff * self.envelope + (1.0 - coeff) * level;
        let gain = if self.envelope > self.threshold {
            (self.threshold + (self.envelope - self.threshold) / self.ratio) / self.envelope
        } else {
            1.0
        };
        sample * gain
    }
}

/// Shareable view of the engine for the transport reader thread.
#[derive(Clone)]
pub struct PlaybackHandle {
    scheduler: Arc<Mutex<Scheduler>>,
    clock_frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl PlaybackHandle {
    /// Current output clock position in seconds.
    pub fn now(&self) -> f64 {
        self.clock_frames.load(Ordering::Relaxed) as f64 / self.sample_rate as f64
    }

    /// Schedule decoded model audio for gapless playback.
    pub fn enqueue(&self, samples: Vec<f32>, sample_rate: u32) {
        let now = self.now();
        if let Ok(mut scheduler) = self.scheduler.lock() {
            scheduler.schedule(now, samples, sample_rate);
        }
    }

    pub fn interrupt(&self) {
        if let Ok(mut scheduler) = self.scheduler.lock() {
            scheduler.interrupt();
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.scheduler
            .lock()
            .map(|s| s.in_flight_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
impl PlaybackHandle {
    /// Handle with no device behind it, for exercising dispatch logic.
    pub fn detached() -> Self {
        Self {
            scheduler: Arc::new(Mutex::new(Scheduler::new())),
            clock_frames: Arc::new(AtomicU64::new(0)),
            sample_rate: 48_000,
        }
    }

    pub fn advance_clock(&self, seconds: f64) {
        let frames = (seconds * self.sample_rate as f64) as u64;
        self.clock_frames.fetch_add(frames, Ordering::Relaxed);
    }

    /// Start time of the most recently scheduled unit.
    pub fn next_unit_start(&self) -> f64 {
        let sched = self.scheduler.lock().unwrap();
        sched
            .in_flight
            .last()
            .map(|u| u.start_time)
            .unwrap_or_default()
    }
}

/// Owns the cpal output stream. Output path: gain -> compressor -> level
/// tap -> device, in that fixed order.
pub struct PlaybackEngine {
    handle: PlaybackHandle,
    _stream: cpal::Stream,
}

impl PlaybackEngine {
    pub fn start(tap: Arc<LevelTap>) -> Result<Self, SessionError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(SessionError::Device {
            kind: DeviceErrorKind::NotFound,
            message: "no audio output device available".to_string(),
        })?;

        let config = device
            .default_output_config()
            .map_err(|e| SessionError::Device {
                kind: classify_device_error(&e.to_string()),
                message: format!("failed to query output device: {}", e),
            })?;

        // The render path is rate- and layout-agnostic: every channel of a
        // frame carries the same mono signal at whatever rate the device
        // prefers.
        let sample_rate = config.sample_rate();
        let channels = config.channels() as usize;

        let scheduler = Arc::new(Mutex::new(Scheduler::new()));
        let clock_frames = Arc::new(AtomicU64::new(0));
        let handle = PlaybackHandle {
            scheduler: scheduler.clone(),
            clock_frames: clock_frames.clone(),
            sample_rate,
        };

        let err_fn = |err| eprintln!("[audio] output stream error: {}", err);

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => {
                let scheduler = scheduler.clone();
                let clock_frames = clock_frames.clone();
                let tap = tap.clone();
                let mut compressor = Compressor::new(sample_rate);
                let mut mono = Vec::new();
                device.build_output_stream(
                    &config.into(),
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let frames = data.len() / channels;
                        let t0 =
                            clock_frames.load(Ordering::Relaxed) as f64 / sample_rate as f64;
                        mono.resize(frames, 0.0);
                        if let Ok(mut sched) = scheduler.lock() {
                            sched.render(t0, sample_rate, &mut mono);
                        } else {
                            mono.fill(0.0);
                        }
                        let mut tapped = Vec::with_capacity(frames);
                        for (frame, sample) in data.chunks_mut(channels).zip(mono.iter()) {
                            let shaped = compressor.process(sample * OUTPUT_GAIN);
                            frame.fill(shaped);
                            tapped.push((shaped.clamp(-1.0, 1.0) * i16::MAX as f32) as i16);
                        }
                        tap.push(&tapped);
                        clock_frames.fetch_add(frames as u64, Ordering::Relaxed);
                    },
                    err_fn,
                    None,
                )
            }
            cpal::SampleFormat::I16 => {
                let scheduler = scheduler.clone();
                let clock_frames = clock_frames.clone();
                let tap = tap.clone();
                let mut compressor = Compressor::new(sample_rate);
                let mut mono = Vec::new();
                device.build_output_stream(
                    &config.into(),
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        let frames = data.len() / channels;
                        let t0 =
                            clock_frames.load(Ordering::Relaxed) as f64 / sample_rate as f64;
                        mono.resize(frames, 0.0);
                        if let Ok(mut sched) = scheduler.lock() {
                            sched.render(t0, sample_rate, &mut mono);
                        } else {
                            mono.fill(0.0);
                        }
                        let mut tapped = Vec::with_capacity(frames);
                        for (frame, sample) in data.chunks_mut(channels).zip(mono.iter()) {
                            let shaped = compressor.process(sample * OUTPUT_GAIN);
                            let quantized =
                                (shaped.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                            frame.fill(quantized);
                            tapped.push(quantized);
                        }
                        tap.push(&tapped);
                        clock_frames.fetch_add(frames as u64, Ordering::Relaxed);
                    },
                    err_fn,
                    None,
                )
            }
            other => {
                return Err(SessionError::Device {
                    kind: DeviceErrorKind::Other,
                    message: format!("unsupported output sample format: {:?}", other),
                })
            }
        }
        .map_err(|e| SessionError::Device {
            kind: classify_device_error(&e.to_string()),
            message: format!("failed to open audio output: {}", e),
        })?;

        stream.play().map_err(|e| SessionError::Device {
            kind: classify_device_error(&e.to_string()),
            message: format!("failed to start audio output: {}", e),
        })?;

        Ok(Self {
            handle,
            _stream: stream,
        })
    }

    pub fn handle(&self) -> PlaybackHandle {
        self.handle.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(seconds: f64, rate: u32) -> Vec<f32> {
        vec![0.5; (seconds * rate as f64) as usize]
    }

    #[test]
    fn back_to_back_when_producer_keeps_pace() {
        let mut sched = Scheduler::new();
        let (_, s1) = sched.schedule(0.0, chunk(0.5, 24_000), 24_000);
        let (_, s2) = sched.schedule(0.1, chunk(0.25, 24_000), 24_000);
        let (_, s3) = sched.schedule(0.2, chunk(0.25, 24_000), 24_000);
        assert_eq!(s1, 0.0);
        assert!((s2 - 0.5).abs() < 1e-9);
        assert!((s3 - 0.75).abs() < 1e-9);
        assert!((sched.next_start_time() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn start_times_are_non_decreasing() {
        let mut sched = Scheduler::new();
        let arrivals = [0.0, 0.3, 0.31, 2.0, 2.05];
        let mut last = 0.0;
        for &now in &arrivals {
            let (_, start) = sched.schedule(now, chunk(0.1, 24_000), 24_000);
            assert!(start >= last);
            assert!(start >= now);
            last = start;
        }
    }

    #[test]
    fn self_heals_when_stream_falls_behind() {
        let mut sched = Scheduler::new();
        sched.schedule(0.0, chunk(0.1, 24_000), 24_000);
        // Producer stalls; clock is now well past the queued audio.
        let (_, start) = sched.schedule(5.0, chunk(0.1, 24_000), 24_000);
        assert_eq!(start, 5.0);
        assert!((sched.next_start_time() - 5.1).abs() < 1e-9);
    }

    #[test]
    fn interruption_clears_in_flight_and_resets_cursor() {
        let mut sched = Scheduler::new();
        sched.schedule(0.0, chunk(1.0, 24_000), 24_000);
        sched.schedule(0.0, chunk(1.0, 24_000), 24_000);
        assert_eq!(sched.in_flight_count(), 2);

        sched.interrupt();
        assert_eq!(sched.in_flight_count(), 0);
        assert_eq!(sched.next_start_time(), 0.0);

        // Next unit starts at the live clock, not behind stale audio.
        let (_, start) = sched.schedule(3.0, chunk(0.1, 24_000), 24_000);
        assert_eq!(start, 3.0);
    }

    #[test]
    fn finish_removes_only_the_named_unit() {
        let mut sched = Scheduler::new();
        let (a, _) = sched.schedule(0.0, chunk(0.1, 24_000), 24_000);
        let (_b, _) = sched.schedule(0.0, chunk(0.1, 24_000), 24_000);
        sched.finish(a);
        assert_eq!(sched.in_flight_count(), 1);
    }

    #[test]
    fn render_is_gapless_across_unit_boundaries() {
        let mut sched = Scheduler::new();
        let rate = 24_000u32;
        sched.schedule(0.0, vec![0.5; 2400], rate); // 0.0 - 0.1s
        sched.schedule(0.0, vec![0.5; 2400], rate); // 0.1 - 0.2s

        let mut out = vec![0.0f32; 4800];
        sched.render(0.0, rate, &mut out);
        // Every sample inside the combined window is audible.
        for (i, &s) in out.iter().enumerate() {
            assert!(s > 0.0, "gap at sample {}", i);
        }
    }

    #[test]
    fn render_follows_arbitrary_device_rates() {
        // Devices are taken at their preferred rate; the render math must
        // not assume 48 kHz.
        let mut sched = Scheduler::new();
        sched.schedule(0.0, vec![0.5; 2400], 24_000); // 0.1 s of audio
        let mut out = vec![0.0f32; 4410]; // 0.1 s at 44.1 kHz
        sched.render(0.0, 44_100, &mut out);
        assert!(out.iter().all(|&s| s > 0.0));
        assert_eq!(sched.in_flight_count(), 0);
    }

    #[test]
    fn render_retires_finished_units() {
        let mut sched = Scheduler::new();
        sched.schedule(0.0, chunk(0.05, 24_000), 24_000);
        let mut out = vec![0.0f32; 4800]; // 0.1s at 48k
        sched.render(0.0, 48_000, &mut out);
        assert_eq!(sched.in_flight_count(), 0);
    }

    #[test]
    fn render_is_silent_with_nothing_scheduled() {
        let mut sched = Scheduler::new();
        let mut out = vec![1.0f32; 256];
        sched.render(0.0, 48_000, &mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn compressor_attenuates_above_threshold_only() {
        let mut comp = Compressor::new(48_000);
        // Loud steady signal settles to an attenuated level.
        let mut last = 1.0f32;
        for _ in 0..48_000 {
            last = comp.process(0.9);
        }
        assert!(last < 0.9);
        assert!(last > 0.0);

        // Quiet signal passes through at unity once the envelope releases.
        let mut comp = Compressor::new(48_000);
        let mut last = 0.0f32;
        for _ in 0..48_000 {
            last = comp.process(0.01);
        }
        assert!((last - 0.01).abs() < 1e-4);
    }
}
