//! Signal-level taps for the visual amplitude meter.
//!
//! Capture and playback callbacks push samples into their tap; the embedding
//! UI polls `level()` on its own render cadence. Taps are advisory only and
//! never feed back into the audio or transcript paths.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Samples kept in the sliding analysis window (~128 ms at 16 kHz).
const WINDOW_SAMPLES: usize = 2048;

/// A non-mutating tap on one audio path. Holds a short window of recent
/// samples and reports their mean magnitude scaled to 0-255.
pub struct LevelTap {
    window: Mutex<VecDeque<i16>>,
}

impl LevelTap {
    pub fn new() -> Self {
        Self {
            window: Mutex::new(VecDeque::with_capacity(WINDOW_SAMPLES)),
        }
    }

    pub fn push(&self, samples: &[i16]) {
        let Ok(mut window) = self.window.lock() else {
            return;
        };
        for &sample in samples {
            if window.len() == WINDOW_SAMPLES {
                window.pop_front();
            }
            window.push_back(sample);
        }
    }

    /// Current level, 0-255. Empty window reports 0.
    pub fn level(&self) -> u8 {
        let Ok(window) = self.window.lock() else {
            return 0;
        };
        if window.is_empty() {
            return 0;
        }
        let sum: u64 = window.iter().map(|&s| (s as i32).unsigned_abs() as u64).sum();
        let mean = sum as f64 / window.len() as f64 / 32768.0;
        (mean * 255.0).round().min(255.0) as u8
    }

    pub fn reset(&self) {
        if let Ok(mut window) = self.window.lock() {
            window.clear();
        }
    }
}

impl Default for LevelTap {
    fn default() -> Self {
        Self::new()
    }
}

/// Combined meter reading: the louder of the two paths.
pub fn combined_level(input: &LevelTap, output: &LevelTap) -> u8 {
    input.level().max(output.level())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_reports_zero() {
        let tap = LevelTap::new();
        assert_eq!(tap.level(), 0);
        tap.push(&[0i16; 512]);
        assert_eq!(tap.level(), 0);
    }

    #[test]
    fn full_scale_reports_max() {
        let tap = LevelTap::new();
        tap.push(&vec![i16::MAX; WINDOW_SAMPLES]);
        assert_eq!(tap.level(), 255);
    }

    #[test]
    fn level_scales_with_amplitude() {
        let quiet = LevelTap::new();
        quiet.push(&vec![1000i16; 512]);
        let loud = LevelTap::new();
        loud.push(&vec![20000i16; 512]);
        assert!(loud.level() > quiet.level());
    }

    #[test]
    fn window_slides_past_old_audio() {
        let tap = LevelTap::new();
        tap.push(&vec![i16::MAX; WINDOW_SAMPLES]);
        tap.push(&vec![0i16; WINDOW_SAMPLES]);
        assert_eq!(tap.level(), 0);
    }

    #[test]
    fn combined_takes_the_louder_tap() {
        let input = LevelTap::new();
        let output = LevelTap::new();
        input.push(&vec![2000i16; 256]);
        output.push(&vec![20000i16; 256]);
        assert_eq!(combined_level(&input, &output), output.level());
    }

    #[test]
    fn reset_clears_the_window() {
        let tap = LevelTap::new();
        tap.push(&vec![20000i16; 256]);
        tap.reset();
        assert_eq!(tap.level(), 0);
    }
}
