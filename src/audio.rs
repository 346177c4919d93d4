//! Audio engine: wire codec, microphone capture, playback scheduling, and
//! level metering.

pub mod capture;
pub mod meter;
pub mod pcm;
pub mod playback;
