//! Realtime voice conversation client for the Gemini Live API.
//!
//! Captures microphone audio, streams it to the live endpoint as 16 kHz
//! PCM, plays the model's spoken replies back gaplessly, and reconciles the
//! two transcription streams into one ordered conversation log. The
//! embedding UI talks to a single [`session::Session`]:
//! connect / disconnect / state / volume / error / transcript.

pub mod audio;
pub mod config;
pub mod error;
pub mod live;
pub mod session;
pub mod transcript;

pub use config::{Config, Voice};
pub use error::{DeviceErrorKind, SessionError};
pub use session::{ConnectionState, Session};
pub use transcript::{Role, TranscriptMessage};
