//! Session lifecycle state machine.
//!
//! One `Session` owns the whole realtime stack: microphone capture, the
//! live websocket, playback scheduling, transcript reconciliation, and the
//! level taps. `connect()` brings everything up in order and tears it all
//! down through one idempotent cleanup path on any failure. A single I/O
//! thread interleaves outbound audio frames with inbound server events, so
//! every piece of shared state is touched from at most two well-ordered
//! places.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc, Arc, Mutex,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::audio::capture::{CapturePipeline, FrameSource, CAPTURE_TICK_MS};
use crate::audio::meter::{combined_level, LevelTap};
use crate::audio::pcm::{self, OUTPUT_SAMPLE_RATE};
use crate::audio::playback::{PlaybackEngine, PlaybackHandle};
use crate::config::Config;
use crate::error::{is_benign_disconnect, DeviceErrorKind, SessionError};
use crate::live::{self, LiveSocket, ServerEvent};
use crate::transcript::{TranscriptMessage, TranscriptReconciler};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// State shared with the I/O thread.
struct SharedState {
    state: Mutex<ConnectionState>,
    error: Mutex<Option<String>>,
    transcript: Mutex<TranscriptReconciler>,
}

impl SharedState {
    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    fn set_error(&self, message: String) {
        if let Ok(mut error) = self.error.lock() {
            *error = Some(message);
        }
    }
}

/// The single live voice conversation. At most one connection at a time;
/// call `disconnect()` before connecting again while one is active.
/// Reconnecting after a failed attempt needs no explicit disconnect.
pub struct Session {
    config: Config,
    shared: Arc<SharedState>,
    stop: Arc<AtomicBool>,
    input_tap: Arc<LevelTap>,
    output_tap: Arc<LevelTap>,
    audio_thread: Option<JoinHandle<()>>,
    io_thread: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shared: Arc::new(SharedState {
                state: Mutex::new(ConnectionState::Disconnected),
                error: Mutex::new(None),
                transcript: Mutex::new(TranscriptReconciler::new()),
            }),
            stop: Arc::new(AtomicBool::new(false)),
            input_tap: Arc::new(LevelTap::new()),
            output_tap: Arc::new(LevelTap::new()),
            audio_thread: None,
            io_thread: None,
        }
    }

    /// Bring the session up: output graph, microphone, transport, then
    /// start streaming frames. Any failure funnels through cleanup and
    /// leaves a user-facing message in `error()`.
    pub fn connect(&mut self) -> Result<(), SessionError> {
        match self.state() {
            // A failed connect already tore everything down; reconnecting
            // from Error is allowed.
            ConnectionState::Disconnected | ConnectionState::Error => {}
            _ => {
                return Err(SessionError::Configuration(
                    "a session is already active; disconnect first".to_string(),
                ))
            }
        }

        // Guard: no credential, no resources. State stays Disconnected and
        // the microphone is never touched.
        let api_key = self.config.resolved_api_key();
        if api_key.trim().is_empty() {
            let err = SessionError::missing_api_key();
            self.shared.set_error(err.to_string());
            return Err(err);
        }

        self.stop.store(false, Ordering::SeqCst);
        if let Ok(mut error) = self.shared.error.lock() {
            *error = None;
        }
        if let Ok(mut transcript) = self.shared.transcript.lock() {
            transcript.reset();
        }
        self.shared.set_state(ConnectionState::Connecting);

        let (audio_thread, ready) = spawn_audio_owner(
            self.input_tap.clone(),
            self.output_tap.clone(),
            self.stop.clone(),
        );
        self.audio_thread = Some(audio_thread);
        let (playback_handle, frames) = match ready.recv() {
            Ok(Ok(handles)) => handles,
            Ok(Err(e)) => return Err(self.fail_connect(e)),
            Err(_) => {
                return Err(self.fail_connect(SessionError::Device {
                    kind: DeviceErrorKind::Other,
                    message: "audio setup thread exited unexpectedly".to_string(),
                }))
            }
        };

        println!("[session] connecting to live endpoint...");
        let mut socket = live::connect_live_websocket(&api_key)
            .map_err(|e| self.fail_connect(SessionError::TransportOpen(e.to_string())))?;

        live::send_setup(&mut socket, self.config.voice, &self.config.persona)
            .map_err(|e| self.fail_connect(SessionError::TransportOpen(e.to_string())))?;

        if let Err(e) = live::wait_setup_complete(&mut socket, &self.stop) {
            if self.stop.load(Ordering::Relaxed) {
                // disconnect() raced the handshake; unwind quietly.
                self.cleanup();
                return Err(SessionError::TransportOpen("cancelled".to_string()));
            }
            return Err(self.fail_connect(SessionError::TransportOpen(e.to_string())));
        }

        live::set_socket_nonblocking(&mut socket)
            .map_err(|e| self.fail_connect(SessionError::TransportOpen(e.to_string())))?;

        // Transport is open: wire capture output to it and start the event
        // loop.
        frames.set_streaming(true);
        let ctx = IoContext {
            shared: self.shared.clone(),
            stop: self.stop.clone(),
            frames,
            playback: playback_handle,
            input_tap: self.input_tap.clone(),
            output_tap: self.output_tap.clone(),
        };
        self.io_thread = Some(std::thread::spawn(move || run_io_loop(socket, ctx)));

        self.shared.set_state(ConnectionState::Connected);
        println!("[session] connected");
        Ok(())
    }

    /// Request close of the transport (best effort) and tear everything
    /// down. Safe to call at any point during or after connect().
    pub fn disconnect(&mut self) {
        self.cleanup();
    }

    /// Idempotent teardown, safe from any state including partial
    /// initialization: stop in-flight playback, stop the microphone, close
    /// both audio graphs, clear refs, reset volume and accumulators.
    pub fn cleanup(&mut self) {
        self.stop.store(true, Ordering::SeqCst);

        // Producers first: the I/O thread closes the socket on exit, then
        // the audio owner drops both streams, releasing the devices.
        if let Some(io) = self.io_thread.take() {
            let _ = io.join();
        }
        if let Some(audio) = self.audio_thread.take() {
            let _ = audio.join();
        }

        self.input_tap.reset();
        self.output_tap.reset();
        if let Ok(mut transcript) = self.shared.transcript.lock() {
            transcript.clear_accumulators();
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    fn fail_connect(&mut self, err: SessionError) -> SessionError {
        eprintln!("[session] connect failed: {}", err);
        self.cleanup();
        self.shared.set_error(err.to_string());
        self.shared.set_state(ConnectionState::Error);
        err
    }

    pub fn state(&self) -> ConnectionState {
        self.shared
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Error)
    }

    /// Current meter level, 0-255. Reads a live snapshot of both analysis
    /// taps; reports 0 while not connected.
    pub fn volume(&self) -> u8 {
        if self.state() == ConnectionState::Connected {
            combined_level(&self.input_tap, &self.output_tap)
        } else {
            0
        }
    }

    pub fn error(&self) -> Option<String> {
        self.shared.error.lock().map(|e| e.clone()).unwrap_or(None)
    }

    /// Ordered snapshot of the conversation log.
    pub fn transcript(&self) -> Vec<TranscriptMessage> {
        self.shared
            .transcript
            .lock()
            .map(|t| t.snapshot())
            .unwrap_or_default()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Everything the I/O thread needs; deliberately free of the non-Send
/// stream handles, which live on the audio owner thread.
struct IoContext {
    shared: Arc<SharedState>,
    stop: Arc<AtomicBool>,
    frames: FrameSource,
    playback: PlaybackHandle,
    input_tap: Arc<LevelTap>,
    output_tap: Arc<LevelTap>,
}

impl IoContext {
    /// Cleanup for teardown initiated by the transport. Raising `stop`
    /// makes the audio owner thread drop both streams, so the devices are
    /// released without any call from the embedder.
    fn teardown(&self, terminal_state: ConnectionState) {
        self.stop.store(true, Ordering::SeqCst);
        self.playback.interrupt();
        self.input_tap.reset();
        self.output_tap.reset();
        if let Ok(mut transcript) = self.shared.transcript.lock() {
            transcript.clear_accumulators();
        }
        self.shared.set_state(terminal_state);
    }
}

/// Open both audio graphs on their own thread and keep the non-Send cpal
/// streams there until the stop flag rises. Handles for the I/O thread come
/// back over the channel once both devices are up.
fn spawn_audio_owner(
    input_tap: Arc<LevelTap>,
    output_tap: Arc<LevelTap>,
    stop: Arc<AtomicBool>,
) -> (
    JoinHandle<()>,
    mpsc::Receiver<Result<(PlaybackHandle, FrameSource), SessionError>>,
) {
    let (tx, rx) = mpsc::channel();
    let handle = std::thread::spawn(move || {
        let playback = match PlaybackEngine::start(output_tap) {
            Ok(engine) => engine,
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        };
        let capture = match CapturePipeline::open(input_tap, stop.clone()) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        };
        let _ = tx.send(Ok((playback.handle(), capture.frame_source())));
        hold_audio_until_stopped((capture, playback), &stop);
    });
    (handle, rx)
}

/// Park until the stop flag rises, then drop the audio resources. Dropping
/// the streams stops the microphone tracks and closes the output device, so
/// transport-initiated teardown needs nothing from the embedder.
fn hold_audio_until_stopped<T>(resources: T, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(50));
    }
    drop(resources);
}

/// One loop serves both directions: drains captured frames on a fixed tick
/// and polls the socket for server events, in strict arrival order.
fn run_io_loop(mut socket: LiveSocket, ctx: IoContext) {
    let tick = Duration::from_millis(CAPTURE_TICK_MS);
    let mut last_send = Instant::now();

    loop {
        if ctx.stop.load(Ordering::Relaxed) {
            break;
        }

        // Outbound: one media chunk per tick while audio is flowing.
        if last_send.elapsed() >= tick {
            let samples = ctx.frames.drain();
            if !samples.is_empty() {
                let blob = pcm::encode_samples(&samples);
                if let Err(e) = live::send_media(&mut socket, &blob) {
                    if ctx.stop.load(Ordering::Relaxed) {
                        break;
                    }
                    // Non-fatal to capture; the read path decides when the
                    // connection is actually gone.
                    eprintln!("[live] send failed: {}", e);
                }
            }
            last_send = Instant::now();
        }

        // Inbound: events handled in delivery order.
        match socket.read() {
            Ok(tungstenite::Message::Text(msg)) => {
                if !handle_message(msg.as_str(), &ctx) {
                    break;
                }
            }
            Ok(tungstenite::Message::Binary(data)) => {
                // The endpoint sometimes delivers JSON in binary frames.
                if let Ok(text) = String::from_utf8(data.to_vec()) {
                    if !handle_message(&text, &ctx) {
                        break;
                    }
                }
            }
            Ok(tungstenite::Message::Close(_)) => {
                println!("[live] connection closed by server");
                ctx.teardown(ConnectionState::Disconnected);
                break;
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                // Polling timeout, nothing to read.
            }
            Err(e) => {
                let message = e.to_string();
                if ctx.stop.load(Ordering::Relaxed) || is_benign_disconnect(&message) {
                    ctx.teardown(ConnectionState::Disconnected);
                } else {
                    eprintln!("[live] {}", SessionError::TransportRuntime(message));
                    ctx.shared
                        .set_error("Connection to the voice service was lost.".to_string());
                    ctx.teardown(ConnectionState::Error);
                }
                break;
            }
        }

        std::thread::sleep(Duration::from_millis(5));
    }

    let _ = socket.close(None);
}

/// Dispatch one inbound message. Returns false when the session should
/// stop.
fn handle_message(msg: &str, ctx: &IoContext) -> bool {
    if let Some(error) = live::parse_error(msg) {
        eprintln!("[live] server error: {}", error);
        ctx.shared
            .set_error("The voice service reported an error.".to_string());
        ctx.teardown(ConnectionState::Error);
        return false;
    }

    for event in live::parse_server_events(msg) {
        dispatch_server_event(event, &ctx.playback, &ctx.shared.transcript);
    }
    true
}

/// Apply one server event to the playback scheduler and the transcript
/// reconciler.
fn dispatch_server_event(
    event: ServerEvent,
    playback: &PlaybackHandle,
    transcript: &Mutex<TranscriptReconciler>,
) {
    match event {
        ServerEvent::Interrupted => {
            playback.interrupt();
            if let Ok(mut t) = transcript.lock() {
                t.interrupt();
            }
        }
        ServerEvent::Audio(data) => match decode_model_audio(&data) {
            Ok(samples) => playback.enqueue(samples, OUTPUT_SAMPLE_RATE),
            Err(e) => {
                // Malformed payloads are dropped; the session survives.
                eprintln!("[live] dropping audio chunk: {}", e);
            }
        },
        ServerEvent::InputDelta(text) => {
            if let Ok(mut t) = transcript.lock() {
                t.input_delta(&text);
            }
        }
        ServerEvent::OutputDelta(text) => {
            if let Ok(mut t) = transcript.lock() {
                t.output_delta(&text);
            }
        }
        ServerEvent::TurnComplete => {
            if let Ok(mut t) = transcript.lock() {
                t.turn_complete();
            }
        }
    }
}

fn decode_model_audio(data: &str) -> Result<Vec<f32>, SessionError> {
    let bytes = pcm::decode_base64(data)?;
    pcm::bytes_to_f32(&bytes)
}
