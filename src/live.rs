//! WebSocket transport for the Gemini Live API.
//!
//! Blocking tungstenite socket over TLS. Setup runs with long read timeouts;
//! the session loop then switches the socket to short-timeout polling so one
//! thread can interleave outbound frames and inbound events.

use anyhow::Result;
use native_tls::TlsStream;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tungstenite::WebSocket;

use crate::audio::pcm::EncodedBlob;
use crate::config::Voice;

/// Native audio model behind the live endpoint.
pub const LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";

/// Bound on waiting for the server's setup acknowledgment.
const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

pub type LiveSocket = WebSocket<TlsStream<TcpStream>>;

/// Create the TLS WebSocket connection to the live endpoint.
pub fn connect_live_websocket(api_key: &str) -> Result<LiveSocket> {
    let ws_url = format!(
        "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent?key={}",
        api_key
    );

    let url = url::Url::parse(&ws_url)?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("No host in URL"))?;
    let port = 443;

    use std::net::ToSocketAddrs;
    let addr = format!("{}:{}", host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve hostname: {}", host))?;

    let tcp_stream = TcpStream::connect_timeout(&addr, Duration::from_secs(10))?;
    tcp_stream.set_read_timeout(Some(Duration::from_secs(30)))?;
    tcp_stream.set_write_timeout(Some(Duration::from_secs(30)))?;
    tcp_stream.set_nodelay(true)?;

    let connector = native_tls::TlsConnector::new()?;
    let tls_stream = connector.connect(host, tcp_stream)?;

    let (socket, _response) = tungstenite::client::client(&ws_url, tls_stream)?;

    Ok(socket)
}

/// Drop the read timeout to polling cadence for the session loop.
pub fn set_socket_nonblocking(socket: &mut LiveSocket) -> Result<()> {
    let stream = socket.get_mut();
    let tcp_stream = stream.get_mut();
    tcp_stream.set_read_timeout(Some(Duration::from_millis(50)))?;
    Ok(())
}

/// Send the one-time session setup: voice, persona instruction, audio
/// response modality, and streaming transcription for both directions.
pub fn send_setup(socket: &mut LiveSocket, voice: Voice, instruction: &str) -> Result<()> {
    let mut setup = serde_json::json!({
        "setup": {
            "model": format!("models/{}", LIVE_MODEL),
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": {
                            "voiceName": voice.wire_name()
                        }
                    }
                }
            },
            "inputAudioTranscription": {},
            "outputAudioTranscription": {}
        }
    });

    if !instruction.trim().is_empty() {
        setup["setup"]["systemInstruction"] = serde_json::json!({
            "parts": [{
                "text": instruction
            }]
        });
    }

    socket.write(tungstenite::Message::Text(setup.to_string().into()))?;
    socket.flush()?;

    Ok(())
}

/// Block until the server acknowledges setup, a bounded wait. `stop` aborts
/// early (disconnect during connect).
pub fn wait_setup_complete(socket: &mut LiveSocket, stop: &AtomicBool) -> Result<()> {
    let setup_start = Instant::now();
    loop {
        if stop.load(Ordering::Relaxed) {
            return Err(anyhow::anyhow!("cancelled"));
        }

        match socket.read() {
            Ok(tungstenite::Message::Text(msg)) => {
                let msg_str = msg.as_str();
                if is_setup_complete(msg_str) {
                    return Ok(());
                }
                if let Some(error) = parse_error(msg_str) {
                    return Err(anyhow::anyhow!("server rejected setup: {}", error));
                }
            }
            Ok(tungstenite::Message::Binary(data)) => {
                if let Ok(text) = String::from_utf8(data.to_vec()) {
                    if is_setup_complete(&text) {
                        return Ok(());
                    }
                    if let Some(error) = parse_error(&text) {
                        return Err(anyhow::anyhow!("server rejected setup: {}", error));
                    }
                }
            }
            Ok(tungstenite::Message::Close(frame)) => {
                let info = frame
                    .map(|f| format!("code={}, reason={}", f.code, f.reason))
                    .unwrap_or_else(|| "no close frame".to_string());
                return Err(anyhow::anyhow!("connection closed during setup: {}", info));
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                if setup_start.elapsed() > SETUP_TIMEOUT {
                    return Err(anyhow::anyhow!("setup timeout - no response from server"));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Send one encoded audio frame as a realtime media chunk.
pub fn send_media(socket: &mut LiveSocket, blob: &EncodedBlob) -> Result<()> {
    let msg = serde_json::json!({
        "realtimeInput": {
            "mediaChunks": [{
                "data": blob.data,
                "mimeType": blob.mime_type
            }]
        }
    });

    socket.write(tungstenite::Message::Text(msg.to_string().into()))?;
    socket.flush()?;

    Ok(())
}

/// Inbound events the session consumes, in dispatch order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Barge-in upstream: stop playback immediately.
    Interrupted,
    /// Speech-to-text delta of what the user said.
    InputDelta(String),
    /// Speech-to-text delta of what the model is saying.
    OutputDelta(String),
    /// Base64 PCM of model speech. Decoded by the session so malformed
    /// payloads can be dropped without killing the reader.
    Audio(String),
    /// The model finished its turn.
    TurnComplete,
}

/// Extract the consumed subset of serverContent from one message. A single
/// message may carry several fields; events come out in dispatch order with
/// turnComplete last.
pub fn parse_server_events(msg: &str) -> Vec<ServerEvent> {
    let mut events = Vec::new();

    let Ok(json) = serde_json::from_str::<serde_json::Value>(msg) else {
        return events;
    };
    let Some(server_content) = json.get("serverContent") else {
        return events;
    };

    if server_content
        .get("interrupted")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        events.push(ServerEvent::Interrupted);
    }

    if let Some(text) = server_content
        .get("inputTranscription")
        .and_then(|t| t.get("text"))
        .and_then(|t| t.as_str())
    {
        if !text.is_empty() {
            events.push(ServerEvent::InputDelta(text.to_string()));
        }
    }

    if let Some(text) = server_content
        .get("outputTranscription")
        .and_then(|t| t.get("text"))
        .and_then(|t| t.as_str())
    {
        if !text.is_empty() {
            events.push(ServerEvent::OutputDelta(text.to_string()));
        }
    }

    if let Some(parts) = server_content
        .get("modelTurn")
        .and_then(|t| t.get("parts"))
        .and_then(|p| p.as_array())
    {
        for part in parts {
            if let Some(data) = part
                .get("inlineData")
                .and_then(|d| d.get("data"))
                .and_then(|d| d.as_str())
            {
                events.push(ServerEvent::Audio(data.to_string()));
            }
        }
    }

    if server_content
        .get("turnComplete")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        events.push(ServerEvent::TurnComplete);
    }

    events
}

pub fn is_setup_complete(msg: &str) -> bool {
    msg.contains("setupComplete")
}

/// Top-level error object, if the message carries one.
pub fn parse_error(msg: &str) -> Option<String> {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(msg) {
        if let Some(error) = json.get("error") {
            if let Some(message) = error.get("message").and_then(|m| m.as_str()) {
                return Some(message.to_string());
            }
            return Some(error.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_interleaved_server_content() {
        let msg = serde_json::json!({
            "serverContent": {
                "modelTurn": { "parts": [{ "inlineData": { "data": "QUJD" } }] },
                "outputTranscription": { "text": "Hel" },
                "turnComplete": false
            }
        })
        .to_string();

        let events = parse_server_events(&msg);
        assert_eq!(
            events,
            vec![
                ServerEvent::OutputDelta("Hel".to_string()),
                ServerEvent::Audio("QUJD".to_string()),
            ]
        );
    }

    #[test]
    fn interrupted_comes_first_and_turn_complete_last() {
        let msg = serde_json::json!({
            "serverContent": {
                "interrupted": true,
                "inputTranscription": { "text": "wait" },
                "turnComplete": true
            }
        })
        .to_string();

        let events = parse_server_events(&msg);
        assert_eq!(events.first(), Some(&ServerEvent::Interrupted));
        assert_eq!(events.last(), Some(&ServerEvent::TurnComplete));
        assert!(events.contains(&ServerEvent::InputDelta("wait".to_string())));
    }

    #[test]
    fn empty_deltas_are_skipped() {
        let msg = serde_json::json!({
            "serverContent": { "inputTranscription": { "text": "" } }
        })
        .to_string();
        assert!(parse_server_events(&msg).is_empty());
    }

    #[test]
    fn non_server_content_messages_yield_nothing() {
        assert!(parse_server_events("{\"setupComplete\": {}}").is_empty());
        assert!(parse_server_events("not json").is_empty());
    }

    #[test]
    fn parse_error_extracts_message() {
        let msg = serde_json::json!({
            "error": { "message": "quota exceeded", "code": 429 }
        })
        .to_string();
        assert_eq!(parse_error(&msg), Some("quota exceeded".to_string()));
        assert_eq!(parse_error("{\"serverContent\": {}}"), None);
    }

    #[test]
    fn setup_complete_detection() {
        assert!(is_setup_complete("{\"setupComplete\": {}}"));
        assert!(!is_setup_complete("{\"serverContent\": {}}"));
    }
}
