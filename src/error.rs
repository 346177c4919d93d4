//! Error taxonomy for the voice session engine.
//!
//! Fatal categories (configuration, device, transport-open) abort a connect
//! attempt and funnel through the same cleanup path. Runtime transport errors
//! surface a short user-facing message unless classified benign. Decode
//! errors drop the offending message and leave the session running.

use std::fmt;

use thiserror::Error;

/// Why microphone acquisition failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    PermissionDenied,
    NotFound,
    Other,
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceErrorKind::PermissionDenied => write!(f, "permission denied"),
            DeviceErrorKind::NotFound => write!(f, "not found"),
            DeviceErrorKind::Other => write!(f, "other"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    /// Missing credential or invalid session usage. Pre-empts connect; no
    /// resources are created.
    #[error("{0}")]
    Configuration(String),

    /// Microphone acquisition failed. Fatal to the connect attempt.
    #[error("microphone unavailable ({kind}): {message}")]
    Device {
        kind: DeviceErrorKind,
        message: String,
    },

    /// The live websocket could not be opened or set up.
    #[error("failed to open live session: {0}")]
    TransportOpen(String),

    /// The live connection failed after it was established.
    #[error("connection problem: {0}")]
    TransportRuntime(String),

    /// Malformed inbound audio or text payload.
    #[error("malformed payload: {0}")]
    Decode(String),
}

impl SessionError {
    /// Message for the "API key is missing" scenario, shared by connect()
    /// and the front-end so the wording stays consistent.
    pub fn missing_api_key() -> Self {
        SessionError::Configuration(
            "API key is missing. Set gemini_api_key in the config file or export GEMINI_API_KEY."
                .to_string(),
        )
    }
}

/// Classify a cpal error message into the device error subtypes.
///
/// cpal surfaces backend errors as strings; this matches the phrases the
/// common backends produce for denied access and missing devices.
pub fn classify_device_error(message: &str) -> DeviceErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("access denied") || lower.contains("denied") {
        DeviceErrorKind::PermissionDenied
    } else if lower.contains("no device")
        || lower.contains("not found")
        || lower.contains("no input")
        || lower.contains("unavailable")
    {
        DeviceErrorKind::NotFound
    } else {
        DeviceErrorKind::Other
    }
}

/// True for transport failures that happen as a natural side effect of
/// closing the connection. These never reach the user-visible error field.
pub fn is_benign_disconnect(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("reset")
        || lower.contains("closed")
        || lower.contains("broken pipe")
        || lower.contains("connection aborted")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_classification() {
        assert_eq!(
            classify_device_error("Access denied by the OS"),
            DeviceErrorKind::PermissionDenied
        );
        assert_eq!(
            classify_device_error("no input device available"),
            DeviceErrorKind::NotFound
        );
        assert_eq!(
            classify_device_error("backend exploded"),
            DeviceErrorKind::Other
        );
    }

    #[test]
    fn benign_disconnects_are_recognized() {
        assert!(is_benign_disconnect("Connection reset by peer"));
        assert!(is_benign_disconnect("stream closed"));
        assert!(is_benign_disconnect("Broken pipe (os error 32)"));
        assert!(!is_benign_disconnect("TLS handshake failed"));
    }

    #[test]
    fn missing_key_message_is_user_facing() {
        let err = SessionError::missing_api_key();
        assert!(err.to_string().starts_with("API key is missing"));
    }
}
