//! PCM codec for the live audio wire format.
//!
//! Outbound audio is 16 kHz mono 16-bit little-endian PCM, base64 encoded
//! inside a JSON frame. Inbound model audio is the same layout at 24 kHz.

use base64::{engine::general_purpose, Engine as _};

use crate::error::SessionError;

/// Sample rate the model expects for microphone audio.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of audio coming back from the model.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Transport-ready representation of one audio frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedBlob {
    /// Base64 of little-endian 16-bit PCM.
    pub data: String,
    /// Declared format, e.g. "audio/pcm;rate=16000".
    pub mime_type: String,
}

impl EncodedBlob {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn input_mime() -> String {
    format!("audio/pcm;rate={}", INPUT_SAMPLE_RATE)
}

/// Encode float samples in [-1, 1] as a transport blob. Values outside the
/// range are clamped. An empty input produces an empty blob.
pub fn encode_frame(samples: &[f32]) -> EncodedBlob {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Scale by 32768 so the decode side's /32768 inverts it within one
        // quantization step; the top of the range clamps to i16::MAX.
        let quantized = (sample * 32768.0).clamp(-32768.0, 32767.0) as i16;
        bytes.extend_from_slice(&quantized.to_le_bytes());
    }
    EncodedBlob {
        data: general_purpose::STANDARD.encode(&bytes),
        mime_type: input_mime(),
    }
}

/// Encode already-quantized samples. The capture callback quantizes in
/// place, so the tick path uses this variant.
pub fn encode_samples(samples: &[i16]) -> EncodedBlob {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    EncodedBlob {
        data: general_purpose::STANDARD.encode(&bytes),
        mime_type: input_mime(),
    }
}

/// Decode a base64 payload into raw bytes.
pub fn decode_base64(data: &str) -> Result<Vec<u8>, SessionError> {
    general_purpose::STANDARD
        .decode(data)
        .map_err(|e| SessionError::Decode(format!("invalid base64 audio: {}", e)))
}

/// Reinterpret bytes as little-endian 16-bit PCM and normalize to f32.
pub fn bytes_to_f32(bytes: &[u8]) -> Result<Vec<f32>, SessionError> {
    if bytes.len() % 2 != 0 {
        return Err(SessionError::Decode(format!(
            "PCM payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}
