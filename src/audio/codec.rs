//! Pure codec helpers shared by the capture and playback paths:
//! base64 transport encoding and raw PCM conversions.

use base64::{engine::general_purpose, Engine as _};

use crate::error::TutorError;

/// Microphone audio is streamed to the model as 16 kHz mono PCM.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Model audio arrives as 24 kHz mono PCM.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// MIME descriptor sent with every microphone chunk.
pub const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";

pub fn encode_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

pub fn decode_base64(data: &str) -> Result<Vec<u8>, TutorError> {
    general_purpose::STANDARD
        .decode(data)
        .map_err(|e| TutorError::Decode(format!("invalid base64: {}", e)))
}

/// Convert one window of float samples in [-1, 1] to little-endian 16-bit
/// PCM bytes by scaling by 32768. Known limitation: out-of-range input
/// saturates silently; upstream is expected to stay in range.
pub fn pcm16_bytes_from_f32(window: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(window.len() * 2);
    for &sample in window {
        let value = (sample * 32768.0) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Reassemble little-endian 16-bit PCM bytes into samples. A trailing odd
/// byte means the payload was truncated in transit.
pub fn samples_from_pcm16_bytes(bytes: &[u8]) -> Result<Vec<i16>, TutorError> {
    if bytes.len() % 2 != 0 {
        return Err(TutorError::Decode(format!(
            "PCM payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// A decoded audio chunk ready for scheduling at a known sample rate.
#[derive(Debug, Clone)]
pub struct PlayableBuffer {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl PlayableBuffer {
    /// Decode a base64 PCM chunk as received from the live session.
    pub fn from_base64(data: &str, sample_rate: u32) -> Result<Self, TutorError> {
        let bytes = decode_base64(data)?;
        let samples = samples_from_pcm16_bytes(&bytes)?;
        Ok(PlayableBuffer {
            samples,
            sample_rate,
        })
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}
