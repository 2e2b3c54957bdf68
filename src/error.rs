//! Error taxonomy for the tutor client.
//!
//! Nothing here is process-fatal: a permission or connection failure ends
//! one session attempt, a decode failure drops one audio chunk, a storage
//! failure falls back to in-memory state.

use thiserror::Error;

/// Why the microphone (or camera) could not be acquired.
///
/// Callers surface a distinct message per case; retry is always manual.
#[derive(Debug, Error)]
pub enum MediaAccessError {
    /// Access was explicitly denied by the user or the OS.
    #[error("microphone access was denied. Enable it in your system settings and try again")]
    Denied,

    /// No usable capture device is present.
    #[error("no microphone was found. Connect one and try again")]
    NotFound,

    /// Anything else the audio backend reported.
    #[error("audio device error: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum TutorError {
    /// Device acquisition failed; terminal for this session start.
    #[error("{0}")]
    Permission(#[from] MediaAccessError),

    /// The live session could not be established or dropped.
    /// Surfaced to the user; there is no automatic reconnect.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A malformed audio payload. The offending chunk is dropped and
    /// playback continues with subsequent chunks.
    #[error("audio decode failed: {0}")]
    Decode(String),

    /// Persistence read/write failure; the session continues with
    /// in-memory state for that cycle.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl TutorError {
    /// Classify an audio-backend error string into the permission taxonomy.
    /// cpal reports denial through backend-specific messages, so this is a
    /// string match rather than a variant match.
    pub fn from_device_error(msg: String) -> Self {
        let lower = msg.to_lowercase();
        if lower.contains("denied") || lower.contains("permission") {
            TutorError::Permission(MediaAccessError::Denied)
        } else if lower.contains("no device") || lower.contains("not found") {
            TutorError::Permission(MediaAccessError::NotFound)
        } else {
            TutorError::Permission(MediaAccessError::Other(msg))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_errors_triage_to_distinct_cases() {
        let denied = TutorError::from_device_error("Access denied by policy".into());
        assert!(matches!(
            denied,
            TutorError::Permission(MediaAccessError::Denied)
        ));

        let missing = TutorError::from_device_error("requested device not found".into());
        assert!(matches!(
            missing,
            TutorError::Permission(MediaAccessError::NotFound)
        ));

        let other = TutorError::from_device_error("ALSA underrun".into());
        assert!(matches!(
            other,
            TutorError::Permission(MediaAccessError::Other(_))
        ));
    }

    #[test]
    fn messages_are_distinct_per_case() {
        let a = MediaAccessError::Denied.to_string();
        let b = MediaAccessError::NotFound.to_string();
        let c = MediaAccessError::Other("x".into()).to_string();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }
}
