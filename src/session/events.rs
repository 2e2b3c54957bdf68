//! Wire-level messages exchanged with the live tutoring session.

use serde_json::Value;

/// One tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// One inbound server message, with every optional sub-field the session
/// may carry. Fields arrive in any combination; the reducer handles each
/// independently, in this order.
#[derive(Debug, Clone, Default)]
pub struct ServerEvent {
    /// Fragment of the student's transcribed speech.
    pub input_transcription: Option<String>,
    /// Fragment of the tutor's transcribed speech.
    pub output_transcription: Option<String>,
    /// The student spoke over the model; in-flight playback must drop.
    pub interrupted: bool,
    /// Tool invocations to interpret and acknowledge.
    pub tool_calls: Vec<ToolCall>,
    /// The current turn finished.
    pub turn_complete: bool,
    /// Inline model audio, base64 PCM at 24 kHz.
    pub audio: Option<String>,
}

impl ServerEvent {
    /// True when the message carried nothing the reducer acts on.
    pub fn is_empty(&self) -> bool {
        self.input_transcription.is_none()
            && self.output_transcription.is_none()
            && !self.interrupted
            && self.tool_calls.is_empty()
            && !self.turn_complete
            && self.audio.is_none()
    }
}
