//! WebSocket transport for the Gemini Live tutoring session.
//!
//! One duplex connection per session: microphone chunks and still frames go
//! up as realtime media, transcriptions / tool calls / audio come back as
//! server messages. Connection failures are terminal for the session; the
//! caller surfaces them and there is no automatic reconnect.

use anyhow::Result;
use native_tls::TlsStream;
use serde_json::Value;
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tungstenite::WebSocket;

use super::events::{ServerEvent, ToolCall};
use crate::config::Config;
use crate::error::TutorError;

const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// How long to wait for the setup acknowledgment before giving up.
const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

lazy_static::lazy_static! {
    /// The four tool declarations the tutor session is configured with.
    static ref TOOL_DECLARATIONS: Value = serde_json::json!([
        {
            "name": "generateAlgebraProblem",
            "description": "Generate a new algebra practice problem based on the current topic and the difficulty of the conversation.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "topic": { "type": "STRING", "description": "The problem topic, e.g. \"Linear Equations\"." },
                    "problem": { "type": "STRING", "description": "The text of the algebra problem." },
                    "difficulty": { "type": "STRING", "description": "The difficulty level: easy, medium or hard." }
                },
                "required": ["topic", "problem", "difficulty"]
            }
        },
        {
            "name": "trackProgress",
            "description": "Record the student's progress on a given problem.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "topic": { "type": "STRING", "description": "The topic of the algebra problem." },
                    "correctlySolved": { "type": "BOOLEAN", "description": "Whether the student solved the problem correctly." }
                },
                "required": ["topic", "correctlySolved"]
            }
        },
        {
            "name": "displayVisualSolution",
            "description": "Show a step-by-step solution to an algebra problem visually.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "steps": {
                        "type": "ARRAY",
                        "items": { "type": "STRING" },
                        "description": "An array of strings, each one step of the solution."
                    }
                },
                "required": ["steps"]
            }
        },
        {
            "name": "askFillInTheBlank",
            "description": "Ask the student a kinesthetic fill-in-the-blank question.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "question": { "type": "STRING", "description": "The question text, with \"[?]\" marking the blank." },
                    "answer": { "type": "STRING", "description": "The correct answer for the blank." }
                },
                "required": ["question", "answer"]
            }
        }
    ]);
}

/// An established live session socket.
pub struct Transport {
    socket: WebSocket<TlsStream<TcpStream>>,
}

impl Transport {
    /// Connect, run the setup exchange, and switch to non-blocking reads.
    /// Any failure here is a terminal `ConnectionError` for the caller.
    pub fn connect(config: &Config) -> Result<Transport, TutorError> {
        if config.gemini_api_key.trim().is_empty() {
            return Err(TutorError::Connection(
                "NO_API_KEY: set gemini_api_key in config.json".to_string(),
            ));
        }

        let socket = open_websocket(&config.gemini_api_key)
            .map_err(|e| TutorError::Connection(e.to_string()))?;
        let mut transport = Transport { socket };

        transport
            .send_setup(config)
            .map_err(|e| TutorError::Connection(format!("setup failed: {}", e)))?;
        transport.await_setup_complete()?;
        transport
            .set_nonblocking()
            .map_err(|e| TutorError::Connection(e.to_string()))?;

        println!("[Transport] Session established");
        Ok(transport)
    }

    fn send_setup(&mut self, config: &Config) -> Result<()> {
        let setup = serde_json::json!({
            "setup": {
                "model": format!("models/{}", config.model),
                "generationConfig": {
                    "responseModalities": ["AUDIO"],
                    "speechConfig": {
                        "voiceConfig": {
                            "prebuiltVoiceConfig": { "voiceName": config.voice }
                        }
                    }
                },
                "systemInstruction": {
                    "parts": [{ "text": config.system_instruction }]
                },
                "tools": [{ "functionDeclarations": TOOL_DECLARATIONS.clone() }],
                "inputAudioTranscription": {},
                "outputAudioTranscription": {}
            }
        });

        self.socket
            .write(tungstenite::Message::Text(setup.to_string().into()))?;
        self.socket.flush()?;
        Ok(())
    }

    /// Block (with the connect-time read timeout) until the server
    /// acknowledges setup.
    fn await_setup_complete(&mut self) -> Result<(), TutorError> {
        let started = Instant::now();
        loop {
            match self.socket.read() {
                Ok(tungstenite::Message::Text(msg)) => {
                    let text = msg.as_str();
                    if is_setup_complete(text) {
                        return Ok(());
                    }
                    if let Some(error) = parse_error(text) {
                        return Err(TutorError::Connection(error));
                    }
                }
                Ok(tungstenite::Message::Binary(data)) => {
                    if let Ok(text) = String::from_utf8(data.to_vec()) {
                        if is_setup_complete(&text) {
                            return Ok(());
                        }
                        if let Some(error) = parse_error(&text) {
                            return Err(TutorError::Connection(error));
                        }
                    }
                }
                Ok(tungstenite::Message::Close(_)) => {
                    return Err(TutorError::Connection(
                        "connection closed during setup".to_string(),
                    ));
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(ref e))
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if started.elapsed() > SETUP_TIMEOUT {
                        return Err(TutorError::Connection(
                            "setup timeout - no response from server".to_string(),
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(TutorError::Connection(e.to_string())),
            }
        }
    }

    /// Short read timeout for the duplex loop; reads surface `WouldBlock`
    /// instead of stalling the sender.
    fn set_nonblocking(&mut self) -> Result<()> {
        let tcp = self.socket.get_mut().get_mut();
        tcp.set_read_timeout(Some(Duration::from_millis(50)))?;
        Ok(())
    }

    /// Push one realtime media chunk (microphone audio or a still frame).
    pub fn send_media(&mut self, data: &str, mime_type: &str) -> Result<(), TutorError> {
        let msg = serde_json::json!({
            "realtimeInput": {
                "mediaChunks": [{
                    "mimeType": mime_type,
                    "data": data
                }]
            }
        });
        self.send_text(msg.to_string())
    }

    /// Acknowledge one tool invocation.
    pub fn send_tool_response(
        &mut self,
        call_id: &str,
        name: &str,
        response: Value,
    ) -> Result<(), TutorError> {
        let msg = serde_json::json!({
            "toolResponse": {
                "functionResponses": [{
                    "id": call_id,
                    "name": name,
                    "response": response
                }]
            }
        });
        self.send_text(msg.to_string())
    }

    fn send_text(&mut self, msg: String) -> Result<(), TutorError> {
        self.socket
            .write(tungstenite::Message::Text(msg.into()))
            .and_then(|_| self.socket.flush())
            .map_err(|e| TutorError::Connection(e.to_string()))
    }

    /// Read the next server message if one is available. `Ok(None)` means
    /// nothing arrived within the read timeout.
    pub fn poll_event(&mut self) -> Result<Option<ServerEvent>, TutorError> {
        match self.socket.read() {
            Ok(tungstenite::Message::Text(msg)) => self.handle_payload(msg.as_str()),
            Ok(tungstenite::Message::Binary(data)) => {
                match String::from_utf8(data.to_vec()) {
                    Ok(text) => self.handle_payload(&text),
                    // Non-UTF-8 binary frames carry nothing we consume
                    Err(_) => Ok(None),
                }
            }
            Ok(tungstenite::Message::Close(_)) => Err(TutorError::Connection(
                "connection closed by server".to_string(),
            )),
            Ok(_) => Ok(None),
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(TutorError::Connection(e.to_string())),
        }
    }

    fn handle_payload(&mut self, text: &str) -> Result<Option<ServerEvent>, TutorError> {
        if let Some(error) = parse_error(text) {
            return Err(TutorError::Connection(error));
        }
        let event = parse_server_event(text);
        if event.is_empty() {
            Ok(None)
        } else {
            Ok(Some(event))
        }
    }

    pub fn close(&mut self) {
        let _ = self.socket.close(None);
    }
}

/// TLS WebSocket handshake against the Live API endpoint.
fn open_websocket(api_key: &str) -> Result<WebSocket<TlsStream<TcpStream>>> {
    let ws_url = format!("{}?key={}", LIVE_ENDPOINT, api_key);

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

    // Blocking mode with long timeouts while the session is set up
    let tcp_stream = TcpStream::connect_timeout(&addr, Duration::from_secs(10))?;
    tcp_stream.set_read_timeout(Some(Duration::from_secs(30)))?;
    tcp_stream.set_write_timeout(Some(Duration::from_secs(30)))?;
    tcp_stream.set_nodelay(true)?;

    let connector = native_tls::TlsConnector::new()?;
    let tls_stream = connector.connect(host, tcp_stream)?;

    let (socket, _response) = tungstenite::client::client(&ws_url, tls_stream)?;

    Ok(socket)
}

/// Check if the message indicates setup is complete.
fn is_setup_complete(msg: &str) -> bool {
    msg.contains("setupComplete")
}

/// Check if the message carries a protocol-level error.
fn parse_error(msg: &str) -> Option<String> {
    if let Ok(json) = serde_json::from_str::<Value>(msg) {
        if let Some(error) = json.get("error") {
            if let Some(message) = error.get("message").and_then(|m| m.as_str()) {
                return Some(message.to_string());
            }
            return Some(error.to_string());
        }
    }
    None
}

/// Decode one server message into the sub-fields the reducer consumes.
fn parse_server_event(msg: &str) -> ServerEvent {
    let mut event = ServerEvent::default();

    let Ok(json) = serde_json::from_str::<Value>(msg) else {
        return event;
    };

    if let Some(server_content) = json.get("serverContent") {
        if let Some(text) = server_content
            .get("inputTranscription")
            .and_then(|t| t.get("text"))
            .and_then(|t| t.as_str())
        {
            if !text.is_empty() {
                event.input_transcription = Some(text.to_string());
            }
        }

        if let Some(text) = server_content
            .get("outputTranscription")
            .and_then(|t| t.get("text"))
            .and_then(|t| t.as_str())
        {
            if !text.is_empty() {
                event.output_transcription = Some(text.to_string());
            }
        }

        if server_content
            .get("interrupted")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            event.interrupted = true;
        }

        if server_content
            .get("turnComplete")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            event.turn_complete = true;
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
                    event.audio = Some(data.to_string());
                    break;
                }
            }
        }
    }

    if let Some(calls) = json
        .get("toolCall")
        .and_then(|t| t.get("functionCalls"))
        .and_then(|c| c.as_array())
    {
        for call in calls {
            let id = call.get("id").and_then(|v| v.as_str()).unwrap_or_default();
            let name = call
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            event.tool_calls.push(ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                args: call.get("args").cloned().unwrap_or(Value::Null),
            });
        }
    }

    event
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_transcription_fragments_and_turn_complete() {
        let msg = r#"{"serverContent":{"inputTranscription":{"text":"hello "},"turnComplete":true}}"#;
        let event = parse_server_event(msg);
        assert_eq!(event.input_transcription.as_deref(), Some("hello "));
        assert!(event.turn_complete);
        assert!(!event.interrupted);
        assert!(event.tool_calls.is_empty());
    }

    #[test]
    fn parses_output_transcription() {
        let msg = r#"{"serverContent":{"outputTranscription":{"text":"x equals two"}}}"#;
        let event = parse_server_event(msg);
        assert_eq!(event.output_transcription.as_deref(), Some("x equals two"));
    }

    #[test]
    fn parses_interruption_flag() {
        let msg = r#"{"serverContent":{"interrupted":true}}"#;
        let event = parse_server_event(msg);
        assert!(event.interrupted);
        assert!(!event.is_empty());
    }

    #[test]
    fn parses_tool_calls_with_arguments() {
        let msg = r#"{"toolCall":{"functionCalls":[
            {"id":"call-1","name":"generateAlgebraProblem",
             "args":{"topic":"Linear Equations","problem":"2x+3=7","difficulty":"easy"}}
        ]}}"#;
        let event = parse_server_event(msg);
        assert_eq!(event.tool_calls.len(), 1);
        let call = &event.tool_calls[0];
        assert_eq!(call.id, "call-1");
        assert_eq!(call.name, "generateAlgebraProblem");
        assert_eq!(call.args["topic"], "Linear Equations");
    }

    #[test]
    fn parses_inline_audio_payload() {
        let msg = r#"{"serverContent":{"modelTurn":{"parts":[
            {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAAA"}}
        ]}}}"#;
        let event = parse_server_event(msg);
        assert_eq!(event.audio.as_deref(), Some("AAAA"));
    }

    #[test]
    fn empty_and_unrelated_messages_parse_to_empty_events() {
        assert!(parse_server_event("{}").is_empty());
        assert!(parse_server_event("not json").is_empty());
        assert!(parse_server_event(r#"{"setupComplete":{}}"#).is_empty());
    }

    #[test]
    fn protocol_errors_are_extracted() {
        let msg = r#"{"error":{"message":"quota exceeded"}}"#;
        assert_eq!(parse_error(msg).as_deref(), Some("quota exceeded"));
        assert!(parse_error(r#"{"serverContent":{}}"#).is_none());
    }

    #[test]
    fn setup_complete_is_detected() {
        assert!(is_setup_complete(r#"{"setupComplete":{}}"#));
        assert!(!is_setup_complete(r#"{"serverContent":{}}"#));
    }

    #[test]
    fn tool_declarations_cover_the_four_tutor_functions() {
        let names: Vec<&str> = TOOL_DECLARATIONS
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "generateAlgebraProblem",
                "trackProgress",
                "displayVisualSolution",
                "askFillInTheBlank"
            ]
        );
    }
}
