//! One live tutoring session: capture, transport, reducer, playback and
//! storage wired together on a single loop thread, owned by an explicit
//! handle.

pub mod events;
pub mod reducer;
pub mod transport;

use anyhow::Result;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc, Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use crate::attention::{AttentionSource, AttentionState};
use crate::audio::capture::CapturePipeline;
use crate::audio::codec;
use crate::audio::playback::PlaybackScheduler;
use crate::config::Config;
use crate::error::TutorError;
use crate::persistence::Store;
use reducer::{Notice, Outbound, Phase, TutorState};
use transport::Transport;

/// How often the attention source is sampled.
const ATTENTION_POLL: Duration = Duration::from_secs(5);

/// User intents forwarded into the session loop.
enum SessionCommand {
    SendMedia { data: String, mime: &'static str },
    PausePlayback,
    ResumePlayback,
}

/// Updates the presentation layer renders.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Notice(Notice),
    Speaking {
        student: bool,
        model: bool,
        /// Last microphone window's RMS energy, for a level meter.
        level: f32,
    },
    Attention(AttentionState),
    Error(String),
    Ended,
}

/// Handle to the single live session. There is no global session state;
/// every operation goes through a handle, and dropping it tears the
/// session down.
pub struct SessionHandle {
    stop: Arc<AtomicBool>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    join: Option<thread::JoinHandle<()>>,
}

impl SessionHandle {
    /// Start a session: acquire the microphone, connect the live socket,
    /// and begin streaming. Returns once the session is established, or
    /// with the terminal error that prevented it. One session per handle;
    /// end the previous one before starting another.
    pub fn start(
        config: Config,
        store: Store,
        attention: Box<dyn AttentionSource>,
    ) -> Result<(SessionHandle, mpsc::Receiver<UiEvent>), TutorError> {
        let stop = Arc::new(AtomicBool::new(false));
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (ui_tx, ui_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let loop_stop = stop.clone();
        let join = thread::spawn(move || {
            run_session(config, store, attention, loop_stop, cmd_rx, ui_tx, ready_tx);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok((
                SessionHandle {
                    stop,
                    cmd_tx,
                    join: Some(join),
                },
                ui_rx,
            )),
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => {
                let _ = join.join();
                Err(TutorError::Connection(
                    "session thread died during startup".to_string(),
                ))
            }
        }
    }

    /// Encode a still frame as JPEG and push it through the realtime media
    /// channel.
    pub fn send_frame(&self, frame: &image::DynamicImage) -> Result<()> {
        let mut jpeg = Vec::new();
        frame
            .to_rgb8()
            .write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)?;
        self.cmd_tx.send(SessionCommand::SendMedia {
            data: codec::encode_base64(&jpeg),
            mime: "image/jpeg",
        })?;
        Ok(())
    }

    pub fn pause_playback(&self) {
        let _ = self.cmd_tx.send(SessionCommand::PausePlayback);
    }

    pub fn resume_playback(&self) {
        let _ = self.cmd_tx.send(SessionCommand::ResumePlayback);
    }

    /// Signal the loop to finish; safe to call from a signal handler.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// End the session and wait for teardown to finish.
    pub fn end(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_session(
    config: Config,
    store: Store,
    mut attention: Box<dyn AttentionSource>,
    stop: Arc<AtomicBool>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    ui_tx: mpsc::Sender<UiEvent>,
    ready_tx: mpsc::Sender<Result<(), TutorError>>,
) {
    let (transcript, progress) = store.load();
    let mut state = TutorState::new(transcript, progress);
    state.phase = Phase::Connecting;

    let mut transport = match Transport::connect(&config) {
        Ok(t) => t,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let (chunk_tx, chunk_rx) = mpsc::channel::<(String, &'static str)>();
    let mut capture = match CapturePipeline::start(move |data, mime| {
        let _ = chunk_tx.send((data, mime));
    }) {
        Ok(c) => c,
        Err(e) => {
            transport.close();
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let mut playback = PlaybackScheduler::start();

    state.phase = Phase::Active;
    let _ = ready_tx.send(Ok(()));
    println!("[Session] Live session started");

    let mut last_speaking = (false, false);
    let mut last_attention = None;
    let mut next_attention_poll = Instant::now();

    'session: while !stop.load(Ordering::Relaxed) {
        // Microphone chunks out
        while let Ok((data, mime)) = chunk_rx.try_recv() {
            if let Err(e) = transport.send_media(&data, mime) {
                let _ = ui_tx.send(UiEvent::Error(e.to_string()));
                break 'session;
            }
        }

        // User intents
        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                SessionCommand::SendMedia { data, mime } => {
                    if let Err(e) = transport.send_media(&data, mime) {
                        let _ = ui_tx.send(UiEvent::Error(e.to_string()));
                        break 'session;
                    }
                }
                SessionCommand::PausePlayback => playback.pause(),
                SessionCommand::ResumePlayback => playback.resume(),
            }
        }

        // Server messages in, applied in arrival order
        loop {
            match transport.poll_event() {
                Ok(Some(event)) => {
                    let actions = state.apply(&event, Instant::now());
                    if !execute(actions, &mut transport, &playback, &ui_tx) {
                        break 'session;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = ui_tx.send(UiEvent::Error(e.to_string()));
                    break 'session;
                }
            }
        }

        // Deferred challenge acknowledgment, once its display delay passes
        let due = state.take_due_acks(Instant::now());
        if !execute(due, &mut transport, &playback, &ui_tx) {
            break 'session;
        }

        // Mirror dirty state to storage
        if state.take_dirty() {
            store.save(&state.transcript, &state.progress);
        }

        // Speaking indicators
        state.model_speaking = playback.is_speaking();
        let speaking = (capture.is_speaking(), state.model_speaking);
        if speaking != last_speaking {
            last_speaking = speaking;
            let _ = ui_tx.send(UiEvent::Speaking {
                student: speaking.0,
                model: speaking.1,
                level: capture.level(),
            });
        }

        // Attention signal
        if Instant::now() >= next_attention_poll {
            next_attention_poll = Instant::now() + ATTENTION_POLL;
            let current = attention.sample();
            if last_attention != Some(current) {
                last_attention = Some(current);
                let _ = ui_tx.send(UiEvent::Attention(current));
            }
        }

        thread::sleep(Duration::from_millis(5));
    }

    // Teardown runs unconditionally, every step even if an earlier one
    // failed: flush playback, close the socket, release the microphone.
    playback.drain();
    transport.close();
    capture.stop();
    state.phase = Phase::Ended;
    println!("[Session] Session ended");
    let _ = ui_tx.send(UiEvent::Ended);
}

/// Carry out the reducer's actions in order. Returns false on a terminal
/// transport failure.
fn execute(
    actions: Vec<Outbound>,
    transport: &mut Transport,
    playback: &PlaybackScheduler,
    ui_tx: &mpsc::Sender<UiEvent>,
) -> bool {
    for action in actions {
        match action {
            Outbound::ToolResponse {
                call_id,
                name,
                response,
            } => {
                if let Err(e) = transport.send_tool_response(&call_id, &name, response) {
                    let _ = ui_tx.send(UiEvent::Error(e.to_string()));
                    return false;
                }
            }
            Outbound::PlayAudio(data) => {
                // A malformed chunk is dropped; playback continues with the
                // next one.
                if let Err(e) = playback.enqueue(&data) {
                    eprintln!("[Audio] Dropping chunk: {}", e);
                }
            }
            Outbound::DrainPlayback => playback.drain(),
            Outbound::Notify(notice) => {
                let _ = ui_tx.send(UiEvent::Notice(notice));
            }
        }
    }
    true
}
