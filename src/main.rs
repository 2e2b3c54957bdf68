mod attention;
mod audio;
mod config;
mod error;
mod persistence;
mod session;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use attention::SteadyAttention;
use persistence::Store;
use session::reducer::Notice;
use session::{SessionHandle, UiEvent};

/// Terminal commands accepted while a session is live.
enum Intent {
    Pause,
    Resume,
    Frame(PathBuf),
    End,
}

fn parse_intent(line: &str) -> Option<Intent> {
    let line = line.trim();
    match line {
        "pause" => Some(Intent::Pause),
        "resume" => Some(Intent::Resume),
        "end" => Some(Intent::End),
        _ => line
            .strip_prefix("frame ")
            .map(|path| Intent::Frame(PathBuf::from(path.trim()))),
    }
}

fn main() {
    println!("Voice Algebra Tutor");

    let config = config::load_config();
    if config.gemini_api_key.trim().is_empty() {
        eprintln!(
            "No Gemini API key configured. Set gemini_api_key in {}",
            config::get_config_path().display()
        );
        std::process::exit(1);
    }

    let store = Store::open();
    let (transcript, progress) = store.load();
    if !transcript.is_empty() || !progress.topics.is_empty() {
        println!(
            "[Session] Restored {} transcript entries, {}/{} correct across {} topics",
            transcript.len(),
            progress.total_correct(),
            progress.total_attempted(),
            progress.covered.len()
        );
    }

    let (handle, ui_rx) =
        match SessionHandle::start(config, store, Box::<SteadyAttention>::default()) {
            Ok(pair) => pair,
            Err(e) => {
                eprintln!("Could not start session: {}", e);
                std::process::exit(1);
            }
        };

    // Ctrl-C ends the session through the same teardown path
    let stop = handle.stop_flag();
    if let Err(e) = ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed)) {
        eprintln!("[Session] Could not install Ctrl-C handler: {}", e);
    }

    println!("Commands: pause | resume | frame <path> | end");

    let (intent_tx, intent_rx) = mpsc::channel();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match parse_intent(&line) {
                Some(intent) => {
                    if intent_tx.send(intent).is_err() {
                        break;
                    }
                }
                None => {
                    if !line.trim().is_empty() {
                        println!("Unknown command: {}", line.trim());
                    }
                }
            }
        }
    });

    // "end" also wipes the saved transcript and progress; Ctrl-C keeps them
    let mut clear_on_exit = false;

    'ui: loop {
        match ui_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                if render(event) {
                    break 'ui;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break 'ui,
        }

        while let Ok(intent) = intent_rx.try_recv() {
            match intent {
                Intent::Pause => handle.pause_playback(),
                Intent::Resume => handle.resume_playback(),
                Intent::Frame(path) => match image::open(&path) {
                    Ok(frame) => match handle.send_frame(&frame) {
                        Ok(()) => println!("[Session] Sent frame {}", path.display()),
                        Err(e) => eprintln!("[Session] Could not send frame: {}", e),
                    },
                    Err(e) => eprintln!("[Session] Could not read {}: {}", path.display(), e),
                },
                Intent::End => {
                    clear_on_exit = true;
                    handle.stop_flag().store(true, Ordering::Relaxed);
                }
            }
        }
    }

    handle.end();

    let (_, final_progress) = Store::open().load();
    println!(
        "[Session] {}/{} correct over {} min",
        final_progress.total_correct(),
        final_progress.total_attempted(),
        final_progress.elapsed().num_minutes()
    );

    if clear_on_exit {
        Store::open().clear();
        println!("[Storage] Cleared saved transcript and progress");
    }
}

/// Print one UI update. Returns true when the session has ended.
fn render(event: UiEvent) -> bool {
    match event {
        UiEvent::Notice(notice) => match notice {
            Notice::StudentSaid(text) => println!("You: {}", text),
            Notice::TutorSaid(text) => println!("Chip: {}", text),
            Notice::ProblemPosted(problem) => {
                println!(
                    "--- Practice problem ({}, {}) ---",
                    problem.topic,
                    problem.difficulty.label()
                );
                println!("    {}", problem.problem);
            }
            Notice::SolutionPosted(steps) => {
                println!("--- Solution steps ---");
                for (i, step) in steps.iter().enumerate() {
                    println!("    {}. {}", i + 1, step);
                }
            }
            Notice::ChallengePosted(question) => {
                println!("--- Fill in the blank ---");
                println!("    {}", question.question);
                println!("    (say your answer out loud)");
            }
            Notice::ChallengeGraded { correct } => {
                if correct {
                    println!("    Correct!");
                } else {
                    println!("    Not quite - listen for the explanation");
                }
            }
            Notice::ProgressRecorded { topic, correct } => {
                println!(
                    "[Progress] {}: {}",
                    topic,
                    if correct { "solved" } else { "missed" }
                );
            }
            Notice::Interrupted => println!("[Session] (tutor interrupted)"),
        },
        UiEvent::Speaking {
            student,
            model,
            level,
        } => {
            if student {
                println!("[Mic] Listening... (level {:.2})", level);
            } else if model {
                println!("[Audio] Chip is speaking...");
            }
        }
        UiEvent::Attention(state) => println!("[Attention] {}", state.label()),
        UiEvent::Error(e) => eprintln!("[Session] {}", e),
        UiEvent::Ended => return true,
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intents_parse_from_terminal_lines() {
        assert!(matches!(parse_intent("pause"), Some(Intent::Pause)));
        assert!(matches!(parse_intent(" resume "), Some(Intent::Resume)));
        assert!(matches!(parse_intent("end"), Some(Intent::End)));
        assert!(
            matches!(parse_intent("frame /tmp/board.png"), Some(Intent::Frame(p)) if p == PathBuf::from("/tmp/board.png"))
        );
        assert!(parse_intent("what").is_none());
        assert!(parse_intent("").is_none());
    }
}
