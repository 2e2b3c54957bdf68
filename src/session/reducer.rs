//! Conversation state: the transcript, per-topic progress, the pending
//! fill-in-the-blank challenge, and the tool-call protocol that keeps the
//! remote tutor in sync with what the student sees.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use super::events::{ServerEvent, ToolCall};

/// How long challenge feedback stays on screen before the graded
/// acknowledgment goes back to the model.
pub const FEEDBACK_ACK_DELAY: Duration = Duration::from_millis(1500);

fn entry_id(prefix: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{}-{:x}", prefix, nanos)
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    /// The model sends difficulty as free text; unrecognized labels read as
    /// Medium.
    pub fn from_label(label: &str) -> Difficulty {
        match label.trim().to_lowercase().as_str() {
            "easy" => Difficulty::Easy,
            "hard" => Difficulty::Hard,
            _ => Difficulty::Medium,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AlgebraProblem {
    pub topic: String,
    pub problem: String,
    pub difficulty: Difficulty,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FillInTheBlank {
    /// Question text with a single "[?]" marking the blank.
    pub question: String,
    pub answer: String,
}

/// One transcript item. The closed set of roles is a tagged variant so
/// every consumer handles all of them.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum EntryKind {
    Student { text: String },
    Tutor { text: String },
    Problem { problem: AlgebraProblem },
    VisualSolution { steps: Vec<String> },
    KinestheticQuestion { question: FillInTheBlank },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TranscriptEntry {
    pub id: String,
    #[serde(flatten)]
    pub kind: EntryKind,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TopicProgress {
    pub attempted: u32,
    pub correct: u32,
}

/// Per-session accuracy counters, fixed to the moment the session first
/// started.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProgressSnapshot {
    /// Epoch milliseconds; set once at first creation, never mutated.
    pub start_time: i64,
    pub topics: HashMap<String, TopicProgress>,
    /// Every topic touched so far. Serializes as a JSON array.
    #[serde(default)]
    pub covered: HashSet<String>,
}

impl ProgressSnapshot {
    pub fn new() -> ProgressSnapshot {
        ProgressSnapshot {
            start_time: Utc::now().timestamp_millis(),
            topics: HashMap::new(),
            covered: HashSet::new(),
        }
    }

    pub fn record(&mut self, topic: &str, solved: bool) {
        let counters = self.topics.entry(topic.to_string()).or_default();
        counters.attempted += 1;
        if solved {
            counters.correct += 1;
        }
        self.covered.insert(topic.to_string());
    }

    pub fn total_attempted(&self) -> u32 {
        self.topics.values().map(|t| t.attempted).sum()
    }

    pub fn total_correct(&self) -> u32 {
        self.topics.values().map(|t| t.correct).sum()
    }

    pub fn elapsed(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(Utc::now().timestamp_millis() - self.start_time)
    }
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        ProgressSnapshot::new()
    }
}

/// Session lifecycle phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Active,
    Ended,
}

/// Things the session loop must do on the reducer's behalf after applying
/// an event. Acknowledgments for the three synchronous tools are emitted
/// in the same batch as the state change, so they go out before any later
/// message is processed.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    ToolResponse {
        call_id: String,
        name: String,
        response: Value,
    },
    PlayAudio(String),
    DrainPlayback,
    Notify(Notice),
}

/// UI-facing notifications, rendered by the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    StudentSaid(String),
    TutorSaid(String),
    ProblemPosted(AlgebraProblem),
    SolutionPosted(Vec<String>),
    ChallengePosted(FillInTheBlank),
    ChallengeGraded { correct: bool },
    ProgressRecorded { topic: String, correct: bool },
    Interrupted,
}

struct PendingChallenge {
    call_id: String,
    answer: String,
}

struct DeferredAck {
    due: Instant,
    call_id: String,
    correct: bool,
    utterance: String,
}

/// The conversation state machine. All mutation happens here, on the
/// session loop; everything else reads snapshots.
pub struct TutorState {
    pub phase: Phase,
    pub transcript: Vec<TranscriptEntry>,
    pub progress: ProgressSnapshot,
    pub model_speaking: bool,
    /// Feedback shown while a graded challenge waits for its deferred ack.
    pub feedback: Option<bool>,

    /// Raw student speech accumulated for the open turn; used to grade a
    /// pending challenge.
    current_utterance: String,
    open_student: Option<usize>,
    open_tutor: Option<usize>,
    pending: Option<PendingChallenge>,
    deferred: Option<DeferredAck>,
    dirty: bool,
}

/// Lenient answer check: the expected answer counts as correct when it
/// appears anywhere in the normalized utterance. "3" matches inside "33";
/// kept for parity with the shipped behavior.
fn answer_matches(utterance: &str, expected: &str) -> bool {
    utterance
        .trim()
        .to_lowercase()
        .contains(&expected.trim().to_lowercase())
}

fn arg_str(args: &Value, key: &str) -> String {
    args.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

impl TutorState {
    pub fn new(transcript: Vec<TranscriptEntry>, progress: ProgressSnapshot) -> TutorState {
        TutorState {
            phase: Phase::Idle,
            transcript,
            progress,
            model_speaking: false,
            feedback: None,
            current_utterance: String::new(),
            open_student: None,
            open_tutor: None,
            pending: None,
            deferred: None,
            dirty: false,
        }
    }

    /// True when transcript or progress changed since the last check;
    /// clears the flag. The session loop mirrors dirty state to storage.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    /// Whether a challenge is awaiting a student answer or a deferred ack.
    pub fn challenge_open(&self) -> bool {
        self.pending.is_some() || self.deferred.is_some()
    }

    /// Apply one inbound server message and return the actions it implies.
    /// Messages outside the active phase are discarded.
    pub fn apply(&mut self, event: &ServerEvent, now: Instant) -> Vec<Outbound> {
        if self.phase != Phase::Active {
            return Vec::new();
        }
        let mut out = Vec::new();

        if let Some(text) = &event.input_transcription {
            self.current_utterance.push_str(text);
            self.append_speech(true, text);
        }

        if let Some(text) = &event.output_transcription {
            self.append_speech(false, text);
        }

        if event.interrupted {
            out.push(Outbound::DrainPlayback);
            self.model_speaking = false;
            out.push(Outbound::Notify(Notice::Interrupted));
        }

        for call in &event.tool_calls {
            self.apply_tool_call(call, &mut out);
        }

        if event.turn_complete {
            self.complete_turn(now, &mut out);
        }

        if let Some(data) = &event.audio {
            self.model_speaking = true;
            out.push(Outbound::PlayAudio(data.clone()));
        }

        out
    }

    /// Emit the deferred challenge acknowledgment once its display delay
    /// has elapsed. Never fires before turn-complete graded it.
    pub fn take_due_acks(&mut self, now: Instant) -> Vec<Outbound> {
        let due = matches!(&self.deferred, Some(ack) if ack.due <= now);
        if !due {
            return Vec::new();
        }
        let ack = self.deferred.take().unwrap();
        self.feedback = None;
        vec![Outbound::ToolResponse {
            call_id: ack.call_id,
            name: "askFillInTheBlank".to_string(),
            response: serde_json::json!({
                "result": if ack.correct { "correct" } else { "incorrect" },
                "userAnswer": ack.utterance,
            }),
        }]
    }

    /// Append a transcription fragment, coalescing into the open entry for
    /// that speaker until the turn closes.
    fn append_speech(&mut self, student: bool, text: &str) {
        let open = if student {
            &mut self.open_student
        } else {
            &mut self.open_tutor
        };
        if let Some(index) = *open {
            match &mut self.transcript[index].kind {
                EntryKind::Student { text: existing } | EntryKind::Tutor { text: existing } => {
                    existing.push_str(text)
                }
                _ => {}
            }
        } else {
            let kind = if student {
                EntryKind::Student {
                    text: text.to_string(),
                }
            } else {
                EntryKind::Tutor {
                    text: text.to_string(),
                }
            };
            let prefix = if student { "student" } else { "tutor" };
            self.transcript.push(TranscriptEntry {
                id: entry_id(prefix),
                kind,
            });
            *open = Some(self.transcript.len() - 1);
        }
        self.dirty = true;
    }

    fn apply_tool_call(&mut self, call: &ToolCall, out: &mut Vec<Outbound>) {
        match call.name.as_str() {
            "generateAlgebraProblem" => {
                let problem = AlgebraProblem {
                    topic: arg_str(&call.args, "topic"),
                    problem: arg_str(&call.args, "problem"),
                    difficulty: Difficulty::from_label(&arg_str(&call.args, "difficulty")),
                };
                self.transcript.push(TranscriptEntry {
                    id: entry_id("problem"),
                    kind: EntryKind::Problem {
                        problem: problem.clone(),
                    },
                });
                self.dirty = true;
                out.push(Outbound::Notify(Notice::ProblemPosted(problem)));
                out.push(ack_ok(call));
            }
            "trackProgress" => {
                let topic = arg_str(&call.args, "topic");
                let solved = call
                    .args
                    .get("correctlySolved")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                self.progress.record(&topic, solved);
                self.dirty = true;
                out.push(Outbound::Notify(Notice::ProgressRecorded {
                    topic,
                    correct: solved,
                }));
                out.push(ack_ok(call));
            }
            "displayVisualSolution" => {
                let steps: Vec<String> = call
                    .args
                    .get("steps")
                    .and_then(|v| v.as_array())
                    .map(|steps| {
                        steps
                            .iter()
                            .filter_map(|s| s.as_str())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                self.transcript.push(TranscriptEntry {
                    id: entry_id("visual"),
                    kind: EntryKind::VisualSolution {
                        steps: steps.clone(),
                    },
                });
                self.dirty = true;
                out.push(Outbound::Notify(Notice::SolutionPosted(steps)));
                out.push(ack_ok(call));
            }
            "askFillInTheBlank" => {
                // Deferred protocol: the model is waiting for a graded
                // response that only exists after the student's next turn,
                // so no ack goes out here.
                if self.challenge_open() {
                    eprintln!("[Session] New challenge replaces an unresolved one");
                }
                let question = FillInTheBlank {
                    question: arg_str(&call.args, "question"),
                    answer: arg_str(&call.args, "answer"),
                };
                self.transcript.push(TranscriptEntry {
                    id: entry_id("kinesthetic"),
                    kind: EntryKind::KinestheticQuestion {
                        question: question.clone(),
                    },
                });
                self.pending = Some(PendingChallenge {
                    call_id: call.id.clone(),
                    answer: question.answer.clone(),
                });
                self.deferred = None;
                self.feedback = None;
                self.dirty = true;
                out.push(Outbound::Notify(Notice::ChallengePosted(question)));
            }
            other => {
                eprintln!("[Session] Ignoring unknown tool call: {}", other);
            }
        }
    }

    fn complete_turn(&mut self, now: Instant, out: &mut Vec<Outbound>) {
        if let Some(index) = self.open_student.take() {
            if let EntryKind::Student { text } = &self.transcript[index].kind {
                out.push(Outbound::Notify(Notice::StudentSaid(text.clone())));
            }
        }
        if let Some(index) = self.open_tutor.take() {
            if let EntryKind::Tutor { text } = &self.transcript[index].kind {
                out.push(Outbound::Notify(Notice::TutorSaid(text.clone())));
            }
        }

        let utterance = std::mem::take(&mut self.current_utterance);
        if let Some(pending) = &self.pending {
            if !utterance.trim().is_empty() {
                let correct = answer_matches(&utterance, &pending.answer);
                self.feedback = Some(correct);
                self.deferred = Some(DeferredAck {
                    due: now + FEEDBACK_ACK_DELAY,
                    call_id: pending.call_id.clone(),
                    correct,
                    utterance,
                });
                self.pending = None;
                out.push(Outbound::Notify(Notice::ChallengeGraded { correct }));
            }
        }
    }
}

fn ack_ok(call: &ToolCall) -> Outbound {
    Outbound::ToolResponse {
        call_id: call.id.clone(),
        name: call.name.clone(),
        response: serde_json::json!({ "result": "ok" }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> TutorState {
        let mut st = TutorState::new(Vec::new(), ProgressSnapshot::new());
        st.phase = Phase::Active;
        st
    }

    fn tool_event(name: &str, args: Value) -> ServerEvent {
        ServerEvent {
            tool_calls: vec![ToolCall {
                id: format!("call-{}", name),
                name: name.to_string(),
                args,
            }],
            ..Default::default()
        }
    }

    fn input_event(text: &str) -> ServerEvent {
        ServerEvent {
            input_transcription: Some(text.to_string()),
            ..Default::default()
        }
    }

    fn turn_complete() -> ServerEvent {
        ServerEvent {
            turn_complete: true,
            ..Default::default()
        }
    }

    fn acks(out: &[Outbound]) -> Vec<&Outbound> {
        out.iter()
            .filter(|o| matches!(o, Outbound::ToolResponse { .. }))
            .collect()
    }

    #[test]
    fn generate_problem_appends_entry_and_acks_synchronously() {
        let mut st = state();
        let out = st.apply(
            &tool_event(
                "generateAlgebraProblem",
                serde_json::json!({
                    "topic": "Linear Equations",
                    "problem": "2x+3=7",
                    "difficulty": "easy"
                }),
            ),
            Instant::now(),
        );

        let entry = st.transcript.last().unwrap();
        match &entry.kind {
            EntryKind::Problem { problem } => {
                assert_eq!(problem.topic, "Linear Equations");
                assert_eq!(problem.problem, "2x+3=7");
                assert_eq!(problem.difficulty, Difficulty::Easy);
            }
            other => panic!("expected problem entry, got {:?}", other),
        }

        let acked = acks(&out);
        assert_eq!(acked.len(), 1);
        match acked[0] {
            Outbound::ToolResponse { name, response, .. } => {
                assert_eq!(name, "generateAlgebraProblem");
                assert_eq!(response["result"], "ok");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn track_progress_keeps_correct_below_attempted() {
        let mut st = state();
        let calls = [
            ("Linear Equations", true),
            ("Linear Equations", false),
            ("Factoring", true),
            ("Linear Equations", true),
            ("Factoring", false),
        ];
        for (topic, solved) in calls {
            st.apply(
                &tool_event(
                    "trackProgress",
                    serde_json::json!({ "topic": topic, "correctlySolved": solved }),
                ),
                Instant::now(),
            );
            for counters in st.progress.topics.values() {
                assert!(counters.correct <= counters.attempted);
            }
        }

        let linear = st.progress.topics["Linear Equations"];
        assert_eq!(linear.attempted, 3);
        assert_eq!(linear.correct, 2);
        assert_eq!(st.progress.total_attempted(), 5);
        assert!(st.progress.covered.contains("Factoring"));
    }

    #[test]
    fn visual_solution_appends_steps_and_acks() {
        let mut st = state();
        let out = st.apply(
            &tool_event(
                "displayVisualSolution",
                serde_json::json!({ "steps": ["2x = 4", "x = 2"] }),
            ),
            Instant::now(),
        );
        assert!(matches!(
            &st.transcript.last().unwrap().kind,
            EntryKind::VisualSolution { steps } if steps.len() == 2
        ));
        assert_eq!(acks(&out).len(), 1);
    }

    #[test]
    fn challenge_ack_is_deferred_not_synchronous() {
        let mut st = state();
        let out = st.apply(
            &tool_event(
                "askFillInTheBlank",
                serde_json::json!({ "question": "3x = 6, so x = [?]", "answer": "2" }),
            ),
            Instant::now(),
        );
        assert!(acks(&out).is_empty());
        assert!(st.challenge_open());
        // The pending challenge corresponds to the last appended entry
        assert!(matches!(
            &st.transcript.last().unwrap().kind,
            EntryKind::KinestheticQuestion { .. }
        ));
    }

    #[test]
    fn substring_answer_check_is_case_folded() {
        assert!(answer_matches("The answer is 3 apples", "3"));
        assert!(answer_matches("  DIVIDE by three  ", "divide"));
        assert!(!answer_matches("I don't know", "x"));
    }

    #[test]
    fn graded_challenge_acks_after_the_display_delay() {
        let mut st = state();
        let t0 = Instant::now();
        st.apply(
            &tool_event(
                "askFillInTheBlank",
                serde_json::json!({ "question": "x + 1 = 4, x = [?]", "answer": "3" }),
            ),
            t0,
        );
        st.apply(&input_event("the answer is 3 apples"), t0);
        let out = st.apply(&turn_complete(), t0);

        assert!(out.contains(&Outbound::Notify(Notice::ChallengeGraded { correct: true })));
        assert_eq!(st.feedback, Some(true));

        // Not yet due
        assert!(st.take_due_acks(t0).is_empty());
        assert!(st.take_due_acks(t0 + Duration::from_millis(1000)).is_empty());

        let due = st.take_due_acks(t0 + FEEDBACK_ACK_DELAY);
        assert_eq!(due.len(), 1);
        match &due[0] {
            Outbound::ToolResponse {
                call_id,
                name,
                response,
            } => {
                assert_eq!(call_id, "call-askFillInTheBlank");
                assert_eq!(name, "askFillInTheBlank");
                assert_eq!(response["result"], "correct");
                assert_eq!(response["userAnswer"], "the answer is 3 apples");
            }
            other => panic!("expected tool response, got {:?}", other),
        }
        assert!(st.feedback.is_none());
        assert!(!st.challenge_open());
    }

    #[test]
    fn wrong_answer_grades_incorrect() {
        let mut st = state();
        let t0 = Instant::now();
        st.apply(
            &tool_event(
                "askFillInTheBlank",
                serde_json::json!({ "question": "solve for x: [?]", "answer": "x" }),
            ),
            t0,
        );
        st.apply(&input_event("I don't know"), t0);
        st.apply(&turn_complete(), t0);

        assert_eq!(st.feedback, Some(false));
        let due = st.take_due_acks(t0 + FEEDBACK_ACK_DELAY);
        match &due[0] {
            Outbound::ToolResponse { response, .. } => {
                assert_eq!(response["result"], "incorrect");
            }
            other => panic!("expected tool response, got {:?}", other),
        }
    }

    #[test]
    fn silent_turn_keeps_challenge_pending() {
        let mut st = state();
        let t0 = Instant::now();
        st.apply(
            &tool_event(
                "askFillInTheBlank",
                serde_json::json!({ "question": "[?]", "answer": "4" }),
            ),
            t0,
        );
        st.apply(&turn_complete(), t0);

        assert!(st.challenge_open());
        assert!(st.feedback.is_none());
        assert!(st.take_due_acks(t0 + FEEDBACK_ACK_DELAY).is_empty());
    }

    #[test]
    fn fragments_coalesce_until_turn_boundary() {
        let mut st = state();
        let t0 = Instant::now();
        st.apply(&input_event("what is "), t0);
        st.apply(&input_event("a slope"), t0);
        assert_eq!(st.transcript.len(), 1);
        assert!(matches!(
            &st.transcript[0].kind,
            EntryKind::Student { text } if text == "what is a slope"
        ));

        let out = st.apply(&turn_complete(), t0);
        assert!(out
            .iter()
            .any(|o| matches!(o, Outbound::Notify(Notice::StudentSaid(t)) if t == "what is a slope")));

        // A new fragment after the boundary opens a fresh entry
        st.apply(&input_event("next question"), t0);
        assert_eq!(st.transcript.len(), 2);
    }

    #[test]
    fn tutor_fragments_coalesce_independently_of_student() {
        let mut st = state();
        let t0 = Instant::now();
        st.apply(&input_event("hi"), t0);
        st.apply(
            &ServerEvent {
                output_transcription: Some("hello ".to_string()),
                ..Default::default()
            },
            t0,
        );
        st.apply(
            &ServerEvent {
                output_transcription: Some("there".to_string()),
                ..Default::default()
            },
            t0,
        );
        assert_eq!(st.transcript.len(), 2);
        assert!(matches!(
            &st.transcript[1].kind,
            EntryKind::Tutor { text } if text == "hello there"
        ));
    }

    #[test]
    fn interruption_drains_playback_and_clears_speaking() {
        let mut st = state();
        st.model_speaking = true;
        let out = st.apply(
            &ServerEvent {
                interrupted: true,
                ..Default::default()
            },
            Instant::now(),
        );
        assert!(out.contains(&Outbound::DrainPlayback));
        assert!(!st.model_speaking);
    }

    #[test]
    fn inline_audio_is_forwarded_and_marks_model_speaking() {
        let mut st = state();
        let out = st.apply(
            &ServerEvent {
                audio: Some("AAAA".to_string()),
                ..Default::default()
            },
            Instant::now(),
        );
        assert!(out.contains(&Outbound::PlayAudio("AAAA".to_string())));
        assert!(st.model_speaking);
    }

    #[test]
    fn transcript_entries_serialize_with_role_tags() {
        let entry = TranscriptEntry {
            id: "problem-1".to_string(),
            kind: EntryKind::Problem {
                problem: AlgebraProblem {
                    topic: "Factoring".to_string(),
                    problem: "x^2-1".to_string(),
                    difficulty: Difficulty::Hard,
                },
            },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["role"], "problem");
        assert_eq!(json["problem"]["difficulty"], "hard");

        let back: TranscriptEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn events_outside_the_active_phase_are_discarded() {
        let mut st = TutorState::new(Vec::new(), ProgressSnapshot::new());
        assert_eq!(st.phase, Phase::Idle);
        let out = st.apply(&input_event("hello"), Instant::now());
        assert!(out.is_empty());
        assert!(st.transcript.is_empty());

        st.phase = Phase::Ended;
        let out = st.apply(&turn_complete(), Instant::now());
        assert!(out.is_empty());
    }

    #[test]
    fn unknown_tools_are_ignored() {
        let mut st = state();
        let out = st.apply(
            &tool_event("somethingElse", serde_json::json!({})),
            Instant::now(),
        );
        assert!(acks(&out).is_empty());
        assert!(st.transcript.is_empty());
    }
}
