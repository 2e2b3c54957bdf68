//! Durable storage for the transcript and the progress snapshot.
//!
//! Two JSON records under the platform config directory. Loads fail soft:
//! a corrupt or missing file yields an empty transcript and a fresh
//! snapshot rather than an error, so a bad disk never blocks a session.

use std::path::PathBuf;

use crate::config::get_config_dir;
use crate::error::TutorError;
use crate::session::reducer::{ProgressSnapshot, TranscriptEntry};

const TRANSCRIPT_FILE: &str = "transcript.json";
const PROGRESS_FILE: &str = "progress.json";

pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn open() -> Store {
        Store {
            dir: get_config_dir(),
        }
    }

    pub fn with_dir(dir: PathBuf) -> Store {
        let _ = std::fs::create_dir_all(&dir);
        Store { dir }
    }

    /// Restore the previous session's transcript and progress. Set-like
    /// fields (the covered-topic set) come back from their array form via
    /// serde.
    pub fn load(&self) -> (Vec<TranscriptEntry>, ProgressSnapshot) {
        let transcript = std::fs::read_to_string(self.dir.join(TRANSCRIPT_FILE))
            .ok()
            .and_then(|data| serde_json::from_str(&data).ok())
            .unwrap_or_default();

        let progress = std::fs::read_to_string(self.dir.join(PROGRESS_FILE))
            .ok()
            .and_then(|data| serde_json::from_str(&data).ok())
            .unwrap_or_else(ProgressSnapshot::new);

        (transcript, progress)
    }

    /// Mirror the current state to disk. Write failures are logged and
    /// skipped; the session carries on with in-memory state.
    pub fn save(&self, transcript: &[TranscriptEntry], progress: &ProgressSnapshot) {
        if let Err(e) = self.try_save(transcript, progress) {
            eprintln!("[Storage] {}", e);
        }
    }

    fn try_save(
        &self,
        transcript: &[TranscriptEntry],
        progress: &ProgressSnapshot,
    ) -> Result<(), TutorError> {
        let data = serde_json::to_string_pretty(transcript)
            .map_err(|e| TutorError::Storage(e.to_string()))?;
        std::fs::write(self.dir.join(TRANSCRIPT_FILE), data)
            .map_err(|e| TutorError::Storage(e.to_string()))?;

        let data = serde_json::to_string_pretty(progress)
            .map_err(|e| TutorError::Storage(e.to_string()))?;
        std::fs::write(self.dir.join(PROGRESS_FILE), data)
            .map_err(|e| TutorError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Remove both records; the next load starts fresh.
    pub fn clear(&self) {
        let _ = std::fs::remove_file(self.dir.join(TRANSCRIPT_FILE));
        let _ = std::fs::remove_file(self.dir.join(PROGRESS_FILE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::reducer::{AlgebraProblem, Difficulty, EntryKind};

    fn sample_state() -> (Vec<TranscriptEntry>, ProgressSnapshot) {
        let transcript = vec![
            TranscriptEntry {
                id: "student-1".to_string(),
                kind: EntryKind::Student {
                    text: "give me a problem".to_string(),
                },
            },
            TranscriptEntry {
                id: "problem-1".to_string(),
                kind: EntryKind::Problem {
                    problem: AlgebraProblem {
                        topic: "Linear Equations".to_string(),
                        problem: "2x+3=7".to_string(),
                        difficulty: Difficulty::Easy,
                    },
                },
            },
        ];
        let mut progress = ProgressSnapshot::new();
        progress.record("Linear Equations", true);
        progress.record("Linear Equations", false);
        progress.record("Factoring", true);
        (transcript, progress)
    }

    #[test]
    fn progress_round_trips_with_equal_topic_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::with_dir(dir.path().to_path_buf());

        let (transcript, progress) = sample_state();
        store.save(&transcript, &progress);
        let (loaded_transcript, loaded_progress) = store.load();

        assert_eq!(loaded_transcript, transcript);
        assert_eq!(loaded_progress.topics, progress.topics);
        assert_eq!(loaded_progress.covered, progress.covered);
        assert_eq!(loaded_progress.start_time, progress.start_time);
    }

    #[test]
    fn covered_topics_serialize_as_an_array() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::with_dir(dir.path().to_path_buf());
        let (transcript, progress) = sample_state();
        store.save(&transcript, &progress);

        let raw = std::fs::read_to_string(dir.path().join(PROGRESS_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(json["covered"].is_array());
        assert_eq!(json["covered"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn missing_storage_fails_soft_to_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::with_dir(dir.path().join("nothing-here"));
        let (transcript, progress) = store.load();
        assert!(transcript.is_empty());
        assert!(progress.topics.is_empty());
        assert!(progress.start_time > 0);
    }

    #[test]
    fn corrupt_storage_fails_soft_to_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::with_dir(dir.path().to_path_buf());
        std::fs::write(dir.path().join(TRANSCRIPT_FILE), "{{{").unwrap();
        std::fs::write(dir.path().join(PROGRESS_FILE), "not json").unwrap();

        let (transcript, progress) = store.load();
        assert!(transcript.is_empty());
        assert!(progress.topics.is_empty());
    }

    #[test]
    fn clear_removes_both_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::with_dir(dir.path().to_path_buf());
        let (transcript, progress) = sample_state();
        store.save(&transcript, &progress);
        store.clear();

        let (loaded_transcript, loaded_progress) = store.load();
        assert!(loaded_transcript.is_empty());
        assert!(loaded_progress.topics.is_empty());
    }
}
