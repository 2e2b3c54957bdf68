use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_model() -> String {
    "gemini-2.5-flash-native-audio-preview-09-2025".to_string()
}
fn default_voice() -> String {
    "Zephyr".to_string()
}
fn default_system_instruction() -> String {
    "You are \"Chip\", an adaptive, friendly and expert AI algebra tutor for \
high-school students. Your goal is to make algebra approachable and fun.\n\
- Personality: you are patient, encouraging, and use simple analogies.\n\
- Visual learning: when you explain a multi-step process, use the \
'displayVisualSolution' function to lay it out clearly.\n\
- Auditory learning: explain concepts verbally, clearly and concisely.\n\
- Kinesthetic learning: to reinforce a concept, use the 'askFillInTheBlank' \
function. Ask a question where the student has to say the answer that \
completes a step, then evaluate their spoken answer.\n\
- Problem management: when the student asks for a problem, use \
'generateAlgebraProblem'. After they answer, evaluate their solution and \
then use 'trackProgress' to record whether it was correct.\n\
- Attention: if the student seems distracted, kindly ask whether they need \
a break or want to try a different approach.\n\
- Opening: greet the student, introduce yourself as \"Chip\", and ask which \
algebra topic they would like to work on today."
        .to_string()
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub gemini_api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_system_instruction")]
    pub system_instruction: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gemini_api_key: String::new(),
            model: default_model(),
            voice: default_voice(),
            system_instruction: default_system_instruction(),
        }
    }
}

pub fn get_config_dir() -> PathBuf {
    let dir = dirs::config_dir()
        .unwrap_or_default()
        .join("voice-algebra-tutor");
    let _ = std::fs::create_dir_all(&dir);
    dir
}

pub fn get_config_path() -> PathBuf {
    get_config_dir().join("config.json")
}

pub fn load_config() -> Config {
    let path = get_config_path();
    if path.exists() {
        let data = std::fs::read_to_string(path).unwrap_or_default();
        serde_json::from_str(&data).unwrap_or_default()
    } else {
        // First run: write the defaults so the user has a file to edit
        let config = Config::default();
        save_config(&config);
        config
    }
}

pub fn save_config(config: &Config) {
    let path = get_config_path();
    let data = serde_json::to_string_pretty(config).unwrap();
    if let Err(e) = std::fs::write(path, data) {
        eprintln!("[Config] Failed to write config: {}", e);
    }
}
