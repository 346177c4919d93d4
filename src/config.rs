//! Configuration: API key, selected voice, and persona instruction.
//!
//! Stored as JSON under the platform config dir, load-or-default on read.
//! The API key can also come from the GEMINI_API_KEY environment variable,
//! which takes precedence over the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The fixed set of prebuilt voices the live endpoint accepts.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Voice {
    #[default]
    Aoede,
    Puck,
    Charon,
    Kore,
    Fenrir,
    Leda,
    Orus,
    Zephyr,
}

impl Voice {
    pub const ALL: [Voice; 8] = [
        Voice::Aoede,
        Voice::Puck,
        Voice::Charon,
        Voice::Kore,
        Voice::Fenrir,
        Voice::Leda,
        Voice::Orus,
        Voice::Zephyr,
    ];

    /// Name used in the setup message's prebuiltVoiceConfig.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Voice::Aoede => "Aoede",
            Voice::Puck => "Puck",
            Voice::Charon => "Charon",
            Voice::Kore => "Kore",
            Voice::Fenrir => "Fenrir",
            Voice::Leda => "Leda",
            Voice::Orus => "Orus",
            Voice::Zephyr => "Zephyr",
        }
    }

    pub fn from_name(name: &str) -> Option<Voice> {
        Voice::ALL
            .iter()
            .copied()
            .find(|v| v.wire_name().eq_ignore_ascii_case(name))
    }
}

fn default_persona() -> String {
    "You are a friendly, concise voice assistant. Keep spoken replies short.".to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    #[serde(default)]
    pub gemini_api_key: String,
    #[serde(default)]
    pub voice: Voice,
    #[serde(default = "default_persona")]
    pub persona: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gemini_api_key: String::new(),
            voice: Voice::default(),
            persona: default_persona(),
        }
    }
}

impl Config {
    /// Effective API key: environment variable first, then the config file.
    pub fn resolved_api_key(&self) -> String {
        match std::env::var("GEMINI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            _ => self.gemini_api_key.clone(),
        }
    }
}

pub fn get_config_path() -> PathBuf {
    let config_dir = dirs::config_dir().unwrap_or_default().join("voxlive");
    let _ = std::fs::create_dir_all(&config_dir);
    config_dir.join("config.json")
}

/// Load the config from `path`, falling back to defaults if the file is
/// missing or unreadable.
pub fn load_config(path: &Path) -> Config {
    if path.exists() {
        let data = std::fs::read_to_string(path).unwrap_or_default();
        serde_json::from_str(&data).unwrap_or_default()
    } else {
        Config::default()
    }
}

pub fn save_config(config: &Config, path: &Path) -> anyhow::Result<()> {
    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(path, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_names_round_trip() {
        for voice in Voice::ALL {
            assert_eq!(Voice::from_name(voice.wire_name()), Some(voice));
        }
        assert_eq!(Voice::from_name("aoede"), Some(Voice::Aoede));
        assert_eq!(Voice::from_name("robotron"), None);
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("nope.json"));
        assert!(config.gemini_api_key.is_empty());
        assert_eq!(config.voice, Voice::Aoede);
        assert!(!config.persona.is_empty());
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config {
            gemini_api_key: "k".to_string(),
            voice: Voice::Puck,
            persona: "test persona".to_string(),
        };
        save_config(&config, &path).unwrap();
        let loaded = load_config(&path);
        assert_eq!(loaded.gemini_api_key, "k");
        assert_eq!(loaded.voice, Voice::Puck);
        assert_eq!(loaded.persona, "test persona");
    }

    #[test]
    fn corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        let config = load_config(&path);
        assert_eq!(config.voice, Voice::Aoede);
    }
}
