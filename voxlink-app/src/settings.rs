//! Persistent host settings (JSON file in the user data directory).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use voxlink_core::transport::{DEFAULT_MODEL, DEFAULT_VOICE};
use voxlink_core::{CaptureConfig, ConnectConfig, PlaybackConfig, SessionConfig};

/// Environment variables consulted for the API key, in order.
pub const API_KEY_VARS: &[&str] = &["VOXLINK_API_KEY", "GEMINI_API_KEY"];

/// Prebuilt voices the endpoint accepts.
const KNOWN_VOICES: &[&str] = &[
    "Aoede", "Charon", "Fenrir", "Kore", "Leda", "Orus", "Puck", "Zephyr",
];

const DEFAULT_INSTRUCTION: &str =
    "You are a concise, friendly voice assistant. Keep answers short and conversational.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub api_key: Option<String>,
    /// Overrides the public endpoint (proxies, local test servers).
    pub endpoint: Option<String>,
    pub outbound_queue_frames: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            preferred_output_device: None,
            model: DEFAULT_MODEL.into(),
            voice_name: DEFAULT_VOICE.into(),
            system_instruction: DEFAULT_INSTRUCTION.into(),
            api_key: None,
            endpoint: None,
            outbound_queue_frames: 4,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.preferred_input_device = trimmed(self.preferred_input_device.take());
        self.preferred_output_device = trimmed(self.preferred_output_device.take());
        self.api_key = trimmed(self.api_key.take());
        self.endpoint = trimmed(self.endpoint.take());
        self.model = normalize_model(&self.model);
        self.voice_name = normalize_voice_name(&self.voice_name);
        self.system_instruction = self.system_instruction.trim().to_string();
        self.outbound_queue_frames = self.outbound_queue_frames.clamp(1, 32);
    }

    /// Key from the file, else from the environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            API_KEY_VARS
                .iter()
                .filter_map(|var| std::env::var(var).ok())
                .find_map(|k| trimmed(Some(k)))
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            capture: CaptureConfig {
                preferred_device: self.preferred_input_device.clone(),
                ..CaptureConfig::default()
            },
            playback: PlaybackConfig {
                preferred_device: self.preferred_output_device.clone(),
                ..PlaybackConfig::default()
            },
            connect: ConnectConfig {
                model: self.model.clone(),
                voice_name: self.voice_name.clone(),
                system_instruction: Some(self.system_instruction.clone())
                    .filter(|s| !s.is_empty()),
                ..ConnectConfig::default()
            },
            outbound_queue_frames: self.outbound_queue_frames,
        }
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub fn normalize_model(raw: &str) -> String {
    let model = raw.trim();
    if model.is_empty() {
        DEFAULT_MODEL.into()
    } else if model.starts_with("models/") {
        model.into()
    } else {
        format!("models/{model}")
    }
}

pub fn normalize_voice_name(raw: &str) -> String {
    let voice = raw.trim();
    KNOWN_VOICES
        .iter()
        .find(|v| v.eq_ignore_ascii_case(voice))
        .copied()
        .unwrap_or(DEFAULT_VOICE)
        .into()
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("voxlink")
            .join("settings.json")
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("Library")
            .join("Application Support")
            .join("voxlink")
            .join("settings.json")
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".config")
            })
            .join("voxlink")
            .join("settings.json")
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_and_clamps() {
        let mut s = AppSettings {
            preferred_input_device: Some("   ".into()),
            preferred_output_device: Some(" Speakers ".into()),
            model: "gemini-live".into(),
            voice_name: "kore".into(),
            api_key: Some(" k ".into()),
            outbound_queue_frames: 0,
            ..AppSettings::default()
        };
        s.normalize();

        assert_eq!(s.preferred_input_device, None);
        assert_eq!(s.preferred_output_device.as_deref(), Some("Speakers"));
        assert_eq!(s.model, "models/gemini-live");
        assert_eq!(s.voice_name, "Kore");
        assert_eq!(s.api_key.as_deref(), Some("k"));
        assert_eq!(s.outbound_queue_frames, 1);
    }

    #[test]
    fn unknown_voice_falls_back() {
        assert_eq!(normalize_voice_name("Robot"), DEFAULT_VOICE);
        assert_eq!(normalize_voice_name(""), DEFAULT_VOICE);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: AppSettings = serde_json::from_str(r#"{"voiceName":"Puck"}"#).unwrap();
        assert_eq!(parsed.voice_name, "Puck");
        assert_eq!(parsed.model, DEFAULT_MODEL);
        assert_eq!(parsed.outbound_queue_frames, 4);
    }

    #[test]
    fn session_config_carries_devices_and_voice() {
        let s = AppSettings {
            preferred_input_device: Some("USB Mic".into()),
            system_instruction: String::new(),
            ..AppSettings::default()
        };
        let cfg = s.session_config();
        assert_eq!(cfg.capture.preferred_device.as_deref(), Some("USB Mic"));
        assert_eq!(cfg.capture.sample_rate, 16_000);
        assert_eq!(cfg.playback.sample_rate, 24_000);
        assert_eq!(cfg.connect.voice_name, DEFAULT_VOICE);
        assert_eq!(cfg.connect.system_instruction, None);
    }

    #[test]
    fn save_then_load() {
        let dir = std::env::temp_dir().join(format!("voxlink-settings-{}", std::process::id()));
        let path = dir.join("settings.json");
        let settings = AppSettings {
            voice_name: "Leda".into(),
            ..AppSettings::default()
        };
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path), settings);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let loaded = load_settings(Path::new("/nonexistent/voxlink/settings.json"));
        assert_eq!(loaded, AppSettings::default());
    }
}
