use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::{CaptureConfig, PlaybackConfig, CAPTURE_FRAME_SIZE, SAMPLE_RATE};
use crate::error::VoiceError;
use crate::streaming::REALTIME_API_URL;

const APP_DIR_NAME: &str = "vokey-voice";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Overrides `endpoint_url` when set
pub const ENDPOINT_ENV_VAR: &str = "VOKEY_VOICE_ENDPOINT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    /// WebSocket endpoint of the realtime service (or of a proxy in front of it).
    pub endpoint_url: String,

    /// Samples per outbound capture frame.
    pub capture_frame_size: usize,

    /// Frames buffered between the capture callback and the network loop.
    /// When full, new frames are dropped (and counted) rather than blocking the callback.
    pub capture_queue_depth: usize,

    /// Outbound JSON messages buffered ahead of the socket.
    pub outbound_queue_depth: usize,

    /// WebSocket close code the service uses to reject a duplicate connection.
    pub duplicate_close_code: u16,

    pub connect_timeout_ms: u64,

    /// Upper bound on letting queued assistant audio finish after the server closes normally.
    pub drain_timeout_ms: u64,

    /// Transcript line added when a connection opens. Empty disables it.
    pub welcome_message: String,

    /// Input device name; system default when unset.
    pub input_device: Option<String>,

    /// Output device name; system default when unset.
    pub output_device: Option<String>,

    /// Requested from the input device where the platform supports it.
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain: bool,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            endpoint_url: REALTIME_API_URL.to_string(),
            capture_frame_size: CAPTURE_FRAME_SIZE,
            capture_queue_depth: 32,
            outbound_queue_depth: 64,
            duplicate_close_code: 4409,
            connect_timeout_ms: 10_000,
            drain_timeout_ms: 5_000,
            welcome_message: "Connected. Start a conversation or type a message.".to_string(),
            input_device: None,
            output_device: None,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain: true,
        }
    }
}

impl VoiceSettings {
    /// Endpoint after applying the environment override
    pub fn effective_endpoint(&self) -> String {
        match std::env::var(ENDPOINT_ENV_VAR) {
            Ok(url) if !url.trim().is_empty() => url.trim().to_string(),
            _ => self.endpoint_url.clone(),
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            device_name: self.input_device.clone(),
            sample_rate: SAMPLE_RATE,
            frame_size: self.capture_frame_size.max(1),
            echo_cancellation: self.echo_cancellation,
            noise_suppression: self.noise_suppression,
            auto_gain: self.auto_gain,
        }
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            device_name: self.output_device.clone(),
            sample_rate: SAMPLE_RATE,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// `<config dir>/vokey-voice/settings.json`
pub fn settings_path() -> Result<PathBuf, VoiceError> {
    let dir = dirs::config_dir()
        .ok_or_else(|| VoiceError::Config("Could not determine config directory".to_string()))?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> VoiceSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            VoiceSettings::default()
        }
    }
}

pub fn save_settings(settings: &VoiceSettings) -> Result<(), VoiceError> {
    save_settings_to(&settings_path()?, settings)
}

/// Missing or unreadable files fall back to defaults
pub fn load_settings_from(path: &Path) -> VoiceSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<VoiceSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                VoiceSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => VoiceSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            VoiceSettings::default()
        }
    }
}

pub fn save_settings_to(path: &Path, settings: &VoiceSettings) -> Result<(), VoiceError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            VoiceError::Config(format!("Failed to create config directory {:?}: {}", parent, e))
        })?;
    }

    let contents = serde_json::to_string_pretty(settings)
        .map_err(|e| VoiceError::Config(format!("Serialize settings: {}", e)))?;

    // Temp file in the same directory, then rename over the target
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| VoiceError::Config(format!("Write temp settings {:?}: {}", tmp_path, e)))?;

    // Windows rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(VoiceError::Config(format!(
                    "Remove existing settings file {:?}: {}",
                    path, e
                )));
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|e| {
        VoiceError::Config(format!(
            "Rename temp settings {:?} to {:?}: {}",
            tmp_path, path, e
        ))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("nope.json"));
        assert_eq!(settings, VoiceSettings::default());
        assert_eq!(settings.capture_frame_size, 4096);
        assert_eq!(settings.duplicate_close_code, 4409);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);

        let settings = VoiceSettings {
            endpoint_url: "wss://proxy.example/voice".to_string(),
            input_device: Some("USB Mic".to_string()),
            drain_timeout_ms: 1234,
            ..Default::default()
        };
        save_settings_to(&path, &settings).unwrap();

        assert_eq!(load_settings_from(&path), settings);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{ "capture_queue_depth": 4 }"#).unwrap();

        let settings = load_settings_from(&path);
        assert_eq!(settings.capture_queue_depth, 4);
        assert_eq!(settings.outbound_queue_depth, 64);
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();

        assert_eq!(load_settings_from(&path), VoiceSettings::default());
    }

    #[test]
    fn test_capture_config_follows_settings() {
        let settings = VoiceSettings {
            capture_frame_size: 0,
            echo_cancellation: false,
            ..Default::default()
        };
        let config = settings.capture_config();
        assert_eq!(config.frame_size, 1);
        assert_eq!(config.sample_rate, 24_000);
        assert!(!config.echo_cancellation);
    }
}
