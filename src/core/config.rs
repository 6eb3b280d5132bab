use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const APP_CONFIG_DIR: &str = "Harmony";
const APP_CONFIG_FILE: &str = "voice.json";
const DEV_CONFIG_FILE: &str = "dev-config.json";
const DEV_CONFIG_ENV: &str = "HARMONY_DEV_CONFIG";

/// Levels below this are louder than -100 dBov and count as sound.
pub const DEFAULT_SPEAKING_THRESHOLD: u8 = 100;

/// Microphone constraint profile requested when capture is acquired.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptureProfile {
    #[serde(default = "default_true")]
    pub noise_suppression: bool,
    #[serde(default = "default_true")]
    pub echo_cancellation: bool,
    #[serde(default = "default_true")]
    pub auto_gain: bool,
}

impl Default for CaptureProfile {
    fn default() -> Self {
        Self {
            noise_suppression: true,
            echo_cancellation: true,
            auto_gain: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpeakingConfig {
    #[serde(default = "default_speaking_threshold")]
    pub threshold: u8,
    #[serde(default = "default_attack_frames")]
    pub attack_frames: u32,
    #[serde(default = "default_release_frames")]
    pub release_frames: u32,
    #[serde(default = "default_hold_window_ms")]
    pub hold_window_ms: u64,
}

impl Default for SpeakingConfig {
    fn default() -> Self {
        Self {
            threshold: default_speaking_threshold(),
            attack_frames: default_attack_frames(),
            release_frames: default_release_frames(),
            hold_window_ms: default_hold_window_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoiceConfig {
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default)]
    pub input_device: Option<String>,
    #[serde(default)]
    pub output_device: Option<String>,
    #[serde(default)]
    pub video_device: Option<String>,
    #[serde(default)]
    pub capture: CaptureProfile,
    #[serde(default)]
    pub speaking: SpeakingConfig,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    #[serde(default = "default_leave_timeout_ms")]
    pub leave_timeout_ms: u64,
    #[serde(default = "default_swap_timeout_ms")]
    pub swap_timeout_ms: u64,
    #[serde(default = "default_participant_timeout_ms")]
    pub participant_timeout_ms: u64,
    #[serde(default = "default_device_poll_ms")]
    pub device_poll_ms: u64,
    #[serde(default = "default_frame_queue_frames")]
    pub frame_queue_frames: usize,
    #[serde(default = "default_level_queue_frames")]
    pub level_queue_frames: usize,
    /// Keys this build does not know about, kept verbatim.
    #[serde(flatten)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
            input_device: None,
            output_device: None,
            video_device: None,
            capture: CaptureProfile::default(),
            speaking: SpeakingConfig::default(),
            join_timeout_ms: default_join_timeout_ms(),
            leave_timeout_ms: default_leave_timeout_ms(),
            swap_timeout_ms: default_swap_timeout_ms(),
            participant_timeout_ms: default_participant_timeout_ms(),
            device_poll_ms: default_device_poll_ms(),
            frame_queue_frames: default_frame_queue_frames(),
            level_queue_frames: default_level_queue_frames(),
            extensions: BTreeMap::new(),
        }
    }
}

impl VoiceConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_timeout_ms)
    }

    pub fn swap_timeout(&self) -> Duration {
        Duration::from_millis(self.swap_timeout_ms)
    }

    pub fn participant_timeout(&self) -> Duration {
        Duration::from_millis(self.participant_timeout_ms)
    }

    pub fn device_poll_interval(&self) -> Duration {
        Duration::from_millis(self.device_poll_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.speaking.threshold > 127 {
            return Err(ConfigError::Invalid(
                "speaking.threshold must be within 0..=127".to_string(),
            ));
        }
        if self.speaking.attack_frames == 0 {
            return Err(ConfigError::Invalid(
                "speaking.attack_frames must be at least 1".to_string(),
            ));
        }
        if self.speaking.release_frames < self.speaking.attack_frames {
            return Err(ConfigError::Invalid(
                "speaking.release_frames must be >= speaking.attack_frames".to_string(),
            ));
        }
        let timeouts = [
            ("join_timeout_ms", self.join_timeout_ms),
            ("leave_timeout_ms", self.leave_timeout_ms),
            ("swap_timeout_ms", self.swap_timeout_ms),
            ("device_poll_ms", self.device_poll_ms),
            ("participant_timeout_ms", self.participant_timeout_ms),
            ("speaking.hold_window_ms", self.speaking.hold_window_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
        }
        if self.frame_queue_frames == 0 || self.level_queue_frames == 0 {
            return Err(ConfigError::Invalid(
                "queue capacities must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: VoiceConfig,
    pub path: PathBuf,
    pub is_dev_override: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to resolve config base directory")]
    NoConfigDirectory,
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    ParseFile {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub fn load_config() -> Result<LoadedConfig, ConfigError> {
    if let Some(dev_path) = find_dev_config() {
        let config = read_config(&dev_path)?;
        return Ok(LoadedConfig {
            config,
            path: dev_path,
            is_dev_override: true,
        });
    }

    let path = persistent_config_path()?;
    let config = if path.exists() {
        read_config(&path)?
    } else {
        log::info!(
            "no voice config at {}; using defaults",
            path.display()
        );
        VoiceConfig::default()
    };

    Ok(LoadedConfig {
        config,
        path,
        is_dev_override: false,
    })
}

pub fn persistent_config_path() -> Result<PathBuf, ConfigError> {
    let base_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDirectory)?;
    Ok(base_dir.join(APP_CONFIG_DIR).join(APP_CONFIG_FILE))
}

pub fn read_config(path: &Path) -> Result<VoiceConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&raw).map_err(|err| match err {
        ConfigError::ParseFile { source, .. } => ConfigError::ParseFile {
            path: path.display().to_string(),
            source,
        },
        other => other,
    })
}

pub fn parse_config(raw: &str) -> Result<VoiceConfig, ConfigError> {
    let config: VoiceConfig =
        serde_json::from_str(raw).map_err(|source| ConfigError::ParseFile {
            path: "<inline>".to_string(),
            source,
        })?;
    config.validate()?;
    Ok(config)
}

fn find_dev_config() -> Option<PathBuf> {
    if let Ok(path_from_env) = std::env::var(DEV_CONFIG_ENV) {
        let from_env = PathBuf::from(path_from_env);
        if from_env.exists() {
            return Some(from_env);
        }
    }

    let cwd = std::env::current_dir().ok()?;
    let direct = cwd.join(DEV_CONFIG_FILE);
    if direct.exists() {
        return Some(direct);
    }

    let parent = cwd.parent()?.join(DEV_CONFIG_FILE);
    if parent.exists() {
        return Some(parent);
    }

    None
}

const fn default_true() -> bool {
    true
}

fn default_user_id() -> String {
    "local".to_string()
}

const fn default_speaking_threshold() -> u8 {
    DEFAULT_SPEAKING_THRESHOLD
}

const fn default_attack_frames() -> u32 {
    3
}

const fn default_release_frames() -> u32 {
    15
}

const fn default_hold_window_ms() -> u64 {
    650
}

const fn default_join_timeout_ms() -> u64 {
    5_000
}

const fn default_leave_timeout_ms() -> u64 {
    2_000
}

const fn default_swap_timeout_ms() -> u64 {
    1_000
}

const fn default_participant_timeout_ms() -> u64 {
    30_000
}

const fn default_device_poll_ms() -> u64 {
    2_000
}

const fn default_frame_queue_frames() -> usize {
    50
}

const fn default_level_queue_frames() -> usize {
    8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trip_serializes() {
        let config = VoiceConfig::default();
        let serialized = serde_json::to_string(&config).expect("serializes config");
        let back: VoiceConfig = serde_json::from_str(&serialized).expect("deserializes config");
        assert_eq!(back, config);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_keys_land_in_extensions() {
        let config = parse_config(r#"{"user_id":"u1","spatial_audio":{"enabled":true}}"#)
            .expect("parses config");
        assert_eq!(config.user_id, "u1");
        assert_eq!(
            config.extensions.get("spatial_audio"),
            Some(&serde_json::json!({"enabled": true}))
        );
        assert_eq!(config.join_timeout_ms, 5_000);
    }

    #[test]
    fn partial_capture_profile_keeps_other_defaults() {
        let config = parse_config(r#"{"capture":{"noise_suppression":false}}"#)
            .expect("parses config");
        assert!(!config.capture.noise_suppression);
        assert!(config.capture.echo_cancellation);
        assert!(config.capture.auto_gain);
    }

    #[test]
    fn release_shorter_than_attack_is_rejected() {
        let err = parse_config(r#"{"speaking":{"attack_frames":5,"release_frames":2}}"#)
            .expect_err("rejects config");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = parse_config(r#"{"join_timeout_ms":0}"#).expect_err("rejects config");
        assert!(err.to_string().contains("join_timeout_ms"));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        for key in ["device_poll_ms", "participant_timeout_ms"] {
            let err = parse_config(&format!(r#"{{"{key}":0}}"#)).expect_err("rejects config");
            assert!(err.to_string().contains(key), "{err}");
        }
    }
}
