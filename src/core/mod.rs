pub mod config;
pub mod error;
pub mod events;
pub mod voice;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use config::{load_config, CaptureProfile, ConfigError, LoadedConfig, VoiceConfig};
use events::{DevicesSnapshot, RosterSnapshot, SessionSnapshot, StateObserver};
use voice::share::{ShareBackend, UnavailableShare};
use voice::transport::{Transport, TransportEvent};
use voice::{AudioBackend, CpalBackend, VoiceSession};

#[derive(Debug, Clone, Serialize)]
pub struct BootstrapState {
    pub config: VoiceConfig,
    pub session: SessionSnapshot,
    pub roster: RosterSnapshot,
    pub devices: DevicesSnapshot,
}

/// Commands as a UI layer sends them, e.g. decoded from an IPC message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum UiCommand {
    JoinChannel { channel_id: String, guild_id: String },
    LeaveChannel,
    ToggleMute,
    ToggleDeaf,
    StartStream,
    StopStream,
    ToggleVideo,
    SetInputDevice { device_id: Option<String> },
    SetOutputDevice { device_id: Option<String> },
    SetVideoDevice { device_id: Option<String> },
    SetCaptureProfile { profile: CaptureProfile },
    RefreshDevices,
}

/// Entry point for an embedding application: configuration plus one voice
/// session.
pub struct VoiceCore {
    config_path: PathBuf,
    config_is_dev_override: bool,
    config: VoiceConfig,
    session: VoiceSession,
}

impl VoiceCore {
    /// Loads configuration and starts the session on the platform audio
    /// backend. Must be called inside a tokio runtime.
    pub fn start(
        transport: Arc<dyn Transport>,
        transport_events: mpsc::Receiver<TransportEvent>,
    ) -> Result<Self, ConfigError> {
        let loaded = load_config()?;
        Self::with_backends(
            loaded,
            transport,
            transport_events,
            Arc::new(CpalBackend::default()),
            Arc::new(UnavailableShare),
        )
    }

    /// Starts the session on caller-provided backends. Fails if the loaded
    /// configuration does not validate.
    pub fn with_backends(
        loaded: LoadedConfig,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::Receiver<TransportEvent>,
        audio: Arc<dyn AudioBackend>,
        share: Arc<dyn ShareBackend>,
    ) -> Result<Self, ConfigError> {
        if loaded.is_dev_override {
            log::info!("using dev config override at {}", loaded.path.display());
        }
        let session = VoiceSession::spawn(
            loaded.config.clone(),
            transport,
            audio,
            share,
            transport_events,
        )?;

        Ok(Self {
            config_path: loaded.path,
            config_is_dev_override: loaded.is_dev_override,
            config: loaded.config,
            session,
        })
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn is_dev_override(&self) -> bool {
        self.config_is_dev_override
    }

    pub fn session(&self) -> &VoiceSession {
        &self.session
    }

    pub fn observer(&self) -> StateObserver {
        self.session.observer()
    }

    pub fn bootstrap(&self) -> BootstrapState {
        let observer = self.session.observer();
        BootstrapState {
            config: self.config.clone(),
            session: observer.session(),
            roster: observer.roster(),
            devices: observer.devices(),
        }
    }

    pub fn dispatch(&self, command: UiCommand) {
        log::debug!("ui command: {command:?}");
        let session = &self.session;
        match command {
            UiCommand::JoinChannel {
                channel_id,
                guild_id,
            } => session.join_channel(channel_id, guild_id),
            UiCommand::LeaveChannel => session.leave_channel(),
            UiCommand::ToggleMute => session.toggle_mute(),
            UiCommand::ToggleDeaf => session.toggle_deaf(),
            UiCommand::StartStream => session.start_stream(),
            UiCommand::StopStream => session.stop_stream(),
            UiCommand::ToggleVideo => session.toggle_video(),
            UiCommand::SetInputDevice { device_id } => session.apply_audio_input_device(device_id),
            UiCommand::SetOutputDevice { device_id } => {
                session.apply_audio_output_device(device_id)
            }
            UiCommand::SetVideoDevice { device_id } => session.apply_video_device(device_id),
            UiCommand::SetCaptureProfile { profile } => session.reapply_audio_constraints(profile),
            UiCommand::RefreshDevices => session.refresh_devices(),
        }
    }

    pub async fn shutdown(self) {
        self.session.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::core::error::ConnectionError;
    use crate::core::voice::transport::{
        transport_event_channel, ControlEvent, JoinRequest, OutboundFrame,
    };

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn connect(&self, _request: &JoinRequest) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn disconnect(&self, _channel_id: &str) -> Result<(), ConnectionError> {
            Ok(())
        }

        fn send_control(&self, _event: ControlEvent) {}

        fn send_frame(&self, _frame: &OutboundFrame<'_>) {}
    }

    #[test]
    fn invalid_config_is_refused_before_the_worker_starts() {
        let loaded = LoadedConfig {
            config: VoiceConfig {
                device_poll_ms: 0,
                ..VoiceConfig::default()
            },
            path: PathBuf::from("voice.json"),
            is_dev_override: false,
        };
        let (_tx, rx) = transport_event_channel();

        // No runtime here: reaching the spawn would panic.
        let result = VoiceCore::with_backends(
            loaded,
            Arc::new(NullTransport),
            rx,
            Arc::new(CpalBackend::default()),
            Arc::new(UnavailableShare),
        );

        match result {
            Err(err) => assert!(err.to_string().contains("device_poll_ms"), "{err}"),
            Ok(_) => panic!("zero poll interval accepted"),
        }
    }

    #[test]
    fn ui_commands_decode_from_tagged_json() {
        let join: UiCommand = serde_json::from_str(
            r#"{"command":"join_channel","channel_id":"general","guild_id":"g1"}"#,
        )
        .expect("join decodes");
        assert_eq!(
            join,
            UiCommand::JoinChannel {
                channel_id: "general".to_string(),
                guild_id: "g1".to_string(),
            }
        );

        let default_input: UiCommand =
            serde_json::from_str(r#"{"command":"set_input_device","device_id":null}"#)
                .expect("device decodes");
        assert_eq!(default_input, UiCommand::SetInputDevice { device_id: None });

        let profile: UiCommand = serde_json::from_str(
            r#"{"command":"set_capture_profile","profile":{"noise_suppression":false}}"#,
        )
        .expect("profile decodes");
        assert_eq!(
            profile,
            UiCommand::SetCaptureProfile {
                profile: CaptureProfile {
                    noise_suppression: false,
                    ..CaptureProfile::default()
                }
            }
        );
    }
}
