use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use super::error::ErrorStatus;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Leaving,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MediaFlags {
    pub muted: bool,
    pub deafened: bool,
    pub video: bool,
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CaptureStatus {
    #[default]
    Inactive,
    Live {
        device: String,
    },
    /// Capture could not be acquired; the session stays joined without audio.
    NoAudio,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<String>,
    pub self_mute: bool,
    pub self_deaf: bool,
    pub self_video: bool,
    pub self_stream: bool,
    /// True when outbound audio is gated: deafened or muted.
    pub effective_mute: bool,
    pub capture: CaptureStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantView {
    pub user_id: String,
    pub channel_id: String,
    pub flags: MediaFlags,
    pub speaking: bool,
    pub is_local: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RosterSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub participants: Vec<ParticipantView>,
}

impl RosterSnapshot {
    pub fn speaking_ids(&self) -> Vec<&str> {
        self.participants
            .iter()
            .filter(|participant| participant.speaking)
            .map(|participant| participant.user_id.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpeakingEvent {
    pub user_id: String,
    pub speaking: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Input,
    Output,
    Video,
}

impl DeviceKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
    pub kind: DeviceKind,
    #[serde(default)]
    pub is_default: bool,
}

/// `device_id: None` means the system default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSelection {
    pub kind: DeviceKind,
    pub device_id: Option<String>,
}

impl DeviceSelection {
    pub fn new(kind: DeviceKind, device_id: Option<String>) -> Self {
        Self { kind, device_id }
    }

    pub fn system_default(kind: DeviceKind) -> Self {
        Self::new(kind, None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DevicesSnapshot {
    pub inputs: Vec<DeviceInfo>,
    pub outputs: Vec<DeviceInfo>,
    pub videos: Vec<DeviceInfo>,
    pub selected_input: Option<String>,
    pub selected_output: Option<String>,
    pub selected_video: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceChange {
    pub kind: DeviceKind,
    pub added: Vec<DeviceInfo>,
    pub removed: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum VoiceEvent {
    Speaking(SpeakingEvent),
    DevicesChanged(DeviceChange),
    Error(ErrorStatus),
}

/// Write side of the observable model. Owned by the session worker.
pub struct StatePublisher {
    session: watch::Sender<SessionSnapshot>,
    roster: watch::Sender<RosterSnapshot>,
    devices: watch::Sender<DevicesSnapshot>,
    events: broadcast::Sender<VoiceEvent>,
}

/// Read side handed to UI surfaces. Cheap to clone; every clone sees the
/// latest snapshots.
#[derive(Clone)]
pub struct StateObserver {
    session: watch::Receiver<SessionSnapshot>,
    roster: watch::Receiver<RosterSnapshot>,
    devices: watch::Receiver<DevicesSnapshot>,
    events: broadcast::Sender<VoiceEvent>,
}

pub fn state_channel() -> (StatePublisher, StateObserver) {
    let (session_tx, session_rx) = watch::channel(SessionSnapshot::default());
    let (roster_tx, roster_rx) = watch::channel(RosterSnapshot::default());
    let (devices_tx, devices_rx) = watch::channel(DevicesSnapshot::default());
    let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

    (
        StatePublisher {
            session: session_tx,
            roster: roster_tx,
            devices: devices_tx,
            events: events_tx.clone(),
        },
        StateObserver {
            session: session_rx,
            roster: roster_rx,
            devices: devices_rx,
            events: events_tx,
        },
    )
}

fn replace_if_changed<T: PartialEq>(sender: &watch::Sender<T>, next: T) -> bool {
    sender.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    })
}

impl StatePublisher {
    pub fn publish_session(&self, next: SessionSnapshot) -> bool {
        replace_if_changed(&self.session, next)
    }

    pub fn publish_roster(&self, next: RosterSnapshot) -> bool {
        replace_if_changed(&self.roster, next)
    }

    pub fn publish_devices(&self, next: DevicesSnapshot) -> bool {
        replace_if_changed(&self.devices, next)
    }

    pub fn emit(&self, event: VoiceEvent) {
        // No subscribers is fine; snapshots still carry the state.
        let _ = self.events.send(event);
    }

    pub fn emit_speaking(&self, payload: SpeakingEvent) {
        self.emit(VoiceEvent::Speaking(payload));
    }

    pub fn emit_error(&self, payload: ErrorStatus) {
        self.emit(VoiceEvent::Error(payload));
    }
}

impl StateObserver {
    pub fn session(&self) -> SessionSnapshot {
        self.session.borrow().clone()
    }

    pub fn roster(&self) -> RosterSnapshot {
        self.roster.borrow().clone()
    }

    pub fn devices(&self) -> DevicesSnapshot {
        self.devices.borrow().clone()
    }

    pub fn watch_session(&self) -> watch::Receiver<SessionSnapshot> {
        self.session.clone()
    }

    pub fn watch_roster(&self) -> watch::Receiver<RosterSnapshot> {
        self.roster.clone()
    }

    pub fn watch_devices(&self) -> watch::Receiver<DevicesSnapshot> {
        self.devices.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }
}
