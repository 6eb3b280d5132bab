use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::error::ConnectionError;
use crate::core::events::MediaFlags;

const TRANSPORT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub channel_id: String,
    pub guild_id: String,
    pub user_id: String,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// Media-state changes announced to the server while connected. Joining and
/// leaving go through [`Transport::connect`] and [`Transport::disconnect`]
/// because they have a completion the session waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ControlEvent {
    Mute(bool),
    Deafen(bool),
    StreamStart,
    StreamStop,
    VideoToggle(bool),
}

/// Which capture a frame came from. Each source has its own sequence space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioSource {
    Microphone,
    /// Loopback audio sent while a screen share is live.
    SystemAudio,
}

/// One captured frame, borrowed from the session for the duration of the send.
#[derive(Debug, Clone, Copy)]
pub struct OutboundFrame<'a> {
    pub source: AudioSource,
    pub sequence: u64,
    pub pcm: &'a [f32],
    pub level: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ParticipantJoined {
        channel_id: String,
        user_id: String,
        flags: MediaFlags,
    },
    ParticipantLeft {
        user_id: String,
    },
    LevelReport {
        user_id: String,
        level: u8,
    },
    FlagsChanged {
        user_id: String,
        flags: MediaFlags,
    },
    /// Decoded mono 48 kHz audio from a remote participant.
    RemoteAudio {
        user_id: String,
        samples: Vec<f32>,
    },
}

/// Signalling and media path to the voice server.
///
/// `send_control` and `send_frame` are called from the session's media tick
/// and must not block; queue internally if the wire is busy.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, request: &JoinRequest) -> Result<(), ConnectionError>;

    async fn disconnect(&self, channel_id: &str) -> Result<(), ConnectionError>;

    fn send_control(&self, event: ControlEvent);

    fn send_frame(&self, frame: &OutboundFrame<'_>);
}

/// Bounded inbound path from a transport to the session worker.
pub fn transport_event_channel() -> (mpsc::Sender<TransportEvent>, mpsc::Receiver<TransportEvent>) {
    mpsc::channel(TRANSPORT_EVENT_CAPACITY)
}
