pub mod core;

pub use crate::core::config::{load_config, CaptureProfile, SpeakingConfig, VoiceConfig};
pub use crate::core::error::{
    ConnectionError, DeviceError, ErrorKind, ErrorStatus, StreamError, TransientNetworkError,
    VoiceError,
};
pub use crate::core::events::{
    CaptureStatus, ConnectionState, DeviceInfo, DeviceKind, DeviceSelection, DevicesSnapshot,
    MediaFlags, RosterSnapshot, SessionSnapshot, StateObserver, VoiceEvent,
};
pub use crate::core::voice::aggregator::{AudioFrame, AudioFrameAggregator};
pub use crate::core::voice::processing::{CaptureProcessor, FarEndMeter};
pub use crate::core::voice::registry::ParticipantRegistry;
pub use crate::core::voice::share::{ShareBackend, UnavailableShare};
pub use crate::core::voice::transport::{
    transport_event_channel, AudioSource, ControlEvent, JoinRequest, OutboundFrame, Transport,
    TransportEvent,
};
pub use crate::core::voice::{AudioBackend, CpalBackend, VoiceSession};
pub use crate::core::{BootstrapState, UiCommand, VoiceCore};
