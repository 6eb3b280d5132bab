pub mod aggregator;
pub mod audio_in;
pub mod audio_out;
pub mod devices;
pub mod frame_queue;
pub mod processing;
pub mod registry;
pub mod resampler;
pub mod session;
pub mod share;
pub mod transport;
pub mod vad;

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

pub use session::VoiceSession;

use crate::core::config::CaptureProfile;
use crate::core::error::DeviceError;
use crate::core::events::{DeviceInfo, DeviceKind};
use frame_queue::FrameProducer;

const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(3);

/// A running capture stream. Dropping it stops capture.
pub trait InputPipeline: Send {
    fn device_name(&self) -> &str;

    /// Set once the backend reports the device as gone or broken.
    fn has_failed(&self) -> bool {
        false
    }
}

/// A running playback stream. Dropping it stops playback.
pub trait OutputPipeline: Send {
    fn device_name(&self) -> &str;

    /// Queues mono 48 kHz samples for playback.
    fn play(&mut self, samples: &[f32]);

    fn has_failed(&self) -> bool {
        false
    }
}

/// Platform audio seam. `device_id: None` selects the system default.
pub trait AudioBackend: Send + Sync + 'static {
    fn list_devices(&self, kind: DeviceKind) -> Result<Vec<DeviceInfo>, DeviceError>;

    fn open_input(
        &self,
        device_id: Option<&str>,
        profile: CaptureProfile,
        producer: FrameProducer,
    ) -> Result<Box<dyn InputPipeline>, DeviceError>;

    fn open_output(&self, device_id: Option<&str>) -> Result<Box<dyn OutputPipeline>, DeviceError>;

    /// Loopback capture of what the machine is playing, shared with a screen.
    fn open_system_audio(
        &self,
        _producer: FrameProducer,
    ) -> Result<Box<dyn InputPipeline>, DeviceError> {
        Err(DeviceError::NoneAvailable("system audio"))
    }
}

/// cpal-backed audio. Capture and playback opened through one backend share
/// a far-end meter so echo suppression can hear the speakers.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    far_end: processing::FarEndMeter,
}

impl AudioBackend for CpalBackend {
    fn list_devices(&self, kind: DeviceKind) -> Result<Vec<DeviceInfo>, DeviceError> {
        match kind {
            DeviceKind::Input => audio_in::list_input_devices(),
            DeviceKind::Output => audio_out::list_output_devices(),
            DeviceKind::Video => Ok(Vec::new()),
        }
    }

    fn open_input(
        &self,
        device_id: Option<&str>,
        profile: CaptureProfile,
        producer: FrameProducer,
    ) -> Result<Box<dyn InputPipeline>, DeviceError> {
        let capture =
            audio_in::start_input_capture(device_id, profile, self.far_end.clone(), producer)?;
        Ok(Box::new(capture))
    }

    fn open_output(&self, device_id: Option<&str>) -> Result<Box<dyn OutputPipeline>, DeviceError> {
        let playback = audio_out::start_output_playback(device_id, self.far_end.clone())?;
        Ok(Box::new(playback))
    }

    fn open_system_audio(
        &self,
        producer: FrameProducer,
    ) -> Result<Box<dyn InputPipeline>, DeviceError> {
        let capture = audio_in::start_system_audio_capture(producer)?;
        Ok(Box::new(capture))
    }
}

/// Keeps a cpal stream alive on a dedicated thread.
///
/// `cpal::Stream` is not `Send` on every host, so the stream is built, played
/// and dropped on the same thread; the session only holds this handle.
pub(crate) struct StreamThread {
    stop_tx: Option<std_mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    /// Runs `open` on a new thread and waits for it to report the device name.
    pub(crate) fn spawn<F>(name: &str, open: F) -> Result<(Self, String), DeviceError>
    where
        F: FnOnce() -> Result<(cpal::Stream, String), DeviceError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match open() {
                    Ok((stream, device_name)) => {
                        if ready_tx.send(Ok(device_name)).is_err() {
                            return;
                        }
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                // Returns on stop or when the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|err| DeviceError::Backend(format!("failed to spawn audio thread: {err}")))?;

        match ready_rx.recv_timeout(STREAM_OPEN_TIMEOUT) {
            Ok(Ok(device_name)) => Ok((
                Self {
                    stop_tx: Some(stop_tx),
                    handle: Some(handle),
                },
                device_name,
            )),
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(err)
            }
            Err(_) => Err(DeviceError::Backend(format!(
                "{name} did not open within {}ms",
                STREAM_OPEN_TIMEOUT.as_millis()
            ))),
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("audio stream thread panicked");
            }
        }
    }
}

pub(crate) fn map_build_error(err: cpal::BuildStreamError, device_name: &str) -> DeviceError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => DeviceError::Removed(device_name.to_string()),
        cpal::BuildStreamError::StreamConfigNotSupported => {
            DeviceError::Unsupported(format!("stream config rejected by {device_name}"))
        }
        other => DeviceError::Backend(format!("failed to build stream on {device_name}: {other}")),
    }
}
