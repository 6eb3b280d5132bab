use crate::core::error::StreamError;
use crate::core::events::DeviceInfo;

/// Screen share and camera capture, provided by the embedding platform.
pub trait ShareBackend: Send + Sync + 'static {
    fn list_cameras(&self) -> Vec<DeviceInfo> {
        Vec::new()
    }

    fn start_stream(&self) -> Result<(), StreamError>;

    fn stop_stream(&self);

    fn start_camera(&self, device_id: Option<&str>) -> Result<(), StreamError>;

    fn stop_camera(&self);
}

/// Used when the platform has no capture support wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableShare;

impl ShareBackend for UnavailableShare {
    fn start_stream(&self) -> Result<(), StreamError> {
        Err(StreamError::NoCapturableSurface)
    }

    fn stop_stream(&self) {}

    fn start_camera(&self, _device_id: Option<&str>) -> Result<(), StreamError> {
        Err(StreamError::Backend("no camera backend".to_string()))
    }

    fn stop_camera(&self) {}
}
