use std::sync::Arc;

use super::share::ShareBackend;
use super::AudioBackend;
use crate::core::events::{
    DeviceChange, DeviceInfo, DeviceKind, DeviceSelection, DevicesSnapshot,
};

/// One enumeration pass. A kind whose listing failed is `None` and keeps its
/// previous list when applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceLists {
    pub inputs: Option<Vec<DeviceInfo>>,
    pub outputs: Option<Vec<DeviceInfo>>,
    pub videos: Option<Vec<DeviceInfo>>,
}

impl DeviceLists {
    fn take(&mut self, kind: DeviceKind) -> Option<Vec<DeviceInfo>> {
        match kind {
            DeviceKind::Input => self.inputs.take(),
            DeviceKind::Output => self.outputs.take(),
            DeviceKind::Video => self.videos.take(),
        }
    }
}

/// Queries the platform for devices. Enumeration can block for a long time
/// on some hosts, so this half is cheap to clone and safe to move onto a
/// blocking thread.
#[derive(Clone)]
pub struct DeviceEnumerator {
    audio: Arc<dyn AudioBackend>,
    share: Arc<dyn ShareBackend>,
}

impl DeviceEnumerator {
    pub fn new(audio: Arc<dyn AudioBackend>, share: Arc<dyn ShareBackend>) -> Self {
        Self { audio, share }
    }

    pub fn enumerate(&self) -> DeviceLists {
        DeviceLists {
            inputs: self.list_audio(DeviceKind::Input),
            outputs: self.list_audio(DeviceKind::Output),
            videos: Some(self.share.list_cameras()),
        }
    }

    fn list_audio(&self, kind: DeviceKind) -> Option<Vec<DeviceInfo>> {
        match self.audio.list_devices(kind) {
            Ok(devices) => Some(devices),
            Err(err) => {
                log::warn!("failed to enumerate {} devices: {err}", kind.label());
                None
            }
        }
    }
}

/// Device lists plus the current selection per kind.
///
/// cpal has no hot-plug callbacks, so changes are found by diffing
/// successive enumerations.
pub struct DeviceManager {
    enumerator: DeviceEnumerator,
    inputs: Vec<DeviceInfo>,
    outputs: Vec<DeviceInfo>,
    videos: Vec<DeviceInfo>,
    selected_input: Option<String>,
    selected_output: Option<String>,
    selected_video: Option<String>,
}

impl DeviceManager {
    pub fn new(audio: Arc<dyn AudioBackend>, share: Arc<dyn ShareBackend>) -> Self {
        Self {
            enumerator: DeviceEnumerator::new(audio, share),
            inputs: Vec::new(),
            outputs: Vec::new(),
            videos: Vec::new(),
            selected_input: None,
            selected_output: None,
            selected_video: None,
        }
    }

    pub fn with_selection(
        mut self,
        input: Option<String>,
        output: Option<String>,
        video: Option<String>,
    ) -> Self {
        self.selected_input = input;
        self.selected_output = output;
        self.selected_video = video;
        self
    }

    pub fn enumerator(&self) -> DeviceEnumerator {
        self.enumerator.clone()
    }

    /// Enumerates on the calling thread and applies the result.
    pub fn refresh(&mut self) -> Vec<DeviceChange> {
        let lists = self.enumerator.enumerate();
        self.apply(lists)
    }

    /// Replaces the known lists and returns what appeared or vanished.
    pub fn apply(&mut self, mut lists: DeviceLists) -> Vec<DeviceChange> {
        let mut changes = Vec::new();
        for kind in [DeviceKind::Input, DeviceKind::Output, DeviceKind::Video] {
            let Some(next) = lists.take(kind) else {
                continue;
            };
            let current = self.list_mut(kind);
            if let Some(change) = diff_devices(kind, current, &next) {
                changes.push(change);
            }
            *current = next;
        }
        changes
    }

    pub fn list(&self, kind: DeviceKind) -> &[DeviceInfo] {
        match kind {
            DeviceKind::Input => &self.inputs,
            DeviceKind::Output => &self.outputs,
            DeviceKind::Video => &self.videos,
        }
    }

    fn list_mut(&mut self, kind: DeviceKind) -> &mut Vec<DeviceInfo> {
        match kind {
            DeviceKind::Input => &mut self.inputs,
            DeviceKind::Output => &mut self.outputs,
            DeviceKind::Video => &mut self.videos,
        }
    }

    pub fn selected(&self, kind: DeviceKind) -> Option<&str> {
        match kind {
            DeviceKind::Input => self.selected_input.as_deref(),
            DeviceKind::Output => self.selected_output.as_deref(),
            DeviceKind::Video => self.selected_video.as_deref(),
        }
    }

    pub fn select(&mut self, selection: DeviceSelection) {
        let slot = match selection.kind {
            DeviceKind::Input => &mut self.selected_input,
            DeviceKind::Output => &mut self.selected_output,
            DeviceKind::Video => &mut self.selected_video,
        };
        *slot = selection.device_id;
    }

    /// True when a specific device is selected but no longer enumerated.
    /// The system default (`None`) is never considered missing.
    pub fn selection_missing(&self, kind: DeviceKind) -> bool {
        let Some(selected) = self.selected(kind) else {
            return false;
        };
        !self.list(kind).iter().any(|device| device.id == selected)
    }

    pub fn snapshot(&self) -> DevicesSnapshot {
        DevicesSnapshot {
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            videos: self.videos.clone(),
            selected_input: self.selected_input.clone(),
            selected_output: self.selected_output.clone(),
            selected_video: self.selected_video.clone(),
        }
    }
}

fn diff_devices(
    kind: DeviceKind,
    previous: &[DeviceInfo],
    next: &[DeviceInfo],
) -> Option<DeviceChange> {
    let added = next
        .iter()
        .filter(|device| !previous.iter().any(|old| old.id == device.id))
        .cloned()
        .collect::<Vec<_>>();
    let removed = previous
        .iter()
        .filter(|device| !next.iter().any(|new| new.id == device.id))
        .cloned()
        .collect::<Vec<_>>();

    if added.is_empty() && removed.is_empty() {
        return None;
    }
    Some(DeviceChange {
        kind,
        added,
        removed,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::core::config::CaptureProfile;
    use crate::core::error::DeviceError;
    use crate::core::voice::frame_queue::FrameProducer;
    use crate::core::voice::share::UnavailableShare;
    use crate::core::voice::{InputPipeline, OutputPipeline};

    struct ListingBackend {
        inputs: Mutex<Vec<&'static str>>,
    }

    impl AudioBackend for ListingBackend {
        fn list_devices(&self, kind: DeviceKind) -> Result<Vec<DeviceInfo>, DeviceError> {
            if kind != DeviceKind::Input {
                return Ok(Vec::new());
            }
            let inputs = self
                .inputs
                .lock()
                .map_err(|_| DeviceError::Backend("poisoned".to_string()))?;
            Ok(inputs
                .iter()
                .map(|name| DeviceInfo {
                    id: name.to_string(),
                    label: name.to_string(),
                    kind,
                    is_default: false,
                })
                .collect())
        }

        fn open_input(
            &self,
            _device_id: Option<&str>,
            _profile: CaptureProfile,
            _producer: FrameProducer,
        ) -> Result<Box<dyn InputPipeline>, DeviceError> {
            Err(DeviceError::NoneAvailable("input"))
        }

        fn open_output(
            &self,
            _device_id: Option<&str>,
        ) -> Result<Box<dyn OutputPipeline>, DeviceError> {
            Err(DeviceError::NoneAvailable("output"))
        }
    }

    fn manager(inputs: Vec<&'static str>) -> (Arc<ListingBackend>, DeviceManager) {
        let backend = Arc::new(ListingBackend {
            inputs: Mutex::new(inputs),
        });
        let manager = DeviceManager::new(backend.clone(), Arc::new(UnavailableShare));
        (backend, manager)
    }

    #[test]
    fn first_refresh_reports_everything_as_added() {
        let (_backend, mut manager) = manager(vec!["Built-in Mic", "USB Mic"]);
        let changes = manager.refresh();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, DeviceKind::Input);
        assert_eq!(changes[0].added.len(), 2);
        assert!(manager.refresh().is_empty());
    }

    #[test]
    fn hot_unplug_is_reported_and_selection_goes_missing() {
        let (backend, mut manager) = manager(vec!["Built-in Mic", "USB Mic"]);
        manager.refresh();
        manager.select(DeviceSelection::new(
            DeviceKind::Input,
            Some("USB Mic".to_string()),
        ));
        assert!(!manager.selection_missing(DeviceKind::Input));

        backend
            .inputs
            .lock()
            .expect("lock")
            .retain(|name| *name != "USB Mic");
        let changes = manager.refresh();
        assert_eq!(changes[0].removed[0].id, "USB Mic");
        assert!(manager.selection_missing(DeviceKind::Input));
    }

    #[test]
    fn failed_listing_keeps_the_previous_devices() {
        let (_backend, mut manager) = manager(vec!["Built-in Mic"]);
        manager.refresh();
        let changes = manager.apply(DeviceLists {
            inputs: None,
            outputs: Some(Vec::new()),
            videos: Some(Vec::new()),
        });
        assert!(changes.is_empty());
        assert_eq!(manager.list(DeviceKind::Input).len(), 1);
    }

    #[test]
    fn enumerator_lists_off_the_manager() {
        let (backend, manager) = manager(vec!["Built-in Mic"]);
        let enumerator = manager.enumerator();
        backend.inputs.lock().expect("lock").push("USB Mic");
        let lists = std::thread::spawn(move || enumerator.enumerate())
            .join()
            .expect("enumeration thread");
        assert_eq!(lists.inputs.map(|inputs| inputs.len()), Some(2));
    }

    #[test]
    fn default_selection_is_never_missing() {
        let (_backend, mut manager) = manager(Vec::new());
        manager.refresh();
        assert!(!manager.selection_missing(DeviceKind::Input));
        assert_eq!(manager.snapshot().selected_input, None);
    }
}
