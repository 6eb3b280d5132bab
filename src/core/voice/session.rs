use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};

use super::devices::{DeviceLists, DeviceManager};
use super::frame_queue::{frame_channel, FrameConsumer, FrameProducer};
use super::registry::ParticipantRegistry;
use super::share::ShareBackend;
use super::transport::{
    AudioSource, ControlEvent, JoinRequest, OutboundFrame, Transport, TransportEvent,
};
use super::{AudioBackend, InputPipeline, OutputPipeline};
use crate::core::config::{CaptureProfile, ConfigError, VoiceConfig};
use crate::core::error::{ConnectionError, DeviceError, ErrorStatus, StreamError, VoiceError};
use crate::core::events::{
    state_channel, CaptureStatus, ConnectionState, DeviceKind, DeviceSelection, MediaFlags,
    SessionSnapshot, StateObserver, StatePublisher, VoiceEvent,
};

const MEDIA_TICK_MS: u64 = 20;
const SPEAKING_TICK_MS: u64 = 180;

/// Handle to the session worker.
///
/// Every operation is fire-and-forget: it queues a command and returns. The
/// outcome shows up on the [`StateObserver`] snapshots and events.
pub struct VoiceSession {
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    observer: StateObserver,
    worker: Option<JoinHandle<()>>,
}

impl VoiceSession {
    /// Spawns the worker on the current tokio runtime. The configuration is
    /// validated first; intervals and timeouts must be non-zero.
    pub fn spawn(
        config: VoiceConfig,
        transport: Arc<dyn Transport>,
        audio: Arc<dyn AudioBackend>,
        share: Arc<dyn ShareBackend>,
        transport_events: mpsc::Receiver<TransportEvent>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (publisher, observer) = state_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let worker = SessionWorker::new(config, transport, audio, share, publisher);
        let handle = tokio::spawn(run_session_worker(worker, command_rx, transport_events));

        Ok(Self {
            command_tx,
            observer,
            worker: Some(handle),
        })
    }

    pub fn observer(&self) -> StateObserver {
        self.observer.clone()
    }

    pub fn join_channel(&self, channel_id: impl Into<String>, guild_id: impl Into<String>) {
        self.send_command(SessionCommand::Join {
            channel_id: channel_id.into(),
            guild_id: guild_id.into(),
        });
    }

    pub fn leave_channel(&self) {
        self.send_command(SessionCommand::Leave);
    }

    pub fn toggle_mute(&self) {
        self.send_command(SessionCommand::ToggleMute);
    }

    pub fn toggle_deaf(&self) {
        self.send_command(SessionCommand::ToggleDeaf);
    }

    pub fn start_stream(&self) {
        self.send_command(SessionCommand::StartStream);
    }

    pub fn stop_stream(&self) {
        self.send_command(SessionCommand::StopStream);
    }

    pub fn toggle_video(&self) {
        self.send_command(SessionCommand::ToggleVideo);
    }

    pub fn apply_audio_input_device(&self, device_id: Option<String>) {
        self.send_command(SessionCommand::SetInputDevice(device_id));
    }

    pub fn apply_audio_output_device(&self, device_id: Option<String>) {
        self.send_command(SessionCommand::SetOutputDevice(device_id));
    }

    pub fn apply_video_device(&self, device_id: Option<String>) {
        self.send_command(SessionCommand::SetVideoDevice(device_id));
    }

    pub fn reapply_audio_constraints(&self, profile: CaptureProfile) {
        self.send_command(SessionCommand::ReapplyConstraints(profile));
    }

    pub fn refresh_devices(&self) {
        self.send_command(SessionCommand::RefreshDevices);
    }

    /// Leaves any channel and waits for the worker to exit.
    pub async fn shutdown(mut self) {
        self.send_command(SessionCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.await {
                log::warn!("voice session worker ended abnormally: {err}");
            }
        }
    }

    fn send_command(&self, command: SessionCommand) {
        if self.command_tx.send(command).is_err() {
            log::debug!("voice session worker is not running");
        }
    }
}

#[derive(Debug)]
enum SessionCommand {
    Join { channel_id: String, guild_id: String },
    Leave,
    ToggleMute,
    ToggleDeaf,
    StartStream,
    StopStream,
    ToggleVideo,
    SetInputDevice(Option<String>),
    SetOutputDevice(Option<String>),
    SetVideoDevice(Option<String>),
    ReapplyConstraints(CaptureProfile),
    RefreshDevices,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChannelTarget {
    channel_id: String,
    guild_id: String,
}

struct PendingConnect {
    target: ChannelTarget,
    attempt: BoxFuture<'static, Result<(), ConnectionError>>,
}

struct ActiveInput {
    pipeline: Box<dyn InputPipeline>,
    frames: FrameConsumer,
}

/// Selection stored once an open succeeds. `None` leaves the selection alone.
type SelectionCommit = Option<Option<String>>;

/// A freshly opened input that must deliver a frame before it replaces the
/// active one.
struct InputCandidate {
    input: ActiveInput,
    profile: CaptureProfile,
    commit: SelectionCommit,
    deadline: Instant,
}

/// A device operation finished on the blocking pool. `request` is compared
/// against the worker's latest request so superseded opens are dropped.
enum MediaOutcome {
    Input {
        request: u64,
        profile: CaptureProfile,
        commit: SelectionCommit,
        result: Result<ActiveInput, DeviceError>,
    },
    Output {
        request: u64,
        commit: SelectionCommit,
        result: Result<Box<dyn OutputPipeline>, DeviceError>,
    },
    SystemAudio {
        request: u64,
        result: Result<ActiveInput, DeviceError>,
    },
    Devices(DeviceLists),
}

#[derive(Debug, Clone, Copy, Default)]
struct SelfFlags {
    mute: bool,
    deaf: bool,
    video: bool,
    stream: bool,
}

impl SelfFlags {
    fn effective_mute(self) -> bool {
        self.deaf || self.mute
    }

    fn media_flags(self) -> MediaFlags {
        MediaFlags {
            muted: self.mute,
            deafened: self.deaf,
            video: self.video,
            stream: self.stream,
        }
    }
}

struct SessionWorker {
    config: VoiceConfig,
    transport: Arc<dyn Transport>,
    audio: Arc<dyn AudioBackend>,
    share: Arc<dyn ShareBackend>,
    publisher: StatePublisher,
    devices: DeviceManager,
    registry: ParticipantRegistry,
    state: ConnectionState,
    channel: Option<ChannelTarget>,
    pending: Option<PendingConnect>,
    flags: SelfFlags,
    capture_profile: CaptureProfile,
    capture: CaptureStatus,
    input: Option<ActiveInput>,
    input_candidate: Option<InputCandidate>,
    output: Option<Box<dyn OutputPipeline>>,
    system_audio: Option<ActiveInput>,
    media_ops: FuturesUnordered<BoxFuture<'static, MediaOutcome>>,
    input_request: u64,
    output_request: u64,
    system_request: u64,
    enumerating: bool,
    enumerate_again: bool,
    last_error: Option<ErrorStatus>,
    outbound_sequence: u64,
    system_sequence: u64,
}

async fn run_session_worker(
    mut worker: SessionWorker,
    mut command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    mut transport_rx: mpsc::Receiver<TransportEvent>,
) {
    let mut media_tick = interval(Duration::from_millis(MEDIA_TICK_MS));
    media_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut speaking_tick = interval(Duration::from_millis(SPEAKING_TICK_MS));
    speaking_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut device_tick = interval(worker.config.device_poll_interval());
    device_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut transport_open = true;

    worker.publish_session();

    loop {
        tokio::select! {
            maybe_cmd = command_rx.recv() => {
                match maybe_cmd {
                    None | Some(SessionCommand::Shutdown) => break,
                    Some(command) => worker.handle_command(command).await,
                }
            }
            result = wait_for_connect(&mut worker.pending), if worker.pending.is_some() => {
                worker.finish_connect(result).await;
            }
            Some(outcome) = worker.media_ops.next(), if !worker.media_ops.is_empty() => {
                worker.finish_media(outcome);
            }
            event = transport_rx.recv(), if transport_open => {
                match event {
                    Some(event) => worker.handle_transport_event(event),
                    None => {
                        log::debug!("transport event channel closed");
                        transport_open = false;
                    }
                }
            }
            _ = media_tick.tick() => worker.pump_media(),
            _ = speaking_tick.tick() => worker.expire_speaking(),
            _ = device_tick.tick() => worker.poll_devices(),
        }
    }

    worker.leave().await;
    log::info!("voice session worker stopped");
}

async fn disconnect_with_timeout(
    transport: Arc<dyn Transport>,
    channel_id: String,
    limit: Duration,
) -> Result<(), ConnectionError> {
    match timeout(limit, transport.disconnect(&channel_id)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::LeaveTimeout(channel_id)),
    }
}

async fn wait_for_connect(pending: &mut Option<PendingConnect>) -> Result<(), ConnectionError> {
    match pending {
        Some(pending) => (&mut pending.attempt).await,
        None => std::future::pending().await,
    }
}

/// Device opens and enumeration may block for hundreds of milliseconds, so
/// they run on the blocking pool while the worker keeps pumping frames.
async fn run_blocking<T, F>(op: F) -> Result<T, DeviceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DeviceError> + Send + 'static,
{
    match tokio::task::spawn_blocking(op).await {
        Ok(result) => result,
        Err(err) => Err(DeviceError::Backend(format!("audio task failed: {err}"))),
    }
}

#[derive(Debug, Clone, Copy)]
struct QueueSizes {
    frames: usize,
    levels: usize,
}

impl QueueSizes {
    fn channel(self) -> (FrameProducer, FrameConsumer) {
        frame_channel(self.frames, self.levels)
    }
}

fn open_input(
    audio: &dyn AudioBackend,
    device_id: Option<&str>,
    profile: CaptureProfile,
    sizes: QueueSizes,
) -> Result<ActiveInput, DeviceError> {
    let (producer, frames) = sizes.channel();
    let pipeline = audio.open_input(device_id, profile, producer)?;
    Ok(ActiveInput { pipeline, frames })
}

impl SessionWorker {
    fn new(
        config: VoiceConfig,
        transport: Arc<dyn Transport>,
        audio: Arc<dyn AudioBackend>,
        share: Arc<dyn ShareBackend>,
        publisher: StatePublisher,
    ) -> Self {
        let devices = DeviceManager::new(Arc::clone(&audio), Arc::clone(&share)).with_selection(
            config.input_device.clone(),
            config.output_device.clone(),
            config.video_device.clone(),
        );
        let registry = ParticipantRegistry::new(config.speaking, config.participant_timeout());

        Self {
            capture_profile: config.capture,
            config,
            transport,
            audio,
            share,
            publisher,
            devices,
            registry,
            state: ConnectionState::Idle,
            channel: None,
            pending: None,
            flags: SelfFlags::default(),
            capture: CaptureStatus::Inactive,
            input: None,
            input_candidate: None,
            output: None,
            system_audio: None,
            media_ops: FuturesUnordered::new(),
            input_request: 0,
            output_request: 0,
            system_request: 0,
            enumerating: false,
            enumerate_again: false,
            last_error: None,
            outbound_sequence: 0,
            system_sequence: 0,
        }
    }

    fn queue_sizes(&self) -> QueueSizes {
        QueueSizes {
            frames: self.config.frame_queue_frames,
            levels: self.config.level_queue_frames,
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Join {
                channel_id,
                guild_id,
            } => {
                self.join(ChannelTarget {
                    channel_id,
                    guild_id,
                })
                .await
            }
            SessionCommand::Leave => self.leave().await,
            SessionCommand::ToggleMute => self.toggle_mute(),
            SessionCommand::ToggleDeaf => self.toggle_deaf(),
            SessionCommand::StartStream => self.start_stream(),
            SessionCommand::StopStream => self.stop_stream(),
            SessionCommand::ToggleVideo => self.toggle_video(),
            SessionCommand::SetInputDevice(device_id) => self.apply_input_device(device_id),
            SessionCommand::SetOutputDevice(device_id) => self.apply_output_device(device_id),
            SessionCommand::SetVideoDevice(device_id) => {
                self.devices
                    .select(DeviceSelection::new(DeviceKind::Video, device_id));
                self.publish_devices();
            }
            SessionCommand::ReapplyConstraints(profile) => self.reapply_constraints(profile),
            SessionCommand::RefreshDevices => self.poll_devices(),
            SessionCommand::Shutdown => {}
        }
    }

    async fn join(&mut self, target: ChannelTarget) {
        let busy = matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        );
        if busy && self.channel.as_ref() == Some(&target) {
            log::debug!("already in voice channel {}", target.channel_id);
            return;
        }
        if busy {
            self.leave().await;
        }
        self.begin_connect(target);
    }

    fn begin_connect(&mut self, target: ChannelTarget) {
        let request = JoinRequest {
            channel_id: target.channel_id.clone(),
            guild_id: target.guild_id.clone(),
            user_id: self.config.user_id.clone(),
            self_mute: self.flags.mute,
            self_deaf: self.flags.deaf,
        };
        let transport = Arc::clone(&self.transport);
        let join_timeout = self.config.join_timeout();
        let attempt: BoxFuture<'static, Result<(), ConnectionError>> = Box::pin(async move {
            match timeout(join_timeout, transport.connect(&request)).await {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::Timeout(request.channel_id.clone())),
            }
        });

        log::info!(
            "joining voice channel {} in guild {}",
            target.channel_id,
            target.guild_id
        );
        self.state = ConnectionState::Connecting;
        self.channel = Some(target.clone());
        self.pending = Some(PendingConnect { target, attempt });
        self.last_error = None;
        self.publish_session();
        self.publish_roster();
    }

    async fn finish_connect(&mut self, result: Result<(), ConnectionError>) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let channel_id = pending.target.channel_id;

        match result {
            Ok(()) => {
                log::info!("joined voice channel {channel_id}");
                self.state = ConnectionState::Connected;
                self.registry.join(
                    &channel_id,
                    &self.config.user_id,
                    self.flags.media_flags(),
                    true,
                );
                self.start_media();
                self.publish_session();
                self.publish_roster();
            }
            Err(err) => {
                log::warn!("failed to join voice channel {channel_id}: {err}");
                if matches!(err, ConnectionError::Timeout(_)) {
                    // The server may still finish the join after we gave up.
                    let cleanup = self.disconnect_transport(channel_id.clone());
                    if let Err(cleanup_err) = cleanup.await {
                        log::debug!("cleanup after join timeout failed: {cleanup_err}");
                    }
                }
                self.state = ConnectionState::Idle;
                self.channel = None;
                self.registry.clear();
                self.report_error(err.into());
                self.publish_roster();
            }
        }
    }

    /// Tears down media and returns to Idle. Also cancels an in-flight join.
    async fn leave(&mut self) {
        if self.state == ConnectionState::Idle {
            return;
        }
        if self.pending.take().is_some() {
            log::info!("cancelled pending voice join");
        }
        self.state = ConnectionState::Leaving;
        self.publish_session();
        self.stop_media();

        let disconnect = self
            .channel
            .as_ref()
            .map(|channel| self.disconnect_transport(channel.channel_id.clone()));
        let leave_error = match disconnect {
            Some(disconnect) => disconnect.await.err(),
            None => None,
        };

        if let Some(channel) = self.channel.take() {
            log::info!("left voice channel {}", channel.channel_id);
        }
        self.registry.clear();
        self.state = ConnectionState::Idle;
        match leave_error {
            Some(err) => {
                log::warn!("voice leave did not complete cleanly: {err}");
                self.report_error(err.into());
            }
            None => self.publish_session(),
        }
        self.publish_roster();
    }

    fn disconnect_transport(
        &self,
        channel_id: String,
    ) -> impl std::future::Future<Output = Result<(), ConnectionError>> + Send + 'static {
        disconnect_with_timeout(
            Arc::clone(&self.transport),
            channel_id,
            self.config.leave_timeout(),
        )
    }

    fn toggle_mute(&mut self) {
        self.flags.mute = !self.flags.mute;
        log::info!("self mute set to {}", self.flags.mute);
        self.send_control(ControlEvent::Mute(self.flags.mute));
        self.sync_local_flags();
    }

    fn toggle_deaf(&mut self) {
        self.flags.deaf = !self.flags.deaf;
        log::info!("self deafen set to {}", self.flags.deaf);
        self.send_control(ControlEvent::Deafen(self.flags.deaf));
        self.sync_local_flags();
    }

    fn start_stream(&mut self) {
        if self.flags.stream {
            return;
        }
        if self.state != ConnectionState::Connected {
            self.report_error(StreamError::NotConnected.into());
            return;
        }
        match self.share.start_stream() {
            Ok(()) => {
                log::info!("screen share started");
                self.flags.stream = true;
                self.send_control(ControlEvent::StreamStart);
                self.sync_local_flags();
                self.request_system_audio();
            }
            Err(err) => {
                log::warn!("screen share failed: {err}");
                self.report_error(err.into());
            }
        }
    }

    fn stop_stream(&mut self) {
        if !self.flags.stream {
            return;
        }
        self.share.stop_stream();
        self.drop_system_audio();
        self.flags.stream = false;
        log::info!("screen share stopped");
        self.send_control(ControlEvent::StreamStop);
        self.sync_local_flags();
    }

    fn toggle_video(&mut self) {
        if self.flags.video {
            self.share.stop_camera();
            self.flags.video = false;
            self.send_control(ControlEvent::VideoToggle(false));
            self.sync_local_flags();
            return;
        }
        if self.state != ConnectionState::Connected {
            self.report_error(StreamError::NotConnected.into());
            return;
        }
        match self
            .share
            .start_camera(self.devices.selected(DeviceKind::Video))
        {
            Ok(()) => {
                self.flags.video = true;
                self.send_control(ControlEvent::VideoToggle(true));
                self.sync_local_flags();
            }
            Err(err) => {
                log::warn!("camera failed to start: {err}");
                self.report_error(err.into());
            }
        }
    }

    fn send_control(&self, event: ControlEvent) {
        if self.state == ConnectionState::Connected {
            self.transport.send_control(event);
        }
    }

    fn sync_local_flags(&mut self) {
        if self
            .registry
            .apply_flags(&self.config.user_id, self.flags.media_flags())
        {
            self.publish_roster();
        }
        self.publish_session();
    }

    fn start_media(&mut self) {
        let input = self
            .devices
            .selected(DeviceKind::Input)
            .map(str::to_string);
        self.request_input(input, self.capture_profile, None, true);

        let output = self
            .devices
            .selected(DeviceKind::Output)
            .map(str::to_string);
        self.request_output(output, None);
    }

    fn stop_media(&mut self) {
        // Opens still in flight are discarded when they land.
        self.input_request += 1;
        self.output_request += 1;
        self.input_candidate = None;
        self.input = None;
        self.output = None;
        self.capture = CaptureStatus::Inactive;
        if self.flags.stream {
            self.share.stop_stream();
            self.flags.stream = false;
        }
        self.drop_system_audio();
        if self.flags.video {
            self.share.stop_camera();
            self.flags.video = false;
        }
    }

    /// Opens an input off the worker. The result lands in
    /// [`Self::finish_input`]; a newer request supersedes this one.
    fn request_input(
        &mut self,
        device_id: Option<String>,
        profile: CaptureProfile,
        commit: SelectionCommit,
        fall_back_to_default: bool,
    ) {
        self.input_request += 1;
        self.input_candidate = None;
        let request = self.input_request;
        let audio = Arc::clone(&self.audio);
        let sizes = self.queue_sizes();

        self.media_ops.push(Box::pin(async move {
            let result = run_blocking(move || {
                match open_input(audio.as_ref(), device_id.as_deref(), profile, sizes) {
                    Err(err) if fall_back_to_default && device_id.is_some() => {
                        log::warn!("selected input unavailable ({err}), trying system default");
                        open_input(audio.as_ref(), None, profile, sizes)
                    }
                    other => other,
                }
            })
            .await;
            MediaOutcome::Input {
                request,
                profile,
                commit,
                result,
            }
        }));
    }

    fn request_output(&mut self, device_id: Option<String>, commit: SelectionCommit) {
        self.output_request += 1;
        let request = self.output_request;
        let audio = Arc::clone(&self.audio);

        self.media_ops.push(Box::pin(async move {
            let result = run_blocking(move || audio.open_output(device_id.as_deref())).await;
            MediaOutcome::Output {
                request,
                commit,
                result,
            }
        }));
    }

    fn request_system_audio(&mut self) {
        self.system_request += 1;
        let request = self.system_request;
        let audio = Arc::clone(&self.audio);
        let sizes = self.queue_sizes();

        self.media_ops.push(Box::pin(async move {
            let result = run_blocking(move || {
                let (producer, frames) = sizes.channel();
                let pipeline = audio.open_system_audio(producer)?;
                Ok(ActiveInput { pipeline, frames })
            })
            .await;
            MediaOutcome::SystemAudio { request, result }
        }));
    }

    fn drop_system_audio(&mut self) {
        self.system_request += 1;
        if self.system_audio.take().is_some() {
            log::info!("system audio capture stopped");
        }
    }

    fn finish_media(&mut self, outcome: MediaOutcome) {
        match outcome {
            MediaOutcome::Input {
                request,
                profile,
                commit,
                result,
            } => {
                if request != self.input_request {
                    log::debug!("discarding superseded input open");
                    return;
                }
                self.finish_input(profile, commit, result);
            }
            MediaOutcome::Output {
                request,
                commit,
                result,
            } => {
                if request != self.output_request {
                    log::debug!("discarding superseded output open");
                    return;
                }
                self.finish_output(commit, result);
            }
            MediaOutcome::SystemAudio { request, result } => {
                if request != self.system_request || !self.flags.stream {
                    log::debug!("discarding superseded system audio open");
                    return;
                }
                match result {
                    Ok(capture) => {
                        log::info!(
                            "system audio capture started on \"{}\"",
                            capture.pipeline.device_name()
                        );
                        self.system_audio = Some(capture);
                    }
                    Err(err) => {
                        log::warn!("sharing without system audio: {err}");
                        self.report_error(err.into());
                    }
                }
            }
            MediaOutcome::Devices(lists) => self.finish_enumeration(lists),
        }
    }

    fn finish_input(
        &mut self,
        profile: CaptureProfile,
        commit: SelectionCommit,
        result: Result<ActiveInput, DeviceError>,
    ) {
        match result {
            Ok(input) if self.input.is_none() => self.promote_input(input, profile, commit),
            Ok(input) => {
                // The running input is only replaced once the candidate
                // delivers audio; see `check_input_candidate`.
                log::info!(
                    "validating input candidate \"{}\"",
                    input.pipeline.device_name()
                );
                self.input_candidate = Some(InputCandidate {
                    input,
                    profile,
                    commit,
                    deadline: Instant::now() + self.config.swap_timeout(),
                });
            }
            Err(err) if self.input.is_none() => {
                log::warn!("continuing without audio: {err}");
                self.capture = CaptureStatus::NoAudio;
                self.silence_local_speaker();
                self.report_error(err.into());
            }
            Err(err) => {
                log::warn!("input swap failed, keeping current device: {err}");
                self.report_error(err.into());
            }
        }
    }

    fn promote_input(
        &mut self,
        input: ActiveInput,
        profile: CaptureProfile,
        commit: SelectionCommit,
    ) {
        self.capture = CaptureStatus::Live {
            device: input.pipeline.device_name().to_string(),
        };
        self.capture_profile = profile;
        // The previous pipeline, if any, stops when dropped here.
        self.input = Some(input);
        if let Some(device_id) = commit {
            self.devices
                .select(DeviceSelection::new(DeviceKind::Input, device_id));
            self.publish_devices();
        }
        self.publish_session();
    }

    fn apply_input_device(&mut self, device_id: Option<String>) {
        if self.state != ConnectionState::Connected {
            self.devices
                .select(DeviceSelection::new(DeviceKind::Input, device_id));
            self.publish_devices();
            return;
        }
        self.request_input(
            device_id.clone(),
            self.capture_profile,
            Some(device_id),
            false,
        );
    }

    fn reapply_constraints(&mut self, profile: CaptureProfile) {
        if self.state != ConnectionState::Connected {
            self.capture_profile = profile;
            return;
        }
        let selected = self
            .devices
            .selected(DeviceKind::Input)
            .map(str::to_string);
        self.request_input(selected, profile, None, false);
    }

    fn check_input_candidate(&mut self) {
        let Some(candidate) = self.input_candidate.as_ref() else {
            return;
        };

        if candidate.input.frames.has_produced() {
            let Some(candidate) = self.input_candidate.take() else {
                return;
            };
            // Flush what the old device captured, then drop the overlap the
            // candidate recorded while the old device was still live.
            self.forward_captured_frames();
            while candidate.input.frames.pop_frame().is_some() {}
            candidate.input.frames.drain_levels(|_| {});

            log::info!(
                "input swap committed: \"{}\"",
                candidate.input.pipeline.device_name()
            );
            self.promote_input(candidate.input, candidate.profile, candidate.commit);
            return;
        }

        if Instant::now() >= candidate.deadline {
            let device = candidate.input.pipeline.device_name().to_string();
            self.input_candidate = None;
            log::warn!("input candidate \"{device}\" produced no audio, keeping current device");
            self.report_error(DeviceError::NotLive(device).into());
        }
    }

    fn apply_output_device(&mut self, device_id: Option<String>) {
        if self.state != ConnectionState::Connected {
            self.devices
                .select(DeviceSelection::new(DeviceKind::Output, device_id));
            self.publish_devices();
            return;
        }
        self.request_output(device_id.clone(), Some(device_id));
    }

    /// An output is confirmed by opening; the old one is released only after
    /// that succeeds.
    fn finish_output(
        &mut self,
        commit: SelectionCommit,
        result: Result<Box<dyn OutputPipeline>, DeviceError>,
    ) {
        match result {
            Ok(output) => {
                log::info!("output device set to \"{}\"", output.device_name());
                self.output = Some(output);
                if let Some(device_id) = commit {
                    self.devices
                        .select(DeviceSelection::new(DeviceKind::Output, device_id));
                    self.publish_devices();
                }
                self.publish_session();
            }
            Err(err) => {
                log::warn!("output swap failed, keeping current device: {err}");
                self.report_error(err.into());
            }
        }
    }

    fn check_pipeline_health(&mut self) {
        if self
            .input
            .as_ref()
            .is_some_and(|input| input.pipeline.has_failed())
        {
            if let Some(failed) = self.input.take() {
                let device = failed.pipeline.device_name().to_string();
                log::warn!("input device \"{device}\" failed, falling back to system default");
                self.capture = CaptureStatus::NoAudio;
                self.silence_local_speaker();
                self.report_error(DeviceError::Removed(device).into());
                self.devices
                    .select(DeviceSelection::system_default(DeviceKind::Input));
                self.publish_devices();
                self.request_input(None, self.capture_profile, None, false);
            }
        }

        if self
            .output
            .as_ref()
            .is_some_and(|output| output.has_failed())
        {
            if let Some(failed) = self.output.take() {
                let device = failed.device_name().to_string();
                log::warn!("output device \"{device}\" failed, falling back to system default");
                self.report_error(DeviceError::Removed(device).into());
                self.devices
                    .select(DeviceSelection::system_default(DeviceKind::Output));
                self.publish_devices();
                self.publish_session();
                self.request_output(None, None);
            }
        }

        if self
            .system_audio
            .as_ref()
            .is_some_and(|capture| capture.pipeline.has_failed())
        {
            if let Some(failed) = self.system_audio.take() {
                let device = failed.pipeline.device_name().to_string();
                log::warn!("system audio source \"{device}\" failed, sharing continues without it");
                self.report_error(DeviceError::Removed(device).into());
            }
        }
    }

    /// Local levels stop when capture is lost; without this the local
    /// participant would stay speaking until the next frame arrives.
    fn silence_local_speaker(&mut self) {
        if let Some(event) = self.registry.force_silent(&self.config.user_id) {
            self.publisher.emit_speaking(event);
            self.publish_roster();
        }
    }

    /// Starts an enumeration on the blocking pool. A request made while one
    /// is running queues exactly one follow-up pass.
    fn poll_devices(&mut self) {
        if self.enumerating {
            self.enumerate_again = true;
            return;
        }
        self.enumerating = true;
        let enumerator = self.devices.enumerator();
        self.media_ops.push(Box::pin(async move {
            let lists = run_blocking(move || Ok(enumerator.enumerate()))
                .await
                .unwrap_or_else(|err| {
                    log::warn!("device enumeration failed: {err}");
                    DeviceLists::default()
                });
            MediaOutcome::Devices(lists)
        }));
    }

    fn finish_enumeration(&mut self, lists: DeviceLists) {
        self.enumerating = false;
        for change in self.devices.apply(lists) {
            log::info!(
                "{} devices changed: {} added, {} removed",
                change.kind.label(),
                change.added.len(),
                change.removed.len()
            );
            self.publisher.emit(VoiceEvent::DevicesChanged(change));
        }
        self.publish_devices();

        if self.state == ConnectionState::Connected {
            self.recover_missing_selection();
        }
        if std::mem::take(&mut self.enumerate_again) {
            self.poll_devices();
        }
    }

    /// Falls back to the system default when the selected device vanished.
    /// The old pipeline keeps running until the default proves live.
    fn recover_missing_selection(&mut self) {
        if self.devices.selection_missing(DeviceKind::Input) {
            let device = self
                .devices
                .selected(DeviceKind::Input)
                .unwrap_or_default()
                .to_string();
            log::warn!("selected input \"{device}\" was removed, switching to system default");
            self.report_error(DeviceError::Removed(device).into());
            self.devices
                .select(DeviceSelection::system_default(DeviceKind::Input));
            self.publish_devices();
            self.request_input(None, self.capture_profile, None, false);
        }
        if self.devices.selection_missing(DeviceKind::Output) {
            let device = self
                .devices
                .selected(DeviceKind::Output)
                .unwrap_or_default()
                .to_string();
            log::warn!("selected output \"{device}\" was removed, switching to system default");
            self.report_error(DeviceError::Removed(device).into());
            self.devices
                .select(DeviceSelection::system_default(DeviceKind::Output));
            self.publish_devices();
            self.request_output(None, None);
        }
    }

    fn pump_media(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        self.check_input_candidate();
        self.check_pipeline_health();
        self.forward_captured_frames();
        self.forward_system_audio();
    }

    /// Sends queued frames (unless muted or deafened) and feeds the local
    /// speaking detector from the level queue.
    fn forward_captured_frames(&mut self) {
        let Some(input) = self.input.as_ref() else {
            return;
        };

        let transmit = !self.flags.effective_mute();
        while let Some(frame) = input.frames.pop_frame() {
            if !transmit {
                continue;
            }
            self.transport.send_frame(&OutboundFrame {
                source: AudioSource::Microphone,
                sequence: self.outbound_sequence,
                pcm: &frame.samples,
                level: frame.level,
            });
            self.outbound_sequence = self.outbound_sequence.wrapping_add(1);
        }

        let now = Instant::now();
        let registry = &mut self.registry;
        let user_id = self.config.user_id.as_str();
        let mut transitions = Vec::new();
        input.frames.drain_levels(|report| {
            match registry.report_level(user_id, report.level, now) {
                Ok(Some(event)) => transitions.push(event),
                Ok(None) => {}
                Err(err) => log::debug!("dropping local level: {err}"),
            }
        });

        if transitions.is_empty() {
            return;
        }
        for event in transitions {
            self.publisher.emit_speaking(event);
        }
        self.publish_roster();
    }

    /// Shared system audio is not the microphone, so self-mute does not gate
    /// it, and its levels do not drive the local speaking indicator.
    fn forward_system_audio(&mut self) {
        let Some(capture) = self.system_audio.as_ref() else {
            return;
        };
        while let Some(frame) = capture.frames.pop_frame() {
            self.transport.send_frame(&OutboundFrame {
                source: AudioSource::SystemAudio,
                sequence: self.system_sequence,
                pcm: &frame.samples,
                level: frame.level,
            });
            self.system_sequence = self.system_sequence.wrapping_add(1);
        }
        capture.frames.drain_levels(|_| {});
    }

    fn expire_speaking(&mut self) {
        let outcome = self.registry.expire(Instant::now());
        if outcome.is_empty() {
            return;
        }
        for user_id in &outcome.removed {
            log::debug!("participant {user_id} timed out");
        }
        for event in outcome.speaking {
            self.publisher.emit_speaking(event);
        }
        self.publish_roster();
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            log::debug!("ignoring transport event while {:?}", self.state);
            return;
        }

        match event {
            TransportEvent::ParticipantJoined {
                channel_id,
                user_id,
                flags,
            } => {
                if user_id == self.config.user_id {
                    return;
                }
                self.registry.join(&channel_id, &user_id, flags, false);
                self.publish_roster();
            }
            TransportEvent::ParticipantLeft { user_id } => {
                if self.registry.leave(&user_id) {
                    self.publish_roster();
                }
            }
            TransportEvent::LevelReport { user_id, level } => {
                match self.registry.report_level(&user_id, level, Instant::now()) {
                    Ok(Some(event)) => {
                        self.publisher.emit_speaking(event);
                        self.publish_roster();
                    }
                    Ok(None) => {}
                    Err(err) => log::debug!("ignoring level report: {err}"),
                }
            }
            TransportEvent::FlagsChanged { user_id, flags } => {
                if self.registry.apply_flags(&user_id, flags) {
                    self.publish_roster();
                }
            }
            TransportEvent::RemoteAudio { user_id, samples } => {
                if self.flags.deaf {
                    return;
                }
                match self.output.as_mut() {
                    Some(output) => output.play(&samples),
                    None => log::debug!("no output device for audio from {user_id}"),
                }
            }
        }
    }

    fn report_error(&mut self, err: VoiceError) {
        let status = err.status();
        self.publisher.emit_error(status.clone());
        self.last_error = Some(status);
        self.publish_session();
    }

    fn session_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            channel_id: self
                .channel
                .as_ref()
                .map(|channel| channel.channel_id.clone()),
            guild_id: self.channel.as_ref().map(|channel| channel.guild_id.clone()),
            self_mute: self.flags.mute,
            self_deaf: self.flags.deaf,
            self_video: self.flags.video,
            self_stream: self.flags.stream,
            effective_mute: self.flags.effective_mute(),
            capture: self.capture.clone(),
            output_device: self
                .output
                .as_ref()
                .map(|output| output.device_name().to_string()),
            last_error: self.last_error.clone(),
        }
    }

    fn publish_session(&self) {
        self.publisher.publish_session(self.session_snapshot());
    }

    fn publish_roster(&self) {
        let channel_id = self
            .channel
            .as_ref()
            .map(|channel| channel.channel_id.as_str());
        self.publisher.publish_roster(self.registry.snapshot(channel_id));
    }

    fn publish_devices(&self) {
        self.publisher.publish_devices(self.devices.snapshot());
    }
}
