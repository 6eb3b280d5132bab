use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, StreamConfig, SupportedStreamConfig};

use super::aggregator::AudioFrameAggregator;
use super::frame_queue::FrameProducer;
use super::processing::{CaptureProcessor, FarEndMeter};
use super::{map_build_error, InputPipeline, StreamThread};
use crate::core::config::CaptureProfile;
use crate::core::error::DeviceError;
use crate::core::events::{DeviceInfo, DeviceKind};

pub struct InputCapture {
    device_name: String,
    failed: Arc<AtomicBool>,
    _thread: StreamThread,
}

impl InputPipeline for InputCapture {
    fn device_name(&self) -> &str {
        &self.device_name
    }

    fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }
}

pub fn list_input_devices() -> Result<Vec<DeviceInfo>, DeviceError> {
    let host = cpal::default_host();
    let default_name = host
        .default_input_device()
        .and_then(|device| device.name().ok());

    let devices = host
        .input_devices()
        .map_err(|err| DeviceError::Backend(format!("failed to enumerate input devices: {err}")))?;

    Ok(devices
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
            DeviceInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                id: name.clone(),
                label: name,
                kind: DeviceKind::Input,
            }
        })
        .collect())
}

/// Opens capture and starts feeding processed 20 ms frames into `producer`.
pub fn start_input_capture(
    selected_device_id: Option<&str>,
    profile: CaptureProfile,
    far_end: FarEndMeter,
    producer: FrameProducer,
) -> Result<InputCapture, DeviceError> {
    let selected_device_id = selected_device_id.map(str::to_string);
    let failed = Arc::new(AtomicBool::new(false));
    let stream_failed = Arc::clone(&failed);

    let (thread, device_name) = StreamThread::spawn("harmony-capture", move || {
        let host = cpal::default_host();
        let device = resolve_input_device(&host, selected_device_id.as_deref())?;
        let supported = device.default_input_config().map_err(|err| {
            DeviceError::Backend(format!("failed to query default input config: {err}"))
        })?;
        let processor = CaptureProcessor::new(profile, far_end);
        open_input_stream(device, supported, processor, producer, stream_failed)
    })?;

    log::debug!(
        "capture profile for \"{}\": noise_suppression={} echo_cancellation={} auto_gain={}",
        device_name,
        profile.noise_suppression,
        profile.echo_cancellation,
        profile.auto_gain
    );

    Ok(InputCapture {
        device_name,
        failed,
        _thread: thread,
    })
}

/// Captures what the machine is playing, for sharing alongside a screen.
///
/// Windows records the default output through WASAPI loopback; Linux reads
/// the PulseAudio monitor source. Other hosts have no loopback path.
pub fn start_system_audio_capture(producer: FrameProducer) -> Result<InputCapture, DeviceError> {
    let failed = Arc::new(AtomicBool::new(false));
    let stream_failed = Arc::clone(&failed);

    let (thread, device_name) = StreamThread::spawn("harmony-system-audio", move || {
        let host = cpal::default_host();
        let (device, supported) = resolve_loopback_device(&host)?;
        // Shared audio goes out as heard, without voice processing.
        let processor = CaptureProcessor::new(
            CaptureProfile {
                noise_suppression: false,
                echo_cancellation: false,
                auto_gain: false,
            },
            FarEndMeter::new(),
        );
        open_input_stream(device, supported, processor, producer, stream_failed)
    })?;

    Ok(InputCapture {
        device_name,
        failed,
        _thread: thread,
    })
}

#[cfg(target_os = "windows")]
fn resolve_loopback_device(
    host: &cpal::Host,
) -> Result<(cpal::Device, SupportedStreamConfig), DeviceError> {
    let device = host
        .default_output_device()
        .ok_or(DeviceError::NoneAvailable("system audio"))?;
    let supported = device.default_output_config().map_err(|err| {
        DeviceError::Backend(format!("failed to query loopback config: {err}"))
    })?;
    Ok((device, supported))
}

#[cfg(target_os = "linux")]
fn resolve_loopback_device(
    host: &cpal::Host,
) -> Result<(cpal::Device, SupportedStreamConfig), DeviceError> {
    let devices = host
        .input_devices()
        .map_err(|err| DeviceError::Backend(format!("failed to enumerate input devices: {err}")))?;
    for device in devices {
        let Ok(name) = device.name() else {
            continue;
        };
        if !name.to_ascii_lowercase().contains("monitor") {
            continue;
        }
        let supported = device.default_input_config().map_err(|err| {
            DeviceError::Backend(format!("failed to query monitor config: {err}"))
        })?;
        return Ok((device, supported));
    }
    Err(DeviceError::NoneAvailable("system audio"))
}

#[cfg(not(any(target_os = "windows", target_os = "linux")))]
fn resolve_loopback_device(
    _host: &cpal::Host,
) -> Result<(cpal::Device, SupportedStreamConfig), DeviceError> {
    Err(DeviceError::NoneAvailable("system audio"))
}

fn open_input_stream(
    device: cpal::Device,
    supported: SupportedStreamConfig,
    processor: CaptureProcessor,
    producer: FrameProducer,
    failed: Arc<AtomicBool>,
) -> Result<(cpal::Stream, String), DeviceError> {
    let device_name = device
        .name()
        .unwrap_or_else(|_| "Unknown Input".to_string());
    let sample_rate = supported.sample_rate().0;
    let sample_format = supported.sample_format();
    let stream_config: StreamConfig = supported.into();

    let aggregator = AudioFrameAggregator::new(usize::from(stream_config.channels), sample_rate)?;
    let capture = CaptureChain {
        aggregator,
        processor,
        producer,
    };
    let err_name = device_name.clone();
    let err_fn = move |err: cpal::StreamError| {
        log::warn!("input stream error on \"{err_name}\": {err}");
        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
            failed.store(true, Ordering::Relaxed);
        }
    };

    let stream = match sample_format {
        SampleFormat::I8 => build_input_stream::<i8>(&device, &stream_config, capture, err_fn),
        SampleFormat::I16 => build_input_stream::<i16>(&device, &stream_config, capture, err_fn),
        SampleFormat::I32 => build_input_stream::<i32>(&device, &stream_config, capture, err_fn),
        SampleFormat::U8 => build_input_stream::<u8>(&device, &stream_config, capture, err_fn),
        SampleFormat::U16 => build_input_stream::<u16>(&device, &stream_config, capture, err_fn),
        SampleFormat::U32 => build_input_stream::<u32>(&device, &stream_config, capture, err_fn),
        SampleFormat::F32 => build_input_stream::<f32>(&device, &stream_config, capture, err_fn),
        SampleFormat::F64 => build_input_stream::<f64>(&device, &stream_config, capture, err_fn),
        other => {
            return Err(DeviceError::Unsupported(format!("{other:?}")));
        }
    }
    .map_err(|err| map_build_error(err, &device_name))?;

    stream
        .play()
        .map_err(|err| DeviceError::Backend(format!("failed to start input stream: {err}")))?;

    log::info!(
        "input stream started: device=\"{}\" sample_rate={} channels={} format={:?}",
        device_name,
        sample_rate,
        stream_config.channels,
        sample_format
    );

    Ok((stream, device_name))
}

/// Everything the capture callback owns.
struct CaptureChain {
    aggregator: AudioFrameAggregator,
    processor: CaptureProcessor,
    producer: FrameProducer,
}

fn resolve_input_device(
    host: &cpal::Host,
    selected_device_id: Option<&str>,
) -> Result<cpal::Device, DeviceError> {
    let Some(target_id) = selected_device_id else {
        return host
            .default_input_device()
            .ok_or(DeviceError::NoneAvailable("input"));
    };

    let devices = host
        .input_devices()
        .map_err(|err| DeviceError::Backend(format!("failed to enumerate input devices: {err}")))?;
    for device in devices {
        let Ok(name) = device.name() else {
            continue;
        };
        if name == target_id {
            return Ok(device);
        }
    }
    Err(DeviceError::Removed(target_id.to_string()))
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut capture: CaptureChain,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: Sample + cpal::SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let CaptureChain {
                aggregator,
                processor,
                producer,
            } = &mut capture;
            aggregator.push(data, |mut frame| {
                processor.process(&mut frame);
                // A full queue counts the drop; the callback never waits.
                producer.push(frame);
            });
        },
        err_fn,
        None,
    )
}
