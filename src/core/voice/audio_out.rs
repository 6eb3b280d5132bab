use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, StreamConfig};
use crossbeam_queue::ArrayQueue;

use super::processing::FarEndMeter;
use super::resampler::{StreamResampler, TARGET_SAMPLE_RATE};
use super::{map_build_error, OutputPipeline, StreamThread};
use crate::core::error::DeviceError;
use crate::core::events::{DeviceInfo, DeviceKind};

/// Playback buffer in device-rate samples; 500 ms at 48 kHz.
const PLAYOUT_CAPACITY: usize = 24_000;

pub struct OutputPlayback {
    device_name: String,
    playout: Arc<ArrayQueue<f32>>,
    converter: StreamResampler,
    failed: Arc<AtomicBool>,
    _thread: StreamThread,
}

impl OutputPipeline for OutputPlayback {
    fn device_name(&self) -> &str {
        &self.device_name
    }

    fn play(&mut self, samples: &[f32]) {
        let playout = &self.playout;
        for sample in samples {
            // Overwrites the oldest queued audio instead of growing latency.
            self.converter.push(*sample, |value| {
                playout.force_push(value);
            });
        }
    }

    fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }
}

pub fn list_output_devices() -> Result<Vec<DeviceInfo>, DeviceError> {
    let host = cpal::default_host();
    let default_name = host
        .default_output_device()
        .and_then(|device| device.name().ok());

    let devices = host
        .output_devices()
        .map_err(|err| DeviceError::Backend(format!("failed to enumerate output devices: {err}")))?;

    Ok(devices
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Output Device {}", idx + 1));
            DeviceInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                id: name.clone(),
                label: name,
                kind: DeviceKind::Output,
            }
        })
        .collect())
}

/// Opens playback. Every block the device pulls is metered into `far_end`
/// so capture can tell when the speakers are active.
pub fn start_output_playback(
    selected_device_id: Option<&str>,
    far_end: FarEndMeter,
) -> Result<OutputPlayback, DeviceError> {
    let selected_device_id = selected_device_id.map(str::to_string);
    let playout = Arc::new(ArrayQueue::new(PLAYOUT_CAPACITY));
    let failed = Arc::new(AtomicBool::new(false));
    let (rate_tx, rate_rx) = std::sync::mpsc::channel();

    let stream_playout = Arc::clone(&playout);
    let stream_failed = Arc::clone(&failed);
    let (thread, device_name) = StreamThread::spawn("harmony-playback", move || {
        let (stream, name, sample_rate) =
            open_output_stream(
                selected_device_id.as_deref(),
                stream_playout,
                far_end,
                stream_failed,
            )?;
        let _ = rate_tx.send(sample_rate);
        Ok((stream, name))
    })?;
    let sample_rate = rate_rx.recv().unwrap_or(TARGET_SAMPLE_RATE);

    Ok(OutputPlayback {
        device_name,
        playout,
        converter: StreamResampler::new(TARGET_SAMPLE_RATE, sample_rate)?,
        failed,
        _thread: thread,
    })
}

fn open_output_stream(
    selected_device_id: Option<&str>,
    playout: Arc<ArrayQueue<f32>>,
    far_end: FarEndMeter,
    failed: Arc<AtomicBool>,
) -> Result<(cpal::Stream, String, u32), DeviceError> {
    let host = cpal::default_host();
    let device = resolve_output_device(&host, selected_device_id)?;
    let device_name = device
        .name()
        .unwrap_or_else(|_| "Unknown Output".to_string());
    let supported = device.default_output_config().map_err(|err| {
        DeviceError::Backend(format!("failed to query default output config: {err}"))
    })?;
    let sample_rate = supported.sample_rate().0;
    let sample_format = supported.sample_format();
    let stream_config: StreamConfig = supported.into();

    let err_name = device_name.clone();
    let err_fn = move |err: cpal::StreamError| {
        log::warn!("output stream error on \"{err_name}\": {err}");
        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
            failed.store(true, Ordering::Relaxed);
        }
    };

    let playout = Playout {
        queue: playout,
        far_end,
        block: Vec::with_capacity(4_096),
    };
    let stream = match sample_format {
        SampleFormat::I8 => build_output_stream::<i8>(&device, &stream_config, playout, err_fn),
        SampleFormat::I16 => build_output_stream::<i16>(&device, &stream_config, playout, err_fn),
        SampleFormat::I32 => build_output_stream::<i32>(&device, &stream_config, playout, err_fn),
        SampleFormat::U8 => build_output_stream::<u8>(&device, &stream_config, playout, err_fn),
        SampleFormat::U16 => build_output_stream::<u16>(&device, &stream_config, playout, err_fn),
        SampleFormat::U32 => build_output_stream::<u32>(&device, &stream_config, playout, err_fn),
        SampleFormat::F32 => build_output_stream::<f32>(&device, &stream_config, playout, err_fn),
        SampleFormat::F64 => build_output_stream::<f64>(&device, &stream_config, playout, err_fn),
        other => {
            return Err(DeviceError::Unsupported(format!("{other:?}")));
        }
    }
    .map_err(|err| map_build_error(err, &device_name))?;

    stream
        .play()
        .map_err(|err| DeviceError::Backend(format!("failed to start output stream: {err}")))?;

    log::info!(
        "output stream started: device=\"{}\" sample_rate={} channels={} format={:?}",
        device_name,
        sample_rate,
        stream_config.channels,
        sample_format
    );

    Ok((stream, device_name, sample_rate))
}

fn resolve_output_device(
    host: &cpal::Host,
    selected_device_id: Option<&str>,
) -> Result<cpal::Device, DeviceError> {
    let Some(target_id) = selected_device_id else {
        return host
            .default_output_device()
            .ok_or(DeviceError::NoneAvailable("output"));
    };

    let devices = host
        .output_devices()
        .map_err(|err| DeviceError::Backend(format!("failed to enumerate output devices: {err}")))?;
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

/// Everything the playback callback owns.
struct Playout {
    queue: Arc<ArrayQueue<f32>>,
    far_end: FarEndMeter,
    block: Vec<f32>,
}

impl Playout {
    /// Pops one mono sample per output frame; underrun plays silence.
    fn fill(&mut self, frames: usize) -> &[f32] {
        self.block.clear();
        for _ in 0..frames {
            self.block.push(self.queue.pop().unwrap_or(0.0));
        }
        self.far_end.record(&self.block);
        &self.block
    }
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut playout: Playout,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: Sample + cpal::SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = usize::from(config.channels).max(1);
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let mono = playout.fill(data.len() / channels);
            for (frame, value) in data.chunks_exact_mut(channels).zip(mono) {
                let value = T::from_sample(*value);
                for sample in frame {
                    *sample = value;
                }
            }
        },
        err_fn,
        None,
    )
}
