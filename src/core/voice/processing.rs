use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use nnnoiseless::DenoiseState;

use super::aggregator::{loudness_level, AudioFrame, FRAME_SAMPLES};
use crate::core::config::CaptureProfile;

const DENOISE_FRAME_SIZE: usize = DenoiseState::FRAME_SIZE;
const DENOISE_SCALE: f32 = 32_767.0;

/// Far-end RMS above which the microphone is assumed to be hearing playback.
const ECHO_FAR_END_RMS: f32 = 0.01;
/// Near-end louder than this multiple of the far end is treated as double talk.
const ECHO_DOUBLE_TALK_RATIO: f32 = 2.0;
const ECHO_SUPPRESSION_GAIN: f32 = 0.1;

const AGC_TARGET_RMS: f32 = 0.1;
const AGC_MAX_GAIN: f32 = 8.0;
const AGC_MIN_GAIN: f32 = 0.25;
/// Frames quieter than this are noise floor and do not move the gain.
const AGC_GATE_RMS: f32 = 0.001;
const AGC_RAISE_STEP: f32 = 1.25;
const AGC_LOWER_STEP: f32 = 0.7;

/// Most recent playback RMS, written by the output callback and read by the
/// capture callback.
#[derive(Debug, Clone, Default)]
pub struct FarEndMeter {
    rms_bits: Arc<AtomicU32>,
}

impl FarEndMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, samples: &[f32]) {
        self.rms_bits.store(rms(samples).to_bits(), Ordering::Relaxed);
    }

    pub fn rms(&self) -> f32 {
        f32::from_bits(self.rms_bits.load(Ordering::Relaxed))
    }
}

/// Per-stream processing chain applied to each 20 ms capture frame:
/// echo suppression, then RNNoise, then automatic gain. Stages follow the
/// capture profile the stream was opened with.
pub struct CaptureProcessor {
    profile: CaptureProfile,
    far_end: FarEndMeter,
    denoiser: Option<Box<DenoiseState<'static>>>,
    gain: f32,
}

impl CaptureProcessor {
    pub fn new(profile: CaptureProfile, far_end: FarEndMeter) -> Self {
        Self {
            profile,
            far_end,
            denoiser: profile.noise_suppression.then(DenoiseState::new),
            gain: 1.0,
        }
    }

    pub fn process(&mut self, frame: &mut AudioFrame) {
        let profile = self.profile;
        if !(profile.echo_cancellation || profile.noise_suppression || profile.auto_gain) {
            return;
        }

        if profile.echo_cancellation {
            self.suppress_echo(&mut frame.samples);
        }
        if let Some(denoiser) = self.denoiser.as_mut() {
            denoise(denoiser, &mut frame.samples);
        }
        if profile.auto_gain {
            self.apply_gain(&mut frame.samples);
        }
        frame.level = loudness_level(&frame.samples);
    }

    fn suppress_echo(&self, samples: &mut [f32; FRAME_SAMPLES]) {
        let far = self.far_end.rms();
        if far < ECHO_FAR_END_RMS {
            return;
        }
        if rms(samples) > far * ECHO_DOUBLE_TALK_RATIO {
            return;
        }
        for sample in samples.iter_mut() {
            *sample *= ECHO_SUPPRESSION_GAIN;
        }
    }

    fn apply_gain(&mut self, samples: &mut [f32; FRAME_SAMPLES]) {
        let level = rms(samples);
        if level >= AGC_GATE_RMS {
            let wanted = (AGC_TARGET_RMS / level).clamp(AGC_MIN_GAIN, AGC_MAX_GAIN);
            // Back off quickly, recover slowly.
            self.gain = if wanted < self.gain {
                (self.gain * AGC_LOWER_STEP).max(wanted)
            } else {
                (self.gain * AGC_RAISE_STEP).min(wanted)
            };
        }
        for sample in samples.iter_mut() {
            *sample = soft_limiter(*sample * self.gain);
        }
    }
}

fn denoise(state: &mut DenoiseState<'static>, samples: &mut [f32; FRAME_SAMPLES]) {
    let mut scaled = [0.0_f32; DENOISE_FRAME_SIZE];
    let mut cleaned = [0.0_f32; DENOISE_FRAME_SIZE];
    for chunk in samples.chunks_exact_mut(DENOISE_FRAME_SIZE) {
        for (dst, src) in scaled.iter_mut().zip(chunk.iter()) {
            *dst = *src * DENOISE_SCALE;
        }
        state.process_frame(&mut cleaned, &scaled);
        for (dst, src) in chunk.iter_mut().zip(cleaned.iter()) {
            *dst = *src / DENOISE_SCALE;
        }
    }
}

pub fn soft_limiter(sample: f32) -> f32 {
    let abs = sample.abs();
    if abs <= 1.0 {
        sample
    } else {
        sample / (1.0 + abs * 0.5)
    }
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum = samples
        .iter()
        .filter(|sample| sample.is_finite())
        .map(|sample| sample * sample)
        .sum::<f32>();
    (sum / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    const OFF: CaptureProfile = CaptureProfile {
        noise_suppression: false,
        echo_cancellation: false,
        auto_gain: false,
    };

    fn tone_frame(amplitude: f32) -> AudioFrame {
        let mut frame = AudioFrame::silent(0);
        for (idx, sample) in frame.samples.iter_mut().enumerate() {
            *sample = (std::f32::consts::TAU * 440.0 * idx as f32 / 48_000.0).sin() * amplitude;
        }
        frame.level = loudness_level(&frame.samples);
        frame
    }

    #[test]
    fn disabled_profile_leaves_frames_untouched() {
        let mut processor = CaptureProcessor::new(OFF, FarEndMeter::new());
        let original = tone_frame(0.3);
        let mut frame = original.clone();
        processor.process(&mut frame);
        assert_eq!(frame, original);
    }

    #[test]
    fn noise_suppression_attenuates_steady_noise() {
        let profile = CaptureProfile {
            noise_suppression: true,
            ..OFF
        };
        let mut processor = CaptureProcessor::new(profile, FarEndMeter::new());
        let mut rng = StdRng::seed_from_u64(0x5eed_0004);

        let mut input_level = 0;
        let mut output_level = 0;
        for _ in 0..100 {
            let mut frame = AudioFrame::silent(0);
            for sample in frame.samples.iter_mut() {
                *sample = rng.gen_range(-0.1..0.1);
            }
            input_level = loudness_level(&frame.samples);
            processor.process(&mut frame);
            output_level = frame.level;
        }

        assert!(
            output_level >= input_level + 6,
            "noise went from -{input_level} to -{output_level} dBov"
        );
    }

    #[test]
    fn auto_gain_raises_a_quiet_talker() {
        let profile = CaptureProfile {
            auto_gain: true,
            ..OFF
        };
        let mut processor = CaptureProcessor::new(profile, FarEndMeter::new());
        let quiet = tone_frame(0.02);

        let mut frame = quiet.clone();
        for _ in 0..20 {
            frame = quiet.clone();
            processor.process(&mut frame);
        }

        assert!(processor.gain > 4.0, "gain {}", processor.gain);
        assert!(frame.level + 10 < quiet.level);
    }

    #[test]
    fn auto_gain_ignores_the_noise_floor() {
        let profile = CaptureProfile {
            auto_gain: true,
            ..OFF
        };
        let mut processor = CaptureProcessor::new(profile, FarEndMeter::new());
        for _ in 0..20 {
            let mut frame = AudioFrame::silent(0);
            processor.process(&mut frame);
        }
        assert_eq!(processor.gain, 1.0);
    }

    #[test]
    fn echo_is_suppressed_while_the_far_end_plays() {
        let profile = CaptureProfile {
            echo_cancellation: true,
            ..OFF
        };
        let far_end = FarEndMeter::new();
        let mut processor = CaptureProcessor::new(profile, far_end.clone());
        let leaked = tone_frame(0.1);

        let mut quiet_room = leaked.clone();
        processor.process(&mut quiet_room);
        assert_eq!(quiet_room.samples, leaked.samples);

        far_end.record(&tone_frame(0.5).samples);
        let mut echoing = leaked.clone();
        processor.process(&mut echoing);
        assert!(echoing.level >= leaked.level + 19, "level {}", echoing.level);
    }

    #[test]
    fn double_talk_passes_through_echo_suppression() {
        let profile = CaptureProfile {
            echo_cancellation: true,
            ..OFF
        };
        let far_end = FarEndMeter::new();
        far_end.record(&tone_frame(0.05).samples);
        let mut processor = CaptureProcessor::new(profile, far_end);

        let talker = tone_frame(0.8);
        let mut frame = talker.clone();
        processor.process(&mut frame);
        assert_eq!(frame.samples, talker.samples);
    }

    #[test]
    fn limiter_keeps_boosted_peaks_bounded() {
        assert_eq!(soft_limiter(0.5), 0.5);
        assert!(soft_limiter(4.0) < 1.5);
        assert!(soft_limiter(-4.0) > -1.5);
    }
}
