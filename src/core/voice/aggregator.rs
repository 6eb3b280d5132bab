use cpal::{FromSample, Sample};

use super::resampler::StreamResampler;
use crate::core::error::DeviceError;

/// 20 ms at 48 kHz.
pub const FRAME_SAMPLES: usize = 960;
pub const SILENCE_LEVEL: u8 = 127;
const SILENCE_DBOV: f32 = -127.0;

/// One completed 20 ms mono frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub sequence: u64,
    pub samples: [f32; FRAME_SAMPLES],
    /// 0 = full scale, 127 = silence.
    pub level: u8,
}

impl AudioFrame {
    pub fn silent(sequence: u64) -> Self {
        Self {
            sequence,
            samples: [0.0; FRAME_SAMPLES],
            level: SILENCE_LEVEL,
        }
    }
}

/// Accumulates arbitrarily sized capture blocks into fixed frames.
///
/// Runs on the audio callback: the carry buffer is inline and reused, so
/// `push` never allocates.
pub struct AudioFrameAggregator {
    channels: usize,
    converter: StreamResampler,
    carry: [f32; FRAME_SAMPLES],
    filled: usize,
    next_sequence: u64,
}

impl AudioFrameAggregator {
    pub fn new(channels: usize, input_rate: u32) -> Result<Self, DeviceError> {
        Ok(Self::with_converter(
            channels,
            StreamResampler::to_target(input_rate)?,
        ))
    }

    /// Mono input already at 48 kHz.
    pub fn mono() -> Self {
        Self::with_converter(1, StreamResampler::passthrough())
    }

    fn with_converter(channels: usize, converter: StreamResampler) -> Self {
        Self {
            channels: channels.max(1),
            converter,
            carry: [0.0; FRAME_SAMPLES],
            filled: 0,
            next_sequence: 0,
        }
    }

    /// Samples waiting for the next frame.
    pub fn pending(&self) -> usize {
        self.filled
    }

    /// Feeds one interleaved block and returns how many frames were emitted.
    pub fn push<T, F>(&mut self, block: &[T], mut emit: F) -> usize
    where
        T: Sample,
        f32: FromSample<T>,
        F: FnMut(AudioFrame),
    {
        let channels = self.channels;
        let mut emitted = 0;

        // A trailing partial sample frame cannot be downmixed and is ignored.
        for sample_frame in block.chunks_exact(channels) {
            let mut sum = 0.0_f32;
            for sample in sample_frame {
                sum += f32::from_sample(*sample);
            }
            let mono = sum / channels as f32;

            let Self {
                converter,
                carry,
                filled,
                next_sequence,
                ..
            } = self;
            converter.push(mono, |value| {
                carry[*filled] = value;
                *filled += 1;
                if *filled == FRAME_SAMPLES {
                    let frame = AudioFrame {
                        sequence: *next_sequence,
                        samples: *carry,
                        level: loudness_level(&carry[..]),
                    };
                    *next_sequence = next_sequence.wrapping_add(1);
                    *filled = 0;
                    emitted += 1;
                    emit(frame);
                }
            });
        }

        emitted
    }

    pub fn reset(&mut self) {
        self.filled = 0;
        self.next_sequence = 0;
        self.converter.reset();
    }
}

/// RMS of the frame in dBov, with an all-zero frame pinned to -127.
pub fn frame_dbov(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return SILENCE_DBOV;
    }
    let mut sum = 0.0_f64;
    for &sample in samples {
        sum += f64::from(sample) * f64::from(sample);
    }
    let rms = (sum / samples.len() as f64).sqrt();
    if !rms.is_finite() || rms <= 0.0 {
        return SILENCE_DBOV;
    }
    (20.0 * rms.log10()) as f32
}

pub fn loudness_level(samples: &[f32]) -> u8 {
    let dbov = frame_dbov(samples);
    if !dbov.is_finite() {
        return SILENCE_LEVEL;
    }
    (-dbov).round().clamp(0.0, f32::from(SILENCE_LEVEL)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(aggregator: &mut AudioFrameAggregator, block: &[f32]) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        aggregator.push(block, |frame| frames.push(frame));
        frames
    }

    #[test]
    fn small_blocks_carry_over_until_a_frame_completes() {
        let mut aggregator = AudioFrameAggregator::mono();
        let block = vec![0.5_f32; 400];
        assert!(collect(&mut aggregator, &block).is_empty());
        assert!(collect(&mut aggregator, &block).is_empty());
        let frames = collect(&mut aggregator, &block);
        assert_eq!(frames.len(), 1);
        assert_eq!(aggregator.pending(), 1_200 - FRAME_SAMPLES);
    }

    #[test]
    fn empty_block_is_a_no_op() {
        let mut aggregator = AudioFrameAggregator::mono();
        let empty: [f32; 0] = [];
        assert_eq!(aggregator.push(&empty, |_| panic!("no frame expected")), 0);
        assert_eq!(aggregator.pending(), 0);
    }

    #[test]
    fn sequence_numbers_increase_per_frame() {
        let mut aggregator = AudioFrameAggregator::mono();
        let frames = collect(&mut aggregator, &vec![0.0_f32; FRAME_SAMPLES * 3]);
        let sequences = frames.iter().map(|frame| frame.sequence).collect::<Vec<_>>();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn full_scale_is_level_zero_and_silence_is_127() {
        let loud = [1.0_f32; FRAME_SAMPLES];
        assert_eq!(loudness_level(&loud), 0);

        let alternating = (0..FRAME_SAMPLES)
            .map(|idx| if idx % 2 == 0 { 1.0 } else { -1.0 })
            .collect::<Vec<f32>>();
        assert_eq!(loudness_level(&alternating), 0);

        let silent = [0.0_f32; FRAME_SAMPLES];
        assert_eq!(loudness_level(&silent), SILENCE_LEVEL);
    }

    #[test]
    fn half_scale_is_about_six_db_down() {
        let half = [0.5_f32; FRAME_SAMPLES];
        assert_eq!(loudness_level(&half), 6);
    }

    #[test]
    fn nan_frame_is_treated_as_silence() {
        let mut frame = [0.0_f32; FRAME_SAMPLES];
        frame[10] = f32::NAN;
        assert_eq!(loudness_level(&frame), SILENCE_LEVEL);
    }

    #[test]
    fn stereo_opposite_channels_cancel_to_silence() {
        let mut aggregator = AudioFrameAggregator::new(2, 48_000).expect("aggregator");
        let mut block = Vec::with_capacity(FRAME_SAMPLES * 2);
        for _ in 0..FRAME_SAMPLES {
            block.push(1.0_f32);
            block.push(-1.0_f32);
        }
        let frames = collect(&mut aggregator, &block);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].samples.iter().all(|sample| *sample == 0.0));
        assert_eq!(frames[0].level, SILENCE_LEVEL);
    }

    #[test]
    fn downmix_averages_every_channel() {
        let mut aggregator = AudioFrameAggregator::new(4, 48_000).expect("aggregator");
        let mut block = Vec::with_capacity(FRAME_SAMPLES * 4);
        for _ in 0..FRAME_SAMPLES {
            block.extend_from_slice(&[0.8_f32, 0.4, 0.0, 0.0]);
        }
        let frames = collect(&mut aggregator, &block);
        assert!(frames[0]
            .samples
            .iter()
            .all(|sample| (sample - 0.3).abs() < 1e-6));
    }

    #[test]
    fn integer_samples_are_converted() {
        let mut aggregator = AudioFrameAggregator::mono();
        let block = vec![i16::MAX; FRAME_SAMPLES];
        let mut frames = Vec::new();
        aggregator.push(&block, |frame| frames.push(frame));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].level, 0);
    }

    #[test]
    fn reset_discards_carry() {
        let mut aggregator = AudioFrameAggregator::mono();
        collect(&mut aggregator, &[0.1_f32; 100]);
        aggregator.reset();
        assert_eq!(aggregator.pending(), 0);
        let frames = collect(&mut aggregator, &vec![0.1_f32; FRAME_SAMPLES]);
        assert_eq!(frames[0].sequence, 0);
    }
}
