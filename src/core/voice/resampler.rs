use audioadapter_buffers::direct::SequentialSliceOfVecs;
use rubato::{Fft, FixedSync, Resampler};

use crate::core::error::DeviceError;

pub const TARGET_SAMPLE_RATE: u32 = 48_000;
const RESAMPLER_CHUNK_FRAMES: usize = 960;

const MONO: usize = 1;

/// Band-limited mono rate converter fed one sample at a time.
///
/// Samples collect into a fixed input chunk; each full chunk goes through the
/// FFT resampler and the converted samples are handed to `emit` in order.
/// Both work buffers are sized once, so the audio callback never allocates.
/// Matching rates skip the engine entirely.
pub struct StreamResampler {
    engine: Option<Fft<f32>>,
    work_in: Vec<Vec<f32>>,
    work_out: Vec<Vec<f32>>,
    filled: usize,
}

impl StreamResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self, DeviceError> {
        let safe_input = input_rate.max(1);
        let safe_output = output_rate.max(1);
        if safe_input == safe_output {
            return Ok(Self::passthrough());
        }

        let engine = Fft::<f32>::new(
            safe_input as usize,
            safe_output as usize,
            RESAMPLER_CHUNK_FRAMES,
            2,
            MONO,
            FixedSync::Input,
        )
        .map_err(|err| DeviceError::Backend(format!("failed to create resampler: {err}")))?;
        let input_frames_max = engine.input_frames_max();
        let output_frames_max = engine.output_frames_max();

        Ok(Self {
            engine: Some(engine),
            work_in: vec![vec![0.0; input_frames_max]],
            work_out: vec![vec![0.0; output_frames_max]],
            filled: 0,
        })
    }

    pub fn to_target(input_rate: u32) -> Result<Self, DeviceError> {
        Self::new(input_rate, TARGET_SAMPLE_RATE)
    }

    /// No conversion; every sample is emitted as it arrives.
    pub fn passthrough() -> Self {
        Self {
            engine: None,
            work_in: Vec::new(),
            work_out: Vec::new(),
            filled: 0,
        }
    }

    pub fn push(&mut self, sample: f32, mut emit: impl FnMut(f32)) {
        let Some(engine) = self.engine.as_mut() else {
            emit(sample);
            return;
        };

        self.work_in[0][self.filled] = sample;
        self.filled += 1;
        let input_frames = engine.input_frames_next();
        if self.filled < input_frames {
            return;
        }
        self.filled = 0;

        let output_frames = engine.output_frames_next();
        let written = SequentialSliceOfVecs::new(&self.work_in[..], MONO, input_frames)
            .map_err(|err| err.to_string())
            .and_then(|input| {
                let mut output =
                    SequentialSliceOfVecs::new_mut(&mut self.work_out[..], MONO, output_frames)
                        .map_err(|err| err.to_string())?;
                engine
                    .process_into_buffer(&input, &mut output, None)
                    .map_err(|err| err.to_string())
            });
        // A chunk the engine rejects is dropped rather than passed through
        // at the wrong rate.
        if let Ok((_, frames_written)) = written {
            for value in &self.work_out[0][..frames_written] {
                emit(*value);
            }
        }
    }

    pub fn reset(&mut self) {
        self.filled = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(resampler: &mut StreamResampler, input: &[f32]) -> Vec<f32> {
        let mut output = Vec::new();
        for sample in input {
            resampler.push(*sample, |value| output.push(value));
        }
        output
    }

    #[test]
    fn passthrough_when_rates_match() {
        let mut resampler = StreamResampler::new(48_000, 48_000).expect("creates passthrough");
        let input = [0.1_f32, -0.2, 0.3, -0.4];
        assert_eq!(run(&mut resampler, &input), input.to_vec());
    }

    #[test]
    fn resamples_44100_to_48000_without_nans() {
        let mut resampler = StreamResampler::to_target(44_100).expect("creates resampler");
        let input = (0..44_100)
            .map(|idx| ((idx as f32) / 40.0).sin() * 0.7)
            .collect::<Vec<_>>();
        let output = run(&mut resampler, &input);

        assert!(output.iter().all(|value| value.is_finite()));
        // One partially filled chunk and the engine delay stay buffered.
        let shortfall = 48_000 - output.len() as i64;
        assert!((0..=2 * RESAMPLER_CHUNK_FRAMES as i64).contains(&shortfall), "got {}", output.len());
    }

    #[test]
    fn output_arrives_in_whole_chunks() {
        let mut resampler = StreamResampler::new(24_000, 48_000).expect("creates resampler");
        let output = run(&mut resampler, &vec![0.25_f32; RESAMPLER_CHUNK_FRAMES - 1]);
        assert!(output.is_empty());
        let mut more = Vec::new();
        resampler.push(0.25, |value| more.push(value));
        assert_eq!(more.len(), RESAMPLER_CHUNK_FRAMES * 2);
    }

    #[test]
    fn reset_discards_partial_chunk() {
        let mut resampler = StreamResampler::new(24_000, 48_000).expect("creates resampler");
        run(&mut resampler, &vec![0.5_f32; RESAMPLER_CHUNK_FRAMES / 2]);
        resampler.reset();
        let output = run(&mut resampler, &vec![0.5_f32; RESAMPLER_CHUNK_FRAMES / 2 + 1]);
        assert!(output.is_empty());
    }
}
