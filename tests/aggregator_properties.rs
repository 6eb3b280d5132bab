use harmony_voice_lib::core::voice::aggregator::{
    loudness_level, AudioFrame, AudioFrameAggregator, FRAME_SAMPLES, SILENCE_LEVEL,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn test_signal(len: usize) -> Vec<f32> {
    (0..len)
        .map(|idx| ((idx as f32 / 17.0).sin() * 0.6) + (idx % 7) as f32 * 0.01)
        .collect()
}

fn push_in_random_blocks(
    aggregator: &mut AudioFrameAggregator,
    samples: &[f32],
    channels: usize,
    rng: &mut StdRng,
) -> Vec<AudioFrame> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset < samples.len() {
        // Blocks are whole sample frames, as the audio callback delivers them.
        let sample_frames = rng.gen_range(0..=700);
        let end = (offset + sample_frames * channels).min(samples.len());
        aggregator.push(&samples[offset..end], |frame| frames.push(frame));
        offset = end;
    }
    frames
}

#[test]
fn any_partition_yields_floor_n_over_960_frames_in_order() {
    let mut rng = StdRng::seed_from_u64(0x5eed_0001);
    for _ in 0..25 {
        let total = rng.gen_range(0..20_000);
        let signal = test_signal(total);
        let mut aggregator = AudioFrameAggregator::mono();

        let frames = push_in_random_blocks(&mut aggregator, &signal, 1, &mut rng);

        assert_eq!(frames.len(), total / FRAME_SAMPLES);
        assert_eq!(aggregator.pending(), total % FRAME_SAMPLES);
        let emitted = frames
            .iter()
            .flat_map(|frame| frame.samples.iter().copied())
            .collect::<Vec<_>>();
        assert_eq!(emitted.as_slice(), &signal[..frames.len() * FRAME_SAMPLES]);
        for (idx, frame) in frames.iter().enumerate() {
            assert_eq!(frame.sequence, idx as u64);
        }
    }
}

#[test]
fn partitioning_does_not_change_frame_contents() {
    let signal = test_signal(FRAME_SAMPLES * 12 + 333);

    let mut whole = AudioFrameAggregator::mono();
    let mut reference = Vec::new();
    whole.push(signal.as_slice(), |frame| reference.push(frame));

    for seed in [1_u64, 2, 3, 42] {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut aggregator = AudioFrameAggregator::mono();
        let frames = push_in_random_blocks(&mut aggregator, &signal, 1, &mut rng);
        assert_eq!(frames, reference);
    }
}

#[test]
fn stereo_partitions_downmix_each_sample_frame() {
    let mut rng = StdRng::seed_from_u64(0x5eed_0002);
    let left = test_signal(FRAME_SAMPLES * 5);
    let mut interleaved = Vec::with_capacity(left.len() * 2);
    for sample in &left {
        interleaved.push(*sample);
        interleaved.push(*sample * 0.5);
    }
    let mut aggregator = AudioFrameAggregator::new(2, 48_000).expect("aggregator");

    let frames = push_in_random_blocks(&mut aggregator, &interleaved, 2, &mut rng);

    assert_eq!(frames.len(), 5);
    for (frame_idx, frame) in frames.iter().enumerate() {
        for (idx, sample) in frame.samples.iter().enumerate() {
            let expected = left[frame_idx * FRAME_SAMPLES + idx] * 0.75;
            assert!((sample - expected).abs() < 1e-6);
        }
    }
}

#[test]
fn level_is_monotonic_in_loudness() {
    let mut previous = SILENCE_LEVEL;
    for amplitude in [0.0001_f32, 0.001, 0.01, 0.1, 0.5, 1.0] {
        let frame = test_signal(FRAME_SAMPLES)
            .into_iter()
            .map(|sample| sample * amplitude)
            .collect::<Vec<_>>();
        let level = loudness_level(&frame);
        assert!(level <= previous, "{amplitude} gave {level} after {previous}");
        assert!(level <= SILENCE_LEVEL);
        previous = level;
    }
}

#[test]
fn resampled_input_still_emits_whole_frames() {
    let mut rng = StdRng::seed_from_u64(0x5eed_0003);
    let one_second_at_44k = test_signal(44_100);
    let mut aggregator = AudioFrameAggregator::new(1, 44_100).expect("aggregator");

    let frames = push_in_random_blocks(&mut aggregator, &one_second_at_44k, 1, &mut rng);

    // One second of input is about fifty 20 ms frames at 48 kHz, less the
    // resampler chunk still waiting for input.
    assert!((47..=50).contains(&frames.len()), "got {}", frames.len());
    assert!(frames
        .iter()
        .all(|frame| frame.samples.iter().all(|sample| sample.is_finite())));
}

fn tone(rate: u32, hz: f32, len: usize) -> Vec<f32> {
    (0..len)
        .map(|idx| (std::f32::consts::TAU * hz * idx as f32 / rate as f32).sin() * 0.5)
        .collect()
}

fn settled_level(input_rate: u32, hz: f32) -> u8 {
    let mut aggregator = AudioFrameAggregator::new(1, input_rate).expect("aggregator");
    let mut frames = Vec::new();
    aggregator.push(tone(input_rate, hz, input_rate as usize).as_slice(), |frame| {
        frames.push(frame)
    });
    assert!(frames.len() > 10, "got {}", frames.len());
    // Skip the engine's start-up delay.
    frames[5..]
        .iter()
        .map(|frame| frame.level)
        .min()
        .unwrap_or(SILENCE_LEVEL)
}

#[test]
fn downsampling_filters_content_above_the_target_nyquist() {
    let passband = settled_level(96_000, 1_000.0);
    let stopband = settled_level(96_000, 30_000.0);

    // A 0.5 amplitude sine sits near -9 dBov.
    assert!(passband <= 10, "1 kHz tone came out at -{passband} dBov");
    assert!(
        stopband >= passband + 40,
        "30 kHz tone aliased back at -{stopband} dBov"
    );
}
