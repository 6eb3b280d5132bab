//! Lock-free handoff from the audio callback to the control context.
//!
//! Frames and levels travel on separate bounded queues. Levels overwrite the
//! oldest entry when full and their queue is smaller than the frame queue, so
//! a lagging consumer always loses stale levels before any frame payload.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use super::aggregator::AudioFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelReport {
    pub sequence: u64,
    pub level: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed_frames: u64,
    pub dropped_frames: u64,
    pub dropped_levels: u64,
}

struct Shared {
    frames: ArrayQueue<AudioFrame>,
    levels: ArrayQueue<LevelReport>,
    pushed_frames: AtomicU64,
    dropped_frames: AtomicU64,
    dropped_levels: AtomicU64,
}

impl Shared {
    fn stats(&self) -> QueueStats {
        QueueStats {
            pushed_frames: self.pushed_frames.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            dropped_levels: self.dropped_levels.load(Ordering::Relaxed),
        }
    }
}

/// Audio-side end. Not `Clone`: exactly one producer per queue.
pub struct FrameProducer {
    shared: Arc<Shared>,
}

/// Control-side end.
pub struct FrameConsumer {
    shared: Arc<Shared>,
}

pub fn frame_channel(
    frame_capacity: usize,
    level_capacity: usize,
) -> (FrameProducer, FrameConsumer) {
    let frame_capacity = frame_capacity.max(2);
    let level_capacity = level_capacity.clamp(1, frame_capacity - 1);
    let shared = Arc::new(Shared {
        frames: ArrayQueue::new(frame_capacity),
        levels: ArrayQueue::new(level_capacity),
        pushed_frames: AtomicU64::new(0),
        dropped_frames: AtomicU64::new(0),
        dropped_levels: AtomicU64::new(0),
    });
    (
        FrameProducer {
            shared: Arc::clone(&shared),
        },
        FrameConsumer { shared },
    )
}

impl FrameProducer {
    /// Never blocks. Returns false if the frame itself had to be dropped.
    pub fn push(&self, frame: AudioFrame) -> bool {
        let report = LevelReport {
            sequence: frame.sequence,
            level: frame.level,
        };
        if self.shared.levels.force_push(report).is_some() {
            self.shared.dropped_levels.fetch_add(1, Ordering::Relaxed);
        }

        match self.shared.frames.push(frame) {
            Ok(()) => {
                self.shared.pushed_frames.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.shared.dropped_frames.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.stats()
    }
}

impl FrameConsumer {
    pub fn pop_frame(&self) -> Option<AudioFrame> {
        self.shared.frames.pop()
    }

    pub fn pop_level(&self) -> Option<LevelReport> {
        self.shared.levels.pop()
    }

    pub fn drain_levels(&self, mut visit: impl FnMut(LevelReport)) {
        while let Some(report) = self.shared.levels.pop() {
            visit(report);
        }
    }

    pub fn frames_ready(&self) -> usize {
        self.shared.frames.len()
    }

    /// Whether the producer has delivered at least one frame.
    pub fn has_produced(&self) -> bool {
        self.shared.pushed_frames.load(Ordering::Relaxed) > 0
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.stats()
    }
}
