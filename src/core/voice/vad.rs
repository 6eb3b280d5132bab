use crate::core::config::SpeakingConfig;

/// Hysteresis over per-frame levels: fast attack, slow release.
#[derive(Debug, Clone, Copy)]
pub struct VoiceActivityDetector {
    threshold: u8,
    attack_frames: u32,
    release_frames: u32,
    loud_run: u32,
    quiet_run: u32,
    speaking: bool,
}

impl VoiceActivityDetector {
    pub const fn new(threshold: u8, attack_frames: u32, release_frames: u32) -> Self {
        Self {
            threshold,
            attack_frames,
            release_frames,
            loud_run: 0,
            quiet_run: 0,
            speaking: false,
        }
    }

    pub fn from_config(config: &SpeakingConfig) -> Self {
        Self::new(
            config.threshold,
            config.attack_frames.max(1),
            config.release_frames.max(config.attack_frames).max(1),
        )
    }

    pub fn is_loud(&self, level: u8) -> bool {
        level < self.threshold
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Feeds one level observation; returns the new state if it flipped.
    pub fn observe(&mut self, level: u8) -> Option<bool> {
        if self.is_loud(level) {
            self.quiet_run = 0;
            self.loud_run = self.loud_run.saturating_add(1);
            if !self.speaking && self.loud_run >= self.attack_frames {
                self.speaking = true;
                return Some(true);
            }
        } else {
            self.loud_run = 0;
            self.quiet_run = self.quiet_run.saturating_add(1);
            if self.speaking && self.quiet_run >= self.release_frames {
                self.speaking = false;
                return Some(false);
            }
        }
        None
    }

    /// Drops to silent immediately, e.g. when reports stop arriving.
    pub fn force_silent(&mut self) -> bool {
        let was_speaking = self.speaking;
        self.speaking = false;
        self.loud_run = 0;
        self.quiet_run = 0;
        was_speaking
    }
}

impl Default for VoiceActivityDetector {
    fn default() -> Self {
        Self::from_config(&SpeakingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOUD: u8 = 30;
    const QUIET: u8 = 127;

    #[test]
    fn single_loud_frame_does_not_start_speaking() {
        let mut vad = VoiceActivityDetector::new(100, 3, 5);
        assert_eq!(vad.observe(LOUD), None);
        assert_eq!(vad.observe(QUIET), None);
        assert!(!vad.is_speaking());
    }

    #[test]
    fn attack_then_release_flip_exactly_at_the_counts() {
        let mut vad = VoiceActivityDetector::new(100, 3, 5);
        assert_eq!(vad.observe(LOUD), None);
        assert_eq!(vad.observe(LOUD), None);
        assert_eq!(vad.observe(LOUD), Some(true));

        for _ in 0..4 {
            assert_eq!(vad.observe(QUIET), None);
            assert!(vad.is_speaking());
        }
        assert_eq!(vad.observe(QUIET), Some(false));
    }

    #[test]
    fn loud_blip_during_release_restarts_the_quiet_run() {
        let mut vad = VoiceActivityDetector::new(100, 2, 3);
        vad.observe(LOUD);
        vad.observe(LOUD);
        vad.observe(QUIET);
        vad.observe(QUIET);
        vad.observe(LOUD);
        vad.observe(QUIET);
        vad.observe(QUIET);
        assert!(vad.is_speaking());
        assert_eq!(vad.observe(QUIET), Some(false));
    }

    #[test]
    fn threshold_is_exclusive() {
        let vad = VoiceActivityDetector::new(100, 1, 1);
        assert!(vad.is_loud(99));
        assert!(!vad.is_loud(100));
    }

    #[test]
    fn force_silent_reports_previous_state() {
        let mut vad = VoiceActivityDetector::new(100, 1, 1);
        vad.observe(LOUD);
        assert!(vad.force_silent());
        assert!(!vad.force_silent());
    }
}
