use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::vad::VoiceActivityDetector;
use crate::core::config::SpeakingConfig;
use crate::core::error::TransientNetworkError;
use crate::core::events::{MediaFlags, ParticipantView, RosterSnapshot, SpeakingEvent};

#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: String,
    pub channel_id: String,
    pub flags: MediaFlags,
    pub is_local: bool,
    join_order: u64,
    last_report: Option<Instant>,
    last_level: Option<u8>,
    vad: VoiceActivityDetector,
}

impl Participant {
    pub fn speaking(&self) -> bool {
        self.vad.is_speaking()
    }

    fn view(&self) -> ParticipantView {
        ParticipantView {
            user_id: self.user_id.clone(),
            channel_id: self.channel_id.clone(),
            flags: self.flags,
            speaking: self.speaking(),
            is_local: self.is_local,
        }
    }

    fn speaking_event(&self) -> SpeakingEvent {
        SpeakingEvent {
            user_id: self.user_id.clone(),
            speaking: self.speaking(),
            level: self.last_level,
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExpireOutcome {
    pub speaking: Vec<SpeakingEvent>,
    pub removed: Vec<String>,
}

impl ExpireOutcome {
    pub fn is_empty(&self) -> bool {
        self.speaking.is_empty() && self.removed.is_empty()
    }
}

/// Participants per channel, in join order, with derived speaking state.
///
/// Speaking state only changes through level observations and expiry; there
/// is no setter.
pub struct ParticipantRegistry {
    channels: HashMap<String, Vec<Participant>>,
    speaking: SpeakingConfig,
    hold_window: Duration,
    participant_timeout: Duration,
    next_join_order: u64,
}

impl ParticipantRegistry {
    pub fn new(speaking: SpeakingConfig, participant_timeout: Duration) -> Self {
        Self {
            channels: HashMap::new(),
            hold_window: Duration::from_millis(speaking.hold_window_ms),
            speaking,
            participant_timeout,
            next_join_order: 0,
        }
    }

    /// Adds a participant, moving them if they were in another channel.
    /// Returns false when they were already present in that channel.
    pub fn join(
        &mut self,
        channel_id: &str,
        user_id: &str,
        flags: MediaFlags,
        is_local: bool,
    ) -> bool {
        if let Some(existing) = self.find_mut(user_id) {
            if existing.channel_id == channel_id {
                existing.flags = flags;
                return false;
            }
        }
        self.leave(user_id);

        let participant = Participant {
            user_id: user_id.to_string(),
            channel_id: channel_id.to_string(),
            flags,
            is_local,
            join_order: self.next_join_order,
            last_report: None,
            last_level: None,
            vad: VoiceActivityDetector::from_config(&self.speaking),
        };
        self.next_join_order = self.next_join_order.wrapping_add(1);
        self.channels
            .entry(channel_id.to_string())
            .or_default()
            .push(participant);
        true
    }

    pub fn leave(&mut self, user_id: &str) -> bool {
        let mut removed = false;
        self.channels.retain(|_, participants| {
            let before = participants.len();
            participants.retain(|participant| participant.user_id != user_id);
            removed |= participants.len() != before;
            !participants.is_empty()
        });
        removed
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }

    /// Replaces the whole flag set in one step. Speaking state is untouched.
    pub fn apply_flags(&mut self, user_id: &str, flags: MediaFlags) -> bool {
        let Some(participant) = self.find_mut(user_id) else {
            return false;
        };
        if participant.flags == flags {
            return false;
        }
        participant.flags = flags;
        true
    }

    pub fn report_level(
        &mut self,
        user_id: &str,
        level: u8,
        now: Instant,
    ) -> Result<Option<SpeakingEvent>, TransientNetworkError> {
        let participant = self
            .find_mut(user_id)
            .ok_or_else(|| TransientNetworkError::UnknownParticipant(user_id.to_string()))?;
        participant.last_report = Some(now);
        participant.last_level = Some(level);
        Ok(participant
            .vad
            .observe(level)
            .map(|_| participant.speaking_event()))
    }

    /// Clears speaking state for a participant whose level feed stopped,
    /// e.g. the local user after their capture device went away.
    pub fn force_silent(&mut self, user_id: &str) -> Option<SpeakingEvent> {
        let participant = self.find_mut(user_id)?;
        if !participant.vad.force_silent() {
            return None;
        }
        participant.last_level = None;
        Some(participant.speaking_event())
    }

    /// Resets stale remote speakers and drops participants that went quiet
    /// for longer than the participant timeout. Local participants are fed
    /// per frame and never expire.
    pub fn expire(&mut self, now: Instant) -> ExpireOutcome {
        let mut outcome = ExpireOutcome::default();
        let hold_window = self.hold_window;
        let participant_timeout = self.participant_timeout;

        for participants in self.channels.values_mut() {
            participants.retain_mut(|participant| {
                if participant.is_local {
                    return true;
                }
                let Some(last_report) = participant.last_report else {
                    return true;
                };
                let elapsed = now.saturating_duration_since(last_report);

                if elapsed > participant_timeout {
                    log::debug!(
                        "{}",
                        TransientNetworkError::ReportTimeout {
                            user_id: participant.user_id.clone(),
                            elapsed_ms: elapsed.as_millis() as u64,
                        }
                    );
                    if participant.vad.force_silent() {
                        participant.last_level = None;
                        outcome.speaking.push(participant.speaking_event());
                    }
                    outcome.removed.push(participant.user_id.clone());
                    return false;
                }

                if elapsed > hold_window && participant.vad.force_silent() {
                    participant.last_level = None;
                    outcome.speaking.push(participant.speaking_event());
                }
                true
            });
        }
        self.channels.retain(|_, participants| !participants.is_empty());
        outcome
    }

    pub fn get(&self, user_id: &str) -> Option<&Participant> {
        self.channels
            .values()
            .flat_map(|participants| participants.iter())
            .find(|participant| participant.user_id == user_id)
    }

    pub fn is_speaking(&self, user_id: &str) -> bool {
        self.get(user_id).is_some_and(Participant::speaking)
    }

    pub fn participants(&self, channel_id: &str) -> &[Participant] {
        self.channels
            .get(channel_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn snapshot(&self, channel_id: Option<&str>) -> RosterSnapshot {
        let Some(channel_id) = channel_id else {
            return RosterSnapshot::default();
        };
        let mut participants = self.participants(channel_id).iter().collect::<Vec<_>>();
        participants.sort_by_key(|participant| participant.join_order);
        RosterSnapshot {
            channel_id: Some(channel_id.to_string()),
            participants: participants.into_iter().map(Participant::view).collect(),
        }
    }

    fn find_mut(&mut self, user_id: &str) -> Option<&mut Participant> {
        self.channels
            .values_mut()
            .flat_map(|participants| participants.iter_mut())
            .find(|participant| participant.user_id == user_id)
    }
}
