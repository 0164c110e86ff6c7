use crate::shared::models::AutoLeaveSettings;

/// Why the controller decided to leave without being told to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoLeaveReason {
    OnlyParticipant,
    Silence,
    MaxDuration,
    WaitingRoom,
}

impl AutoLeaveReason {
    pub fn sub_state(&self) -> &'static str {
        use crate::bots::state_machine::sub_states;
        match self {
            Self::OnlyParticipant => sub_states::AUTO_LEAVE_ONLY_PARTICIPANT,
            Self::Silence => sub_states::AUTO_LEAVE_SILENCE,
            Self::MaxDuration => sub_states::AUTO_LEAVE_MAX_DURATION,
            Self::WaitingRoom => sub_states::AUTO_LEAVE_WAITING_ROOM,
        }
    }
}

/// Evaluates the auto-leave policy on a monotonic millisecond clock supplied
/// by the caller. All four timers are independent; the first to fire wins.
pub struct AutoLeaveTracker {
    settings: AutoLeaveSettings,
    joining_since_ms: i64,
    admitted_at_ms: Option<i64>,
    alone_since_ms: Option<i64>,
    last_speech_ms: Option<i64>,
}

impl AutoLeaveTracker {
    pub fn new(settings: AutoLeaveSettings, now_ms: i64) -> Self {
        Self {
            settings,
            joining_since_ms: now_ms,
            admitted_at_ms: None,
            alone_since_ms: None,
            last_speech_ms: None,
        }
    }

    pub fn on_admitted(&mut self, now_ms: i64) {
        self.admitted_at_ms = Some(now_ms);
        self.last_speech_ms = Some(now_ms);
        self.alone_since_ms = Some(now_ms);
    }

    pub fn on_speech(&mut self, now_ms: i64) {
        self.last_speech_ms = Some(now_ms);
    }

    /// Non-bot participant count after a join or leave.
    pub fn on_participant_count(&mut self, count: usize, now_ms: i64) {
        if count == 0 {
            if self.alone_since_ms.is_none() {
                self.alone_since_ms = Some(now_ms);
            }
        } else {
            self.alone_since_ms = None;
        }
    }

    pub fn check(&self, now_ms: i64) -> Option<AutoLeaveReason> {
        let admitted_at = match self.admitted_at_ms {
            Some(at) => at,
            None => {
                let waiting = (now_ms - self.joining_since_ms) / 1000;
                if waiting >= self.settings.waiting_room_timeout_seconds as i64 {
                    return Some(AutoLeaveReason::WaitingRoom);
                }
                return None;
            }
        };

        if (now_ms - admitted_at) / 1000 >= self.settings.max_duration_seconds as i64 {
            return Some(AutoLeaveReason::MaxDuration);
        }
        if let Some(alone_since) = self.alone_since_ms {
            if (now_ms - alone_since) / 1000 >= self.settings.only_participant_timeout_seconds as i64
            {
                return Some(AutoLeaveReason::OnlyParticipant);
            }
        }
        if let Some(last_speech) = self.last_speech_ms {
            if (now_ms - last_speech) / 1000 >= self.settings.silence_timeout_seconds as i64 {
                return Some(AutoLeaveReason::Silence);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> AutoLeaveSettings {
        AutoLeaveSettings {
            only_participant_timeout_seconds: 10,
            silence_timeout_seconds: 600,
            max_duration_seconds: 3_600,
            waiting_room_timeout_seconds: 900,
        }
    }

    #[test]
    fn waiting_room_timeout_fires_before_admission() {
        let tracker = AutoLeaveTracker::new(settings(), 0);
        assert_eq!(tracker.check(899_000), None);
        assert_eq!(tracker.check(900_000), Some(AutoLeaveReason::WaitingRoom));
    }

    #[test]
    fn only_participant_fires_after_continuous_emptiness() {
        let mut tracker = AutoLeaveTracker::new(settings(), 0);
        tracker.on_admitted(0);
        tracker.on_participant_count(2, 1_000);
        tracker.on_speech(25_000);

        // Everyone leaves at t=30s; the 10s only-participant timer fires ~40s.
        tracker.on_participant_count(0, 30_000);
        assert_eq!(tracker.check(39_000), None);
        assert_eq!(tracker.check(40_000), Some(AutoLeaveReason::OnlyParticipant));
    }

    #[test]
    fn rejoin_resets_the_alone_timer() {
        let mut tracker = AutoLeaveTracker::new(settings(), 0);
        tracker.on_admitted(0);
        tracker.on_participant_count(0, 5_000);
        tracker.on_participant_count(1, 9_000);
        tracker.on_speech(9_000);
        assert_eq!(tracker.check(20_000), None);
    }

    #[test]
    fn silence_timeout_counts_from_last_speech() {
        let mut tracker = AutoLeaveTracker::new(settings(), 0);
        tracker.on_admitted(0);
        tracker.on_participant_count(2, 0);
        tracker.on_speech(100_000);
        assert_eq!(tracker.check(699_000), None);
        assert_eq!(tracker.check(700_000), Some(AutoLeaveReason::Silence));
    }

    #[test]
    fn max_duration_wins_over_everything() {
        let mut tracker = AutoLeaveTracker::new(settings(), 0);
        tracker.on_admitted(0);
        tracker.on_participant_count(3, 0);
        tracker.on_speech(3_599_000);
        assert_eq!(tracker.check(3_600_000), Some(AutoLeaveReason::MaxDuration));
    }
}
