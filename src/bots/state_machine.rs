use chrono::Utc;
use diesel::prelude::*;
use log::{info, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::billing;
use crate::shared::models::{Bot, BotEvent, BotState, NewBotEvent};
use crate::shared::schema::{bot_events, bots};
use crate::shared::utils::generate_object_id;
use crate::webhooks;

/// Diagnostic sub-state names recorded alongside a transition.
pub mod sub_states {
    pub const LEAVE_REQUESTED: &str = "leave_requested";
    pub const MEETING_ENDED: &str = "meeting_ended";
    pub const KICKED: &str = "kicked";
    pub const AUTO_LEAVE_ONLY_PARTICIPANT: &str = "auto_leave_only_participant";
    pub const AUTO_LEAVE_SILENCE: &str = "auto_leave_silence";
    pub const AUTO_LEAVE_MAX_DURATION: &str = "auto_leave_max_duration";
    pub const AUTO_LEAVE_WAITING_ROOM: &str = "auto_leave_waiting_room";

    pub const CONFIG_INVALID: &str = "config_invalid";
    pub const ADAPTER_CRASH: &str = "adapter_crash";
    pub const PIPELINE_FAILURE: &str = "pipeline_failure";
    pub const HEARTBEAT_TIMEOUT: &str = "heartbeat_timeout";
    pub const LAUNCH_FAILED: &str = "launch_failed";
    pub const REJECTED: &str = "rejected";
    pub const SHUTDOWN_TIMEOUT: &str = "shutdown_timeout";
}

/// Events that drive the bot lifecycle. The transition graph is closed:
/// `next_state` is the single source of truth for what is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionEvent {
    JoinAtReached,
    Launch,
    LaunchReverted,
    WorkerUp,
    Admitted,
    RecordingStarted,
    RecordingPaused,
    RecordingResumed,
    LeaveRequested,
    AdapterClosed,
    Finalized,
    FatalError,
}

impl TransitionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JoinAtReached => "join_at_reached",
            Self::Launch => "launch",
            Self::LaunchReverted => "launch_reverted",
            Self::WorkerUp => "worker_up",
            Self::Admitted => "admitted",
            Self::RecordingStarted => "recording_started",
            Self::RecordingPaused => "recording_paused",
            Self::RecordingResumed => "recording_resumed",
            Self::LeaveRequested => "leave_requested",
            Self::AdapterClosed => "adapter_closed",
            Self::Finalized => "finalized",
            Self::FatalError => "fatal_error",
        }
    }
}

/// Pure transition function. `None` means the event is not valid from the
/// given state.
pub fn next_state(from: BotState, event: TransitionEvent) -> Option<BotState> {
    use BotState::*;
    use TransitionEvent::*;
    match (from, event) {
        (Scheduled, JoinAtReached) => Some(Ready),
        (Ready, Launch) => Some(Staged),
        (Staged, LaunchReverted) => Some(Ready),
        (Staged, WorkerUp) => Some(Joining),
        (Joining, Admitted) => Some(JoinedNotRecording),
        (JoinedNotRecording, RecordingStarted) => Some(JoinedRecording),
        (JoinedRecording, RecordingPaused) => Some(Paused),
        (Paused, RecordingResumed) => Some(JoinedRecording),
        (Joining | JoinedNotRecording | JoinedRecording | Paused, LeaveRequested) => Some(Leaving),
        (Leaving, AdapterClosed) => Some(PostProcessing),
        (PostProcessing, Finalized) => Some(Ended),
        (state, TransitionEvent::FatalError) if !state.is_terminal() => Some(BotState::FatalError),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    /// The bot is no longer in a state the event applies to. Racing callers
    /// treat this as a no-op.
    #[error("event {event} not valid from state {from}")]
    InvalidSource { from: BotState, event: &'static str },
    #[error("bot {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Database(#[from] diesel::result::Error),
}

pub struct Transition {
    pub bot: Bot,
    pub event: BotEvent,
}

/// Apply a lifecycle event to a bot.
///
/// Runs in one transaction: the bot row is locked with `FOR UPDATE`, the
/// transition is validated against the current state, a `bot_events` row is
/// inserted, and the state columns are updated. Terminal transitions also
/// debit organization credits and enqueue the state-change webhook inside the
/// same transaction.
pub fn transition(
    conn: &mut PgConnection,
    bot_id: Uuid,
    event: TransitionEvent,
    sub_state: Option<&str>,
    metadata: Value,
) -> Result<Transition, TransitionError> {
    conn.transaction(|conn| {
        let bot: Bot = match bots::table
            .filter(bots::id.eq(bot_id))
            .for_update()
            .first(conn)
            .optional()?
        {
            Some(bot) => bot,
            None => return Err(TransitionError::NotFound(bot_id)),
        };

        let from = bot.bot_state();
        let to = match next_state(from, event) {
            Some(to) => to,
            None => {
                return Err(TransitionError::InvalidSource {
                    from,
                    event: event.as_str(),
                })
            }
        };

        let new_event = NewBotEvent {
            id: Uuid::new_v4(),
            object_id: generate_object_id("evt"),
            bot_id,
            old_state: from.as_str().to_string(),
            new_state: to.as_str().to_string(),
            event_type: event.as_str().to_string(),
            event_sub_type: sub_state.map(str::to_string),
            metadata,
        };
        let event_row: BotEvent = diesel::insert_into(bot_events::table)
            .values(&new_event)
            .get_result(conn)?;

        let bot: Bot = diesel::update(bots::table.filter(bots::id.eq(bot_id)))
            .set((
                bots::state.eq(to.as_str()),
                bots::sub_state.eq(sub_state),
                bots::updated_at.eq(Utc::now()),
            ))
            .get_result(conn)?;

        if to.is_terminal() {
            if let Err(e) = billing::debit_for_terminal_bot(conn, &bot) {
                warn!(
                    "Credit debit failed for bot {}: {}; rolling back transition",
                    bot.object_id, e
                );
                return Err(TransitionError::Database(
                    diesel::result::Error::RollbackTransaction,
                ));
            }
        }

        webhooks::enqueue_state_change(conn, &bot, &event_row)?;

        info!(
            "Bot {} transitioned {} -> {} ({})",
            bot.object_id,
            from,
            to,
            sub_state.unwrap_or(event.as_str())
        );
        Ok(Transition {
            bot,
            event: event_row,
        })
    })
}

/// Like [`transition`] but swallows the invalid-source race: callers that can
/// legitimately lose a race (janitor vs. worker, duplicate adapter events)
/// use this to keep going.
pub fn try_transition(
    conn: &mut PgConnection,
    bot_id: Uuid,
    event: TransitionEvent,
    sub_state: Option<&str>,
    metadata: Value,
) -> Result<Option<Transition>, TransitionError> {
    match transition(conn, bot_id, event, sub_state, metadata) {
        Ok(t) => Ok(Some(t)),
        Err(TransitionError::InvalidSource { from, event }) => {
            info!(
                "Ignoring event {} for bot {}: not valid from {}",
                event, bot_id, from
            );
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BotState::*;
    use TransitionEvent::*;

    #[test]
    fn happy_path_is_a_valid_chain() {
        let path = [
            (Scheduled, JoinAtReached, Ready),
            (Ready, Launch, Staged),
            (Staged, WorkerUp, Joining),
            (Joining, Admitted, JoinedNotRecording),
            (JoinedNotRecording, RecordingStarted, JoinedRecording),
            (JoinedRecording, LeaveRequested, Leaving),
            (Leaving, AdapterClosed, PostProcessing),
            (PostProcessing, Finalized, Ended),
        ];
        for (from, event, to) in path {
            assert_eq!(next_state(from, event), Some(to), "{from:?} --{event:?}");
        }
    }

    #[test]
    fn pause_resume_cycles() {
        assert_eq!(next_state(JoinedRecording, RecordingPaused), Some(Paused));
        assert_eq!(next_state(Paused, RecordingResumed), Some(JoinedRecording));
        assert_eq!(next_state(Paused, LeaveRequested), Some(Leaving));
    }

    #[test]
    fn fatal_error_reachable_from_every_non_terminal() {
        for state in [
            Scheduled,
            Ready,
            Staged,
            Joining,
            JoinedNotRecording,
            JoinedRecording,
            Paused,
            Leaving,
            PostProcessing,
        ] {
            assert_eq!(
                next_state(state, TransitionEvent::FatalError),
                Some(BotState::FatalError)
            );
        }
        assert_eq!(next_state(Ended, TransitionEvent::FatalError), None);
        assert_eq!(
            next_state(BotState::FatalError, TransitionEvent::FatalError),
            None
        );
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for event in [
            JoinAtReached,
            Launch,
            WorkerUp,
            Admitted,
            RecordingStarted,
            LeaveRequested,
            AdapterClosed,
            Finalized,
            TransitionEvent::FatalError,
        ] {
            assert_eq!(next_state(Ended, event), None);
            assert_eq!(next_state(BotState::FatalError, event), None);
        }
    }

    #[test]
    fn capacity_revert_returns_to_ready() {
        assert_eq!(next_state(Staged, LaunchReverted), Some(Ready));
        assert_eq!(next_state(Joining, LaunchReverted), None);
    }

    #[test]
    fn skipping_states_is_rejected() {
        assert_eq!(next_state(Scheduled, Admitted), None);
        assert_eq!(next_state(Joining, RecordingStarted), None);
        assert_eq!(next_state(JoinedNotRecording, AdapterClosed), None);
    }
}
