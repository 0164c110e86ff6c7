use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use log::warn;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::shared::models::{
    Bot, BotState, ChatMessageRow, NewBot, NewChatMessage, NewParticipant, NewParticipantEvent,
    NewRecording, NewUtterance, Participant, ParticipantEventType, Recording, RecordingState,
    SessionType, TranscriptionState, Utterance,
};
use crate::shared::models::Credential;
use crate::shared::schema::{
    bot_events, bots, chat_messages, credentials, participant_events, participants, recordings,
    utterances,
};
use crate::shared::utils::generate_object_id;

pub mod state_machine;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBotRequest {
    pub meeting_url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub join_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deduplication_key: Option<String>,
    #[serde(default)]
    pub settings: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub session_type: Option<SessionType>,
}

/// Create a bot, honoring deduplication: a request whose `deduplication_key`
/// matches an existing non-terminal bot in the project returns that bot with
/// no new row. Two concurrent creates are serialized by the partial unique
/// index on `(project_id, deduplication_key)`.
pub fn create_bot(
    conn: &mut PgConnection,
    project_id: Uuid,
    req: &CreateBotRequest,
) -> anyhow::Result<(Bot, bool)> {
    if let Some(key) = &req.deduplication_key {
        if let Some(existing) = find_active_duplicate(conn, project_id, key)? {
            return Ok((existing, false));
        }
    }

    let initial_state = if req.join_at.is_some() {
        BotState::Scheduled
    } else {
        BotState::Ready
    };
    let new_bot = NewBot {
        id: Uuid::new_v4(),
        object_id: generate_object_id("bot"),
        project_id,
        session_type: req
            .session_type
            .unwrap_or(SessionType::Bot)
            .as_str()
            .to_string(),
        meeting_url: req.meeting_url.clone(),
        name: req.name.clone().unwrap_or_else(|| "Notetaker".to_string()),
        state: initial_state.as_str().to_string(),
        sub_state: None,
        join_at: req.join_at,
        deduplication_key: req.deduplication_key.clone(),
        settings: req.settings.clone().unwrap_or_else(|| serde_json::json!({})),
        metadata: req.metadata.clone().unwrap_or_else(|| serde_json::json!({})),
    };

    match diesel::insert_into(bots::table)
        .values(&new_bot)
        .get_result::<Bot>(conn)
    {
        Ok(bot) => {
            create_primary_recording(conn, &bot)?;
            Ok((bot, true))
        }
        Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            // Lost the race to a concurrent create with the same key.
            let key = req.deduplication_key.as_deref().unwrap_or_default();
            let existing = find_active_duplicate(conn, project_id, key)?
                .ok_or_else(|| anyhow::anyhow!("duplicate bot vanished during create"))?;
            Ok((existing, false))
        }
        Err(e) => Err(e.into()),
    }
}

fn find_active_duplicate(
    conn: &mut PgConnection,
    project_id: Uuid,
    key: &str,
) -> QueryResult<Option<Bot>> {
    bots::table
        .filter(bots::project_id.eq(project_id))
        .filter(bots::deduplication_key.eq(key))
        .filter(bots::state.ne_all(vec![
            BotState::Ended.as_str(),
            BotState::FatalError.as_str(),
        ]))
        .first(conn)
        .optional()
}

fn create_primary_recording(conn: &mut PgConnection, bot: &Bot) -> QueryResult<Recording> {
    let settings = bot.bot_settings();
    diesel::insert_into(recordings::table)
        .values(&NewRecording {
            id: Uuid::new_v4(),
            object_id: generate_object_id("rec"),
            bot_id: bot.id,
            state: RecordingState::NotStarted.as_str().to_string(),
            transcription_state: TranscriptionState::NotStarted.as_str().to_string(),
            recording_type: settings.recording_type.as_str().to_string(),
            participant_uuid: None,
        })
        .get_result(conn)
}

pub fn get_bot(conn: &mut PgConnection, id: Uuid) -> QueryResult<Option<Bot>> {
    bots::table.filter(bots::id.eq(id)).first(conn).optional()
}

pub fn get_bot_by_object_id(
    conn: &mut PgConnection,
    project_id: Uuid,
    object_id: &str,
) -> QueryResult<Option<Bot>> {
    bots::table
        .filter(bots::project_id.eq(project_id))
        .filter(bots::object_id.eq(object_id))
        .first(conn)
        .optional()
}

pub fn list_bots(conn: &mut PgConnection, project_id: Uuid, limit: i64) -> QueryResult<Vec<Bot>> {
    bots::table
        .filter(bots::project_id.eq(project_id))
        .order(bots::created_at.desc())
        .limit(limit)
        .load(conn)
}

/// Liveness write from the worker. The first heartbeat also records when the
/// worker came up, which the janitor uses to tell never-started from died.
pub fn write_heartbeat(conn: &mut PgConnection, bot_id: Uuid) -> QueryResult<()> {
    let now = Utc::now();
    diesel::update(bots::table.filter(bots::id.eq(bot_id)))
        .set((
            bots::heartbeat_timestamp.eq(now),
            bots::first_heartbeat_timestamp.eq(diesel::dsl::sql::<
                diesel::sql_types::Nullable<diesel::sql_types::Timestamptz>,
            >("COALESCE(first_heartbeat_timestamp, NOW())")),
        ))
        .execute(conn)?;
    Ok(())
}

/// When the bot entered a joined state, from the append-only event log.
pub fn joined_at(conn: &mut PgConnection, bot_id: Uuid) -> QueryResult<Option<DateTime<Utc>>> {
    bot_events::table
        .filter(bot_events::bot_id.eq(bot_id))
        .filter(bot_events::new_state.eq(BotState::JoinedNotRecording.as_str()))
        .order(bot_events::created_at.asc())
        .select(bot_events::created_at)
        .first(conn)
        .optional()
}

pub fn events_for_bot(
    conn: &mut PgConnection,
    bot_id: Uuid,
) -> QueryResult<Vec<crate::shared::models::BotEvent>> {
    bot_events::table
        .filter(bot_events::bot_id.eq(bot_id))
        .order(bot_events::created_at.asc())
        .load(conn)
}

pub fn ensure_participant(
    conn: &mut PgConnection,
    bot_id: Uuid,
    platform_uuid: &str,
    full_name: Option<&str>,
    user_uuid: Option<&str>,
    is_host: bool,
) -> QueryResult<Participant> {
    if let Some(existing) = participants::table
        .filter(participants::bot_id.eq(bot_id))
        .filter(participants::uuid.eq(platform_uuid))
        .first::<Participant>(conn)
        .optional()?
    {
        return Ok(existing);
    }
    match diesel::insert_into(participants::table)
        .values(&NewParticipant {
            id: Uuid::new_v4(),
            bot_id,
            uuid: platform_uuid.to_string(),
            user_uuid: user_uuid.map(str::to_string),
            full_name: full_name.map(str::to_string),
            is_the_bot: false,
            is_host,
        })
        .get_result(conn)
    {
        Ok(p) => Ok(p),
        Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            participants::table
                .filter(participants::bot_id.eq(bot_id))
                .filter(participants::uuid.eq(platform_uuid))
                .first(conn)
        }
        Err(e) => Err(e),
    }
}

pub fn record_participant_event(
    conn: &mut PgConnection,
    participant_id: Uuid,
    event_type: ParticipantEventType,
    event_data: Value,
    timestamp_ms: i64,
) -> QueryResult<crate::shared::models::ParticipantEventRow> {
    diesel::insert_into(participant_events::table)
        .values(&NewParticipantEvent {
            id: Uuid::new_v4(),
            object_id: generate_object_id("pe"),
            participant_id,
            event_type: event_type.as_str().to_string(),
            event_data,
            timestamp_ms,
        })
        .get_result(conn)
}

/// Idempotent on the platform message id: replays of the same message are
/// returned, not duplicated.
pub fn record_chat_message(
    conn: &mut PgConnection,
    bot_id: Uuid,
    participant_id: Uuid,
    platform_message_id: Option<&str>,
    text: &str,
    timestamp_ms: i64,
) -> QueryResult<Option<ChatMessageRow>> {
    if let Some(mid) = platform_message_id {
        let existing = chat_messages::table
            .filter(chat_messages::bot_id.eq(bot_id))
            .filter(chat_messages::platform_message_id.eq(mid))
            .first::<ChatMessageRow>(conn)
            .optional()?;
        if existing.is_some() {
            return Ok(None);
        }
    }
    diesel::insert_into(chat_messages::table)
        .values(&NewChatMessage {
            id: Uuid::new_v4(),
            object_id: generate_object_id("msg"),
            bot_id,
            participant_id,
            platform_message_id: platform_message_id.map(str::to_string),
            text: text.to_string(),
            timestamp_ms,
        })
        .get_result(conn)
        .map(Some)
}

pub fn primary_recording(conn: &mut PgConnection, bot_id: Uuid) -> QueryResult<Option<Recording>> {
    recordings::table
        .filter(recordings::bot_id.eq(bot_id))
        .filter(recordings::participant_uuid.is_null())
        .first(conn)
        .optional()
}

pub fn set_recording_state(
    conn: &mut PgConnection,
    recording_id: Uuid,
    state: RecordingState,
) -> QueryResult<Recording> {
    let now = Utc::now();
    diesel::update(recordings::table.filter(recordings::id.eq(recording_id)))
        .set((
            recordings::state.eq(state.as_str()),
            recordings::updated_at.eq(now),
            recordings::started_at.eq(diesel::dsl::sql::<
                diesel::sql_types::Nullable<diesel::sql_types::Timestamptz>,
            >(if state == RecordingState::InProgress {
                "COALESCE(started_at, NOW())"
            } else {
                "started_at"
            })),
        ))
        .get_result(conn)
}

pub fn finalize_recording(
    conn: &mut PgConnection,
    recording_id: Uuid,
    state: RecordingState,
    storage_key: Option<&str>,
    bytes_uploaded: Option<i64>,
    duration_ms: Option<i64>,
) -> QueryResult<Recording> {
    diesel::update(recordings::table.filter(recordings::id.eq(recording_id)))
        .set((
            recordings::state.eq(state.as_str()),
            recordings::storage_key.eq(storage_key),
            recordings::bytes_uploaded.eq(bytes_uploaded),
            recordings::duration_ms.eq(duration_ms),
            recordings::completed_at.eq(Utc::now()),
            recordings::updated_at.eq(Utc::now()),
        ))
        .get_result(conn)
}

pub fn add_dropped_frames(
    conn: &mut PgConnection,
    recording_id: Uuid,
    dropped: i64,
) -> QueryResult<()> {
    diesel::update(recordings::table.filter(recordings::id.eq(recording_id)))
        .set(recordings::frames_dropped.eq(recordings::frames_dropped + dropped))
        .execute(conn)?;
    Ok(())
}

pub fn insert_utterance(conn: &mut PgConnection, row: NewUtterance) -> QueryResult<Utterance> {
    diesel::insert_into(utterances::table)
        .values(&row)
        .get_result(conn)
}

/// Final utterances for a recording in meeting order: relative timestamp,
/// ties broken by participant uuid.
pub fn transcript(conn: &mut PgConnection, recording_id: Uuid) -> QueryResult<Vec<(Utterance, Participant)>> {
    utterances::table
        .inner_join(participants::table)
        .filter(utterances::recording_id.eq(recording_id))
        .filter(utterances::transcript.is_not_null())
        .order((
            utterances::relative_timestamp_ms.asc(),
            participants::uuid.asc(),
        ))
        .load(conn)
}

/// Bots the dispatcher should move from SCHEDULED to READY.
pub fn due_scheduled_bots(
    conn: &mut PgConnection,
    cutoff: DateTime<Utc>,
) -> QueryResult<Vec<Bot>> {
    bots::table
        .filter(bots::state.eq(BotState::Scheduled.as_str()))
        .filter(bots::join_at.le(cutoff))
        .load(conn)
}

/// Claim one READY bot for launch. Uses `FOR UPDATE SKIP LOCKED` so replicas
/// never double-claim; callers run it inside the transaction that also moves
/// the bot to STAGED.
pub fn claim_ready_bot(conn: &mut PgConnection, now: DateTime<Utc>) -> QueryResult<Option<Bot>> {
    bots::table
        .filter(bots::state.eq(BotState::Ready.as_str()))
        .filter(
            bots::next_launch_at
                .is_null()
                .or(bots::next_launch_at.le(now)),
        )
        .order(bots::created_at.asc())
        .for_update()
        .skip_locked()
        .first(conn)
        .optional()
}

pub fn record_launch_backoff(
    conn: &mut PgConnection,
    bot_id: Uuid,
    next_launch_at: DateTime<Utc>,
) -> QueryResult<()> {
    diesel::update(bots::table.filter(bots::id.eq(bot_id)))
        .set((
            bots::launch_attempts.eq(bots::launch_attempts + 1),
            bots::next_launch_at.eq(next_launch_at),
        ))
        .execute(conn)?;
    Ok(())
}

/// Bots whose worker has gone quiet past the heartbeat deadline.
pub fn stale_heartbeat_bots(
    conn: &mut PgConnection,
    deadline: DateTime<Utc>,
) -> QueryResult<Vec<Bot>> {
    let worker_states = [
        BotState::Staged,
        BotState::Joining,
        BotState::JoinedNotRecording,
        BotState::JoinedRecording,
        BotState::Paused,
        BotState::Leaving,
    ]
    .iter()
    .map(|s| s.as_str())
    .collect::<Vec<_>>();
    bots::table
        .filter(bots::state.eq_any(worker_states))
        .filter(
            bots::heartbeat_timestamp
                .le(deadline)
                .or(bots::heartbeat_timestamp
                    .is_null()
                    .and(bots::updated_at.le(deadline))),
        )
        .load(conn)
}

/// Decrypted credential blob for `(project, provider)`, or `None` when the
/// project has no credential of that type.
pub fn fetch_credentials(
    conn: &mut PgConnection,
    project_id: Uuid,
    provider: crate::shared::models::CredentialProvider,
    master_key: &str,
) -> anyhow::Result<Option<Value>> {
    let row: Option<Credential> = credentials::table
        .filter(credentials::project_id.eq(project_id))
        .filter(credentials::provider.eq(provider.as_str()))
        .first(conn)
        .optional()?;
    let Some(row) = row else { return Ok(None) };
    let plaintext = crate::shared::crypto::decrypt_string(master_key, &row.encrypted_data)?;
    Ok(Some(serde_json::from_str(&plaintext)?))
}

/// Runtime for billing: joined -> now (or last heartbeat for dead workers).
pub fn runtime_ms(conn: &mut PgConnection, bot: &Bot) -> QueryResult<Option<i64>> {
    let started = match joined_at(conn, bot.id)? {
        Some(t) => t,
        None => return Ok(None),
    };
    let end = if bot.bot_state() == BotState::FatalError {
        bot.heartbeat_timestamp.unwrap_or_else(Utc::now)
    } else {
        Utc::now()
    };
    let ms = (end - started).num_milliseconds();
    if ms <= 0 {
        warn!(
            "Non-positive runtime for bot {} (joined_at {} end {})",
            bot.object_id, started, end
        );
        return Ok(None);
    }
    Ok(Some(ms))
}
