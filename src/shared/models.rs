use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::shared::schema::{
    bot_events, bots, chat_messages, credentials, debug_screenshots, organizations,
    participant_events, participants, projects, recordings, utterances,
    webhook_delivery_attempts, webhook_subscriptions,
};

/// Lifecycle states of a bot. Terminal states are `Ended` and `FatalError`;
/// the valid transition graph lives in `bots::state_machine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotState {
    Scheduled,
    Ready,
    Staged,
    Joining,
    JoinedNotRecording,
    JoinedRecording,
    Paused,
    Leaving,
    PostProcessing,
    Ended,
    FatalError,
}

impl BotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Ready => "ready",
            Self::Staged => "staged",
            Self::Joining => "joining",
            Self::JoinedNotRecording => "joined_not_recording",
            Self::JoinedRecording => "joined_recording",
            Self::Paused => "paused",
            Self::Leaving => "leaving",
            Self::PostProcessing => "post_processing",
            Self::Ended => "ended",
            Self::FatalError => "fatal_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(Self::Scheduled),
            "ready" => Some(Self::Ready),
            "staged" => Some(Self::Staged),
            "joining" => Some(Self::Joining),
            "joined_not_recording" => Some(Self::JoinedNotRecording),
            "joined_recording" => Some(Self::JoinedRecording),
            "paused" => Some(Self::Paused),
            "leaving" => Some(Self::Leaving),
            "post_processing" => Some(Self::PostProcessing),
            "ended" => Some(Self::Ended),
            "fatal_error" => Some(Self::FatalError),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::FatalError)
    }

    /// States where the worker is expected to be alive and heartbeating.
    pub fn is_worker_owned(&self) -> bool {
        matches!(
            self,
            Self::Joining
                | Self::JoinedNotRecording
                | Self::JoinedRecording
                | Self::Paused
                | Self::Leaving
                | Self::PostProcessing
        )
    }

    pub fn is_joined(&self) -> bool {
        matches!(
            self,
            Self::JoinedNotRecording | Self::JoinedRecording | Self::Paused
        )
    }
}

impl std::fmt::Display for BotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Bot,
    AppSession,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bot => "bot",
            Self::AppSession => "app_session",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bot" => Some(Self::Bot),
            "app_session" => Some(Self::AppSession),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    NotStarted,
    InProgress,
    Paused,
    Complete,
    Failed,
}

impl RecordingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(Self::NotStarted),
            "in_progress" => Some(Self::InProgress),
            "paused" => Some(Self::Paused),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionState {
    NotStarted,
    InProgress,
    Complete,
    Failed,
}

impl TranscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingType {
    AudioAndVideo,
    AudioOnly,
    NoRecording,
}

impl RecordingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AudioAndVideo => "audio_and_video",
            Self::AudioOnly => "audio_only",
            Self::NoRecording => "no_recording",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "audio_and_video" => Some(Self::AudioAndVideo),
            "audio_only" => Some(Self::AudioOnly),
            "no_recording" => Some(Self::NoRecording),
            _ => None,
        }
    }
}

impl Default for RecordingType {
    fn default() -> Self {
        Self::AudioAndVideo
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingFormat {
    Mp4,
    Mp3,
    Webm,
}

impl RecordingFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mp3 => "mp3",
            Self::Webm => "webm",
        }
    }
}

impl Default for RecordingFormat {
    fn default() -> Self {
        Self::Mp4
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantEventType {
    Join,
    Leave,
    SpeechStart,
    SpeechStop,
    ScreenshareStart,
    ScreenshareStop,
}

impl ParticipantEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::SpeechStart => "speech_start",
            Self::SpeechStop => "speech_stop",
            Self::ScreenshareStart => "screenshare_start",
            Self::ScreenshareStop => "screenshare_stop",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtteranceSource {
    PerParticipantAudio,
    ClosedCaption,
}

impl UtteranceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerParticipantAudio => "per_participant_audio",
            Self::ClosedCaption => "closed_caption",
        }
    }
}

/// Named event classes subscribable via webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookTrigger {
    #[serde(rename = "bot.state_change")]
    BotStateChange,
    #[serde(rename = "transcript.update")]
    TranscriptUpdate,
    #[serde(rename = "chat_messages.update")]
    ChatMessagesUpdate,
    #[serde(rename = "participant_events.join_leave")]
    ParticipantEventsJoinLeave,
    #[serde(rename = "participant_events.speech")]
    ParticipantEventsSpeech,
    #[serde(rename = "participant_events.screenshare")]
    ParticipantEventsScreenshare,
    #[serde(rename = "organization.credits_low")]
    OrganizationCreditsLow,
}

impl WebhookTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BotStateChange => "bot.state_change",
            Self::TranscriptUpdate => "transcript.update",
            Self::ChatMessagesUpdate => "chat_messages.update",
            Self::ParticipantEventsJoinLeave => "participant_events.join_leave",
            Self::ParticipantEventsSpeech => "participant_events.speech",
            Self::ParticipantEventsScreenshare => "participant_events.screenshare",
            Self::OrganizationCreditsLow => "organization.credits_low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bot.state_change" => Some(Self::BotStateChange),
            "transcript.update" => Some(Self::TranscriptUpdate),
            "chat_messages.update" => Some(Self::ChatMessagesUpdate),
            "participant_events.join_leave" => Some(Self::ParticipantEventsJoinLeave),
            "participant_events.speech" => Some(Self::ParticipantEventsSpeech),
            "participant_events.screenshare" => Some(Self::ParticipantEventsScreenshare),
            "organization.credits_low" => Some(Self::OrganizationCreditsLow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failure,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialProvider {
    ZoomOauth,
    Deepgram,
    GoogleLogin,
    TeamsLogin,
}

impl CredentialProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ZoomOauth => "zoom_oauth",
            Self::Deepgram => "deepgram",
            Self::GoogleLogin => "google_login",
            Self::TeamsLogin => "teams_login",
        }
    }
}

/// Why a transcription session failed. Only the retryable subset may cause a
/// session reopen on next speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionFailureReason {
    CredentialsNotFound,
    CredentialsInvalid,
    AudioUploadFailed,
    TranscriptionRequestFailed,
    TimedOut,
    RateLimitExceeded,
    DroppedAudio,
    InternalError,
}

impl TranscriptionFailureReason {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AudioUploadFailed
                | Self::TranscriptionRequestFailed
                | Self::TimedOut
                | Self::RateLimitExceeded
                | Self::InternalError
        )
    }
}

/// One transcribed word with meeting-relative timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptWord {
    pub word: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewLayout {
    SpeakerView,
    GalleryView,
}

impl Default for ViewLayout {
    fn default() -> Self {
        Self::SpeakerView
    }
}

fn default_only_participant_timeout() -> u64 {
    60
}
fn default_silence_timeout() -> u64 {
    600
}
fn default_max_duration() -> u64 {
    4 * 3600
}
fn default_waiting_room_timeout() -> u64 {
    900
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoLeaveSettings {
    #[serde(default = "default_only_participant_timeout")]
    pub only_participant_timeout_seconds: u64,
    #[serde(default = "default_silence_timeout")]
    pub silence_timeout_seconds: u64,
    #[serde(default = "default_max_duration")]
    pub max_duration_seconds: u64,
    #[serde(default = "default_waiting_room_timeout")]
    pub waiting_room_timeout_seconds: u64,
}

impl Default for AutoLeaveSettings {
    fn default() -> Self {
        Self {
            only_participant_timeout_seconds: default_only_participant_timeout(),
            silence_timeout_seconds: default_silence_timeout(),
            max_duration_seconds: default_max_duration(),
            waiting_room_timeout_seconds: default_waiting_room_timeout(),
        }
    }
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionSettings {
    #[serde(default)]
    pub provider: TranscriptionProviderKind,
    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for TranscriptionSettings {
    fn default() -> Self {
        Self {
            provider: TranscriptionProviderKind::default(),
            language: default_language(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionProviderKind {
    Deepgram,
    None,
}

impl Default for TranscriptionProviderKind {
    fn default() -> Self {
        Self::Deepgram
    }
}

/// Per-bot settings stored in the `bots.settings` jsonb column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotSettings {
    #[serde(default)]
    pub recording_type: RecordingType,
    #[serde(default)]
    pub recording_format: RecordingFormat,
    #[serde(default)]
    pub view_layout: ViewLayout,
    #[serde(default)]
    pub auto_record: Option<bool>,
    #[serde(default)]
    pub per_participant_audio: bool,
    /// Join Zoom through the web client instead of the native SDK.
    #[serde(default)]
    pub use_web_adapter: bool,
    #[serde(default)]
    pub auto_leave: AutoLeaveSettings,
    #[serde(default)]
    pub transcription: TranscriptionSettings,
    /// Legacy alias: overrides the computed storage key when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl BotSettings {
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn auto_record(&self) -> bool {
        self.auto_record.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = organizations)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub credits: BigDecimal,
    pub allow_negative_credits: bool,
    pub credits_low_threshold: BigDecimal,
    pub credits_low_notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = projects)]
pub struct Project {
    pub id: Uuid,
    pub object_id: String,
    pub organization_id: Uuid,
    pub name: String,
    #[serde(skip_serializing)]
    pub api_token_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = credentials)]
pub struct Credential {
    pub id: Uuid,
    pub project_id: Uuid,
    pub provider: String,
    pub encrypted_data: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = bots)]
pub struct Bot {
    pub id: Uuid,
    pub object_id: String,
    pub project_id: Uuid,
    pub session_type: String,
    pub meeting_url: String,
    pub name: String,
    pub state: String,
    pub sub_state: Option<String>,
    pub join_at: Option<DateTime<Utc>>,
    pub deduplication_key: Option<String>,
    pub settings: Value,
    pub metadata: Value,
    pub heartbeat_timestamp: Option<DateTime<Utc>>,
    pub first_heartbeat_timestamp: Option<DateTime<Utc>>,
    pub launch_attempts: i32,
    pub next_launch_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bot {
    pub fn bot_state(&self) -> BotState {
        BotState::parse(&self.state).unwrap_or(BotState::FatalError)
    }

    pub fn bot_settings(&self) -> BotSettings {
        BotSettings::from_value(&self.settings)
    }

    pub fn session_type(&self) -> SessionType {
        SessionType::parse(&self.session_type).unwrap_or(SessionType::Bot)
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = bots)]
pub struct NewBot {
    pub id: Uuid,
    pub object_id: String,
    pub project_id: Uuid,
    pub session_type: String,
    pub meeting_url: String,
    pub name: String,
    pub state: String,
    pub sub_state: Option<String>,
    pub join_at: Option<DateTime<Utc>>,
    pub deduplication_key: Option<String>,
    pub settings: Value,
    pub metadata: Value,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = bot_events)]
pub struct BotEvent {
    pub id: Uuid,
    pub object_id: String,
    pub bot_id: Uuid,
    pub old_state: String,
    pub new_state: String,
    pub event_type: String,
    pub event_sub_type: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = bot_events)]
pub struct NewBotEvent {
    pub id: Uuid,
    pub object_id: String,
    pub bot_id: Uuid,
    pub old_state: String,
    pub new_state: String,
    pub event_type: String,
    pub event_sub_type: Option<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = recordings)]
pub struct Recording {
    pub id: Uuid,
    pub object_id: String,
    pub bot_id: Uuid,
    pub state: String,
    pub transcription_state: String,
    pub recording_type: String,
    pub participant_uuid: Option<String>,
    pub storage_key: Option<String>,
    pub bytes_uploaded: Option<i64>,
    pub duration_ms: Option<i64>,
    pub frames_dropped: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Recording {
    pub fn recording_state(&self) -> RecordingState {
        RecordingState::parse(&self.state).unwrap_or(RecordingState::Failed)
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = recordings)]
pub struct NewRecording {
    pub id: Uuid,
    pub object_id: String,
    pub bot_id: Uuid,
    pub state: String,
    pub transcription_state: String,
    pub recording_type: String,
    pub participant_uuid: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = participants)]
pub struct Participant {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub uuid: String,
    pub user_uuid: Option<String>,
    pub full_name: Option<String>,
    pub is_the_bot: bool,
    pub is_host: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = participants)]
pub struct NewParticipant {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub uuid: String,
    pub user_uuid: Option<String>,
    pub full_name: Option<String>,
    pub is_the_bot: bool,
    pub is_host: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = participant_events)]
pub struct ParticipantEventRow {
    pub id: Uuid,
    pub object_id: String,
    pub participant_id: Uuid,
    pub event_type: String,
    pub event_data: Value,
    pub timestamp_ms: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = participant_events)]
pub struct NewParticipantEvent {
    pub id: Uuid,
    pub object_id: String,
    pub participant_id: Uuid,
    pub event_type: String,
    pub event_data: Value,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = utterances)]
pub struct Utterance {
    pub id: Uuid,
    pub recording_id: Uuid,
    pub participant_id: Uuid,
    pub source: String,
    pub relative_timestamp_ms: i64,
    pub duration_ms: i64,
    pub transcript: Option<String>,
    pub words: Option<Value>,
    pub failure_data: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = utterances)]
pub struct NewUtterance {
    pub id: Uuid,
    pub recording_id: Uuid,
    pub participant_id: Uuid,
    pub source: String,
    pub relative_timestamp_ms: i64,
    pub duration_ms: i64,
    pub transcript: Option<String>,
    pub words: Option<Value>,
    pub failure_data: Option<Value>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = chat_messages)]
pub struct ChatMessageRow {
    pub id: Uuid,
    pub object_id: String,
    pub bot_id: Uuid,
    pub participant_id: Uuid,
    pub platform_message_id: Option<String>,
    pub text: String,
    pub timestamp_ms: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = chat_messages)]
pub struct NewChatMessage {
    pub id: Uuid,
    pub object_id: String,
    pub bot_id: Uuid,
    pub participant_id: Uuid,
    pub platform_message_id: Option<String>,
    pub text: String,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = webhook_subscriptions)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub object_id: String,
    pub project_id: Uuid,
    pub url: String,
    pub triggers: Value,
    #[serde(skip_serializing)]
    pub secret: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn trigger_list(&self) -> Vec<WebhookTrigger> {
        self.triggers
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().and_then(WebhookTrigger::parse))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = webhook_subscriptions)]
pub struct NewWebhookSubscription {
    pub id: Uuid,
    pub object_id: String,
    pub project_id: Uuid,
    pub url: String,
    pub triggers: Value,
    pub secret: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = webhook_delivery_attempts)]
pub struct WebhookDeliveryAttempt {
    pub id: Uuid,
    pub object_id: String,
    pub subscription_id: Uuid,
    pub bot_id: Option<Uuid>,
    pub trigger_type: String,
    pub idempotency_key: Uuid,
    pub payload: Value,
    pub status: String,
    pub attempt_count: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub response_body_list: Value,
    pub succeeded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = webhook_delivery_attempts)]
pub struct NewWebhookDeliveryAttempt {
    pub id: Uuid,
    pub object_id: String,
    pub subscription_id: Uuid,
    pub bot_id: Option<Uuid>,
    pub trigger_type: String,
    pub idempotency_key: Uuid,
    pub payload: Value,
    pub status: String,
    pub attempt_count: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub response_body_list: Value,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = debug_screenshots)]
pub struct DebugScreenshot {
    pub id: Uuid,
    pub object_id: String,
    pub bot_id: Uuid,
    pub storage_key: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = debug_screenshots)]
pub struct NewDebugScreenshot {
    pub id: Uuid,
    pub object_id: String,
    pub bot_id: Uuid,
    pub storage_key: Option<String>,
    pub metadata: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_state_round_trips_through_str() {
        for state in [
            BotState::Scheduled,
            BotState::Ready,
            BotState::Staged,
            BotState::Joining,
            BotState::JoinedNotRecording,
            BotState::JoinedRecording,
            BotState::Paused,
            BotState::Leaving,
            BotState::PostProcessing,
            BotState::Ended,
            BotState::FatalError,
        ] {
            assert_eq!(BotState::parse(state.as_str()), Some(state));
        }
        assert_eq!(BotState::parse("bogus"), None);
    }

    #[test]
    fn settings_defaults_apply_on_empty_json() {
        let settings = BotSettings::from_value(&serde_json::json!({}));
        assert_eq!(settings.recording_format, RecordingFormat::Mp4);
        assert_eq!(settings.auto_leave.only_participant_timeout_seconds, 60);
        assert_eq!(settings.auto_leave.silence_timeout_seconds, 600);
        assert!(settings.auto_record());
    }

    #[test]
    fn trigger_parse_matches_wire_names() {
        assert_eq!(
            WebhookTrigger::parse("bot.state_change"),
            Some(WebhookTrigger::BotStateChange)
        );
        assert_eq!(
            serde_json::to_string(&WebhookTrigger::TranscriptUpdate).unwrap(),
            "\"transcript.update\""
        );
    }
}
