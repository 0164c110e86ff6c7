use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::adapter::{self, AdapterControls, AdapterEvent, Platform};
use crate::bots::state_machine::{self, sub_states, TransitionEvent};
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::shared::models::{
    Bot, BotSettings, BotState, CredentialProvider, NewUtterance, ParticipantEventType,
    RecordingState, SessionType, UtteranceSource, WebhookTrigger,
};
use crate::shared::state::AppState;
use crate::shared::utils::with_conn;
use crate::transcription::{TranscriptEvent, TranscriptionCoordinator};
use crate::uploader::ArtifactUploader;

pub mod auto_leave;

use auto_leave::AutoLeaveTracker;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const PIPELINE_TICK: Duration = Duration::from_millis(10);
const POLICY_TICK: Duration = Duration::from_secs(1);
/// Hard guard after a leave is initiated: when it expires, post-processing
/// is forced and unflushed transcription sessions are abandoned.
const SHUTDOWN_GUARD: Duration = Duration::from_secs(120);
/// How long to wait for transcription finals during shutdown.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Out-of-band commands published by the API tier over the cache bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WorkerCommand {
    Leave,
    PauseRecording,
    ResumeRecording,
}

pub fn command_channel(bot_id: Uuid) -> String {
    format!("meetserver:bot:{}:commands", bot_id)
}

/// Per-bot worker entry point. Owns the state machine from JOINING onward,
/// the media pipeline, the transcription coordinator, heartbeats and the
/// auto-leave timers. The supervisor loop awaits every subtask; cancellation
/// cascades from the single leave path.
pub async fn run_worker(state: Arc<AppState>, bot_id: Uuid) -> anyhow::Result<()> {
    let bot = with_conn(state.conn.clone(), move |conn| {
        crate::bots::get_bot(conn, bot_id).map_err(Into::into)
    })
    .await?
    .ok_or_else(|| anyhow::anyhow!("bot {} not found", bot_id))?;

    if bot.bot_state() != BotState::Staged {
        // A stale launch: another worker (or the janitor) already owns it.
        warn!(
            "Worker for bot {} exiting: state is {}, not staged",
            bot.object_id, bot.state
        );
        return Ok(());
    }

    let transitioned = with_conn(state.conn.clone(), move |conn| {
        state_machine::try_transition(conn, bot_id, TransitionEvent::WorkerUp, None, json!({}))
            .map_err(Into::into)
    })
    .await?;
    let bot = match transitioned {
        Some(t) => t.bot,
        None => return Ok(()),
    };

    let mut worker = match Worker::init(state.clone(), bot.clone()).await {
        Ok(worker) => worker,
        Err(e) => {
            // Missing credentials and unknown platforms fail here, before
            // anything was captured.
            warn!("Worker setup failed for bot {}: {}", bot.object_id, e);
            fail_bot(&state, bot.id, sub_states::CONFIG_INVALID, &e.to_string()).await;
            return Err(e);
        }
    };

    let result = worker.run().await;
    worker.heartbeat_task.abort();
    if let Some(task) = worker.command_task.take() {
        task.abort();
    }
    result
}

async fn fail_bot(state: &Arc<AppState>, bot_id: Uuid, sub_state: &'static str, detail: &str) {
    let detail = detail.to_string();
    let outcome = with_conn(state.conn.clone(), move |conn| {
        state_machine::try_transition(
            conn,
            bot_id,
            TransitionEvent::FatalError,
            Some(sub_state),
            json!({ "error": detail }),
        )
        .map_err(Into::into)
    })
    .await;
    if let Err(e) = outcome {
        error!("Failed to record fatal error for bot {}: {}", bot_id, e);
    }
}

enum Flow {
    Continue,
    /// Adapter reached a terminal event; run the shutdown sequence.
    Shutdown,
    /// Unrecoverable; run the fatal path with the given sub-state.
    Fatal {
        sub_state: &'static str,
        detail: String,
    },
}

struct Worker {
    state: Arc<AppState>,
    bot: Bot,
    settings: BotSettings,
    pipeline: Option<Pipeline>,
    coordinator: Option<TranscriptionCoordinator>,
    transcript_rx: mpsc::Receiver<TranscriptEvent>,
    controls: Box<dyn AdapterControls>,
    events: mpsc::Receiver<AdapterEvent>,
    commands: mpsc::Receiver<WorkerCommand>,
    uploader: ArtifactUploader,
    tracker: AutoLeaveTracker,
    heartbeat_task: JoinHandle<()>,
    command_task: Option<JoinHandle<()>>,
    started: Instant,
    participant_count: usize,
    /// platform uuid -> participants row id.
    participant_ids: HashMap<String, Uuid>,
    /// RTMS/app-session rows: the platform pushes the stream at us, there is
    /// no participant roster and no leave control, so the auto-leave policy
    /// does not apply. The session ends when the stream stops.
    push_stream: bool,
    recording_id: Option<Uuid>,
    /// Latest interim transcript per participant, for API read-through.
    partials: HashMap<String, String>,
    leaving: bool,
    leave_deadline: Option<Instant>,
}

impl Worker {
    async fn init(state: Arc<AppState>, bot: Bot) -> anyhow::Result<Self> {
        let settings = bot.bot_settings();
        let work_dir = std::env::temp_dir()
            .join("meetserver")
            .join(&bot.object_id);
        let pipeline = Pipeline::new(PipelineConfig::from_settings(&settings, work_dir));

        let master_key = state.config.credentials_encryption_key.clone();
        let project_id = bot.project_id;
        let platform = Platform::for_bot(&bot);
        let (deepgram, platform_creds) = with_conn(state.conn.clone(), move |conn| {
            let deepgram = crate::bots::fetch_credentials(
                conn,
                project_id,
                CredentialProvider::Deepgram,
                &master_key,
            )?;
            let provider = match platform {
                Platform::ZoomNative | Platform::ZoomWeb | Platform::ZoomRtms => {
                    CredentialProvider::ZoomOauth
                }
                Platform::GoogleMeet => CredentialProvider::GoogleLogin,
                Platform::Teams => CredentialProvider::TeamsLogin,
            };
            let platform_creds =
                crate::bots::fetch_credentials(conn, project_id, provider, &master_key)?;
            Ok((deepgram, platform_creds))
        })
        .await?;

        let (transcript_tx, transcript_rx) = mpsc::channel(256);
        let deepgram_key = deepgram
            .as_ref()
            .and_then(|v| v.get("api_key"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let coordinator = TranscriptionCoordinator::new(
            settings.transcription.provider,
            deepgram_key,
            settings.transcription.language.clone(),
            crate::pipeline::mixer::SAMPLE_RATE as u32,
            transcript_tx,
        );

        let mut platform_adapter = adapter::build_adapter(
            &bot,
            &settings,
            platform_creds.unwrap_or_else(|| json!({})),
        )
        .map_err(|e| anyhow::anyhow!("adapter setup failed: {e}"))?;
        let session = platform_adapter.open().await?;

        let heartbeat_task = spawn_heartbeat(state.clone(), bot.id);
        let (commands, command_task) = subscribe_commands(&state, bot.id).await;
        let uploader = ArtifactUploader::new(Arc::clone(&state.storage), state.conn.clone());
        let push_stream =
            bot.session_type() == SessionType::AppSession || platform.is_push_stream();

        Ok(Self {
            tracker: AutoLeaveTracker::new(settings.auto_leave.clone(), 0),
            state,
            bot,
            settings,
            pipeline: Some(pipeline),
            coordinator: Some(coordinator),
            transcript_rx,
            controls: session.controls,
            events: session.events,
            commands,
            uploader,
            heartbeat_task,
            command_task,
            started: Instant::now(),
            participant_count: 0,
            participant_ids: HashMap::new(),
            push_stream,
            recording_id: None,
            partials: HashMap::new(),
            leaving: false,
            leave_deadline: None,
        })
    }

    fn now_ms(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        let mut pipeline_tick = tokio::time::interval(PIPELINE_TICK);
        pipeline_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);
        let mut policy_tick = tokio::time::interval(POLICY_TICK);

        let flow = loop {
            let flow = tokio::select! {
                _ = pipeline_tick.tick() => {
                    if let Some(pipeline) = self.pipeline.as_mut() {
                        if let Err(e) = pipeline.tick().await {
                            break Flow::Fatal {
                                sub_state: sub_states::PIPELINE_FAILURE,
                                detail: format!("pipeline failure: {e}"),
                            };
                        }
                    }
                    Flow::Continue
                }
                _ = policy_tick.tick() => self.on_policy_tick().await?,
                Some(command) = self.commands.recv() => self.on_command(command).await?,
                Some(event) = self.transcript_rx.recv() => {
                    self.on_transcript_event(event).await?;
                    Flow::Continue
                }
                event = self.events.recv() => match event {
                    Some(event) => self.on_adapter_event(event).await?,
                    None => {
                        if self.leaving {
                            Flow::Shutdown
                        } else {
                            Flow::Fatal {
                                sub_state: sub_states::ADAPTER_CRASH,
                                detail: "adapter event stream closed".to_string(),
                            }
                        }
                    }
                },
            };
            match flow {
                Flow::Continue => continue,
                other => break other,
            }
        };

        match flow {
            Flow::Shutdown => self.shutdown().await,
            Flow::Fatal { sub_state, detail } => {
                self.fatal(sub_state, &detail).await;
                Err(anyhow::anyhow!("worker failed: {detail}"))
            }
            Flow::Continue => unreachable!(),
        }
    }

    async fn transition(
        &mut self,
        event: TransitionEvent,
        sub_state: Option<&'static str>,
        metadata: Value,
    ) -> anyhow::Result<bool> {
        let bot_id = self.bot.id;
        let outcome = with_conn(self.state.conn.clone(), move |conn| {
            state_machine::try_transition(conn, bot_id, event, sub_state, metadata)
                .map_err(Into::into)
        })
        .await?;
        if let Some(t) = outcome {
            self.bot = t.bot;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn on_policy_tick(&mut self) -> anyhow::Result<Flow> {
        let now_ms = self.now_ms();
        if let Some(coordinator) = self.coordinator.as_mut() {
            coordinator.close_idle_sessions();
        }

        if self.leaving {
            if let Some(deadline) = self.leave_deadline {
                if Instant::now() >= deadline {
                    warn!(
                        "Shutdown guard expired for bot {}; forcing post-processing",
                        self.bot.object_id
                    );
                    return Ok(Flow::Shutdown);
                }
            }
            return Ok(Flow::Continue);
        }

        // No roster and no leave control on a pushed stream; it runs until
        // the platform stops sending.
        if self.push_stream {
            return Ok(Flow::Continue);
        }

        if let Some(reason) = self.tracker.check(now_ms) {
            info!(
                "Auto-leave ({}) for bot {}",
                reason.sub_state(),
                self.bot.object_id
            );
            self.initiate_leave(reason.sub_state()).await?;
        }
        Ok(Flow::Continue)
    }

    async fn initiate_leave(&mut self, sub_state: &'static str) -> anyhow::Result<()> {
        if self.push_stream {
            info!(
                "Ignoring leave ({}) for app session {}: no leave control",
                sub_state, self.bot.object_id
            );
            return Ok(());
        }
        if self.leaving {
            return Ok(());
        }
        self.leaving = true;
        self.leave_deadline = Some(Instant::now() + SHUTDOWN_GUARD);
        self.transition(TransitionEvent::LeaveRequested, Some(sub_state), json!({}))
            .await?;
        if let Err(e) = self.controls.leave().await {
            // The adapter may already be gone; the event stream closing will
            // move us into shutdown.
            warn!("Leave command failed for bot {}: {}", self.bot.object_id, e);
        }
        Ok(())
    }

    async fn on_command(&mut self, command: WorkerCommand) -> anyhow::Result<Flow> {
        match command {
            WorkerCommand::Leave => {
                self.initiate_leave(sub_states::LEAVE_REQUESTED).await?;
            }
            WorkerCommand::PauseRecording => {
                if self.bot.bot_state() == BotState::JoinedRecording {
                    let _ = self.controls.pause_recording().await;
                    if let Some(p) = self.pipeline.as_mut() {
                        p.pause();
                    }
                    self.transition(TransitionEvent::RecordingPaused, None, json!({}))
                        .await?;
                    self.set_recording_state(RecordingState::Paused).await?;
                }
            }
            WorkerCommand::ResumeRecording => {
                if self.bot.bot_state() == BotState::Paused {
                    let _ = self.controls.resume_recording().await;
                    if let Some(p) = self.pipeline.as_mut() {
                        p.resume();
                    }
                    self.transition(TransitionEvent::RecordingResumed, None, json!({}))
                        .await?;
                    self.set_recording_state(RecordingState::InProgress).await?;
                }
            }
        }
        Ok(Flow::Continue)
    }

    async fn set_recording_state(&mut self, state: RecordingState) -> anyhow::Result<()> {
        let Some(recording_id) = self.recording_id else {
            return Ok(());
        };
        with_conn(self.state.conn.clone(), move |conn| {
            crate::bots::set_recording_state(conn, recording_id, state)?;
            Ok(())
        })
        .await
    }

    async fn on_adapter_event(&mut self, event: AdapterEvent) -> anyhow::Result<Flow> {
        match event {
            AdapterEvent::Admitted => self.on_admitted().await?,
            AdapterEvent::Rejected { reason } => {
                return Ok(Flow::Fatal {
                    sub_state: sub_states::REJECTED,
                    detail: format!("join rejected: {reason}"),
                });
            }
            AdapterEvent::ParticipantJoined {
                uuid,
                full_name,
                user_uuid,
                is_host,
                timestamp_ms,
            } => {
                self.on_participant_joined(&uuid, full_name, user_uuid, is_host, timestamp_ms)
                    .await?;
            }
            AdapterEvent::ParticipantLeft { uuid, timestamp_ms } => {
                self.on_participant_left(&uuid, timestamp_ms).await?;
            }
            AdapterEvent::SpeechStart { uuid, timestamp_ms } => {
                self.tracker.on_speech(self.now_ms());
                self.record_participant_event(
                    &uuid,
                    ParticipantEventType::SpeechStart,
                    timestamp_ms,
                    WebhookTrigger::ParticipantEventsSpeech,
                )
                .await?;
            }
            AdapterEvent::SpeechStop { uuid, timestamp_ms } => {
                self.record_participant_event(
                    &uuid,
                    ParticipantEventType::SpeechStop,
                    timestamp_ms,
                    WebhookTrigger::ParticipantEventsSpeech,
                )
                .await?;
            }
            AdapterEvent::ScreenshareStart { uuid, timestamp_ms } => {
                self.record_participant_event(
                    &uuid,
                    ParticipantEventType::ScreenshareStart,
                    timestamp_ms,
                    WebhookTrigger::ParticipantEventsScreenshare,
                )
                .await?;
            }
            AdapterEvent::ScreenshareStop { uuid, timestamp_ms } => {
                self.record_participant_event(
                    &uuid,
                    ParticipantEventType::ScreenshareStop,
                    timestamp_ms,
                    WebhookTrigger::ParticipantEventsScreenshare,
                )
                .await?;
            }
            AdapterEvent::AudioFrame {
                uuid,
                pcm,
                timestamp_ms,
            } => {
                // Silent frames must not reset the silence auto-leave timer.
                if crate::transcription::normalized_rms(&pcm)
                    >= crate::transcription::SILENCE_RMS_THRESHOLD
                {
                    self.tracker.on_speech(self.now_ms());
                }
                if let Some(pipeline) = self.pipeline.as_mut() {
                    let relative_ms = pipeline.ingest_audio(&uuid, &pcm, timestamp_ms).await?;
                    if let Some(coordinator) = self.coordinator.as_mut() {
                        coordinator.feed(&uuid, pcm, relative_ms);
                    }
                }
            }
            AdapterEvent::VideoFrame {
                uuid,
                width,
                height,
                data,
                timestamp_ms,
            } => {
                if let Some(pipeline) = self.pipeline.as_mut() {
                    pipeline.ingest_video(&uuid, width, height, data, timestamp_ms);
                }
            }
            AdapterEvent::ChatMessage {
                uuid,
                message_id,
                text,
                timestamp_ms,
            } => {
                self.on_chat_message(&uuid, message_id, text, timestamp_ms)
                    .await?;
            }
            AdapterEvent::ClosedCaption {
                uuid,
                text,
                timestamp_ms,
                duration_ms,
            } => {
                self.on_closed_caption(&uuid, text, timestamp_ms, duration_ms)
                    .await?;
            }
            AdapterEvent::DebugScreenshot { png } => {
                if let Err(e) = self.uploader.upload_debug_screenshot(&self.bot, png).await {
                    warn!(
                        "Debug screenshot upload failed for bot {}: {}",
                        self.bot.object_id, e
                    );
                }
            }
            AdapterEvent::MeetingEnded => {
                if !self.leaving {
                    self.leaving = true;
                    self.leave_deadline = Some(Instant::now() + SHUTDOWN_GUARD);
                    self.transition(
                        TransitionEvent::LeaveRequested,
                        Some(sub_states::MEETING_ENDED),
                        json!({}),
                    )
                    .await?;
                }
                return Ok(Flow::Shutdown);
            }
            AdapterEvent::Kicked => {
                if !self.leaving {
                    self.leaving = true;
                    self.leave_deadline = Some(Instant::now() + SHUTDOWN_GUARD);
                    self.transition(
                        TransitionEvent::LeaveRequested,
                        Some(sub_states::KICKED),
                        json!({}),
                    )
                    .await?;
                }
                return Ok(Flow::Shutdown);
            }
            AdapterEvent::FatalError { message } => {
                if self.leaving {
                    // We asked to leave; a dying adapter is close enough to
                    // a clean close to still finalize the artifacts.
                    return Ok(Flow::Shutdown);
                }
                return Ok(Flow::Fatal {
                    sub_state: sub_states::ADAPTER_CRASH,
                    detail: message,
                });
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_admitted(&mut self) -> anyhow::Result<()> {
        let admitted = self
            .transition(TransitionEvent::Admitted, None, json!({}))
            .await?;
        if !admitted {
            return Ok(());
        }
        if !self.push_stream {
            self.tracker.on_admitted(self.now_ms());
        }
        info!("Bot {} admitted to meeting", self.bot.object_id);

        let bot_id = self.bot.id;
        let recording = with_conn(self.state.conn.clone(), move |conn| {
            crate::bots::primary_recording(conn, bot_id).map_err(Into::into)
        })
        .await?;
        self.recording_id = recording.map(|r| r.id);

        if self.settings.auto_record() {
            self.start_recording().await?;
        }
        Ok(())
    }

    async fn start_recording(&mut self) -> anyhow::Result<()> {
        let _ = self.controls.start_recording().await;
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.start_recording().await?;
        }
        self.transition(TransitionEvent::RecordingStarted, None, json!({}))
            .await?;
        self.set_recording_state(RecordingState::InProgress).await?;
        Ok(())
    }

    async fn ensure_participant(
        &mut self,
        uuid: &str,
        full_name: Option<&str>,
        user_uuid: Option<&str>,
        is_host: bool,
    ) -> anyhow::Result<Uuid> {
        if let Some(id) = self.participant_ids.get(uuid) {
            return Ok(*id);
        }
        let bot_id = self.bot.id;
        let uuid_owned = uuid.to_string();
        let full_name_owned = full_name.map(str::to_string);
        let user_uuid_owned = user_uuid.map(str::to_string);
        let participant = with_conn(self.state.conn.clone(), move |conn| {
            crate::bots::ensure_participant(
                conn,
                bot_id,
                &uuid_owned,
                full_name_owned.as_deref(),
                user_uuid_owned.as_deref(),
                is_host,
            )
            .map_err(Into::into)
        })
        .await?;
        self.participant_ids.insert(uuid.to_string(), participant.id);
        Ok(participant.id)
    }

    async fn on_participant_joined(
        &mut self,
        uuid: &str,
        full_name: Option<String>,
        user_uuid: Option<String>,
        is_host: bool,
        timestamp_ms: i64,
    ) -> anyhow::Result<()> {
        self.ensure_participant(uuid, full_name.as_deref(), user_uuid.as_deref(), is_host)
            .await?;
        self.participant_count += 1;
        self.tracker
            .on_participant_count(self.participant_count, self.now_ms());
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.participant_joined(uuid, full_name.as_deref().unwrap_or(uuid));
        }
        self.record_participant_event(
            uuid,
            ParticipantEventType::Join,
            timestamp_ms,
            WebhookTrigger::ParticipantEventsJoinLeave,
        )
        .await
    }

    async fn on_participant_left(&mut self, uuid: &str, timestamp_ms: i64) -> anyhow::Result<()> {
        self.participant_count = self.participant_count.saturating_sub(1);
        self.tracker
            .on_participant_count(self.participant_count, self.now_ms());
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.participant_left(uuid);
        }
        self.record_participant_event(
            uuid,
            ParticipantEventType::Leave,
            timestamp_ms,
            WebhookTrigger::ParticipantEventsJoinLeave,
        )
        .await
    }

    async fn record_participant_event(
        &mut self,
        uuid: &str,
        event_type: ParticipantEventType,
        timestamp_ms: i64,
        trigger: WebhookTrigger,
    ) -> anyhow::Result<()> {
        let participant_id = self.ensure_participant(uuid, None, None, false).await?;
        let bot = self.bot.clone();
        let uuid_owned = uuid.to_string();
        with_conn(self.state.conn.clone(), move |conn| {
            let row = crate::bots::record_participant_event(
                conn,
                participant_id,
                event_type,
                json!({ "participant_uuid": uuid_owned }),
                timestamp_ms,
            )?;
            crate::webhooks::enqueue(
                conn,
                bot.project_id,
                Some(&bot),
                trigger,
                json!({
                    "id": row.object_id,
                    "participant_uuid": uuid_owned,
                    "event_type": event_type.as_str(),
                    "timestamp_ms": timestamp_ms,
                }),
            )?;
            Ok(())
        })
        .await
    }

    async fn on_chat_message(
        &mut self,
        uuid: &str,
        message_id: Option<String>,
        text: String,
        timestamp_ms: i64,
    ) -> anyhow::Result<()> {
        let participant_id = self.ensure_participant(uuid, None, None, false).await?;
        let bot = self.bot.clone();
        let uuid_owned = uuid.to_string();
        with_conn(self.state.conn.clone(), move |conn| {
            let inserted = crate::bots::record_chat_message(
                conn,
                bot.id,
                participant_id,
                message_id.as_deref(),
                &text,
                timestamp_ms,
            )?;
            if let Some(message) = inserted {
                crate::webhooks::enqueue(
                    conn,
                    bot.project_id,
                    Some(&bot),
                    WebhookTrigger::ChatMessagesUpdate,
                    json!({
                        "id": message.object_id,
                        "participant_uuid": uuid_owned,
                        "text": message.text,
                        "timestamp_ms": message.timestamp_ms,
                    }),
                )?;
            }
            Ok(())
        })
        .await
    }

    /// Platform captions are persisted as utterances with the caption
    /// source, so transcripts stay usable when no ASR provider is wired up.
    async fn on_closed_caption(
        &mut self,
        uuid: &str,
        text: String,
        timestamp_ms: i64,
        duration_ms: i64,
    ) -> anyhow::Result<()> {
        let participant_id = self.ensure_participant(uuid, None, None, false).await?;
        let Some(recording_id) = self.recording_id else {
            return Ok(());
        };
        let bot = self.bot.clone();
        let uuid_owned = uuid.to_string();
        with_conn(self.state.conn.clone(), move |conn| {
            let utterance = crate::bots::insert_utterance(
                conn,
                NewUtterance {
                    id: Uuid::new_v4(),
                    recording_id,
                    participant_id,
                    source: UtteranceSource::ClosedCaption.as_str().to_string(),
                    relative_timestamp_ms: timestamp_ms,
                    duration_ms,
                    transcript: Some(text),
                    words: None,
                    failure_data: None,
                },
            )?;
            crate::webhooks::enqueue(
                conn,
                bot.project_id,
                Some(&bot),
                WebhookTrigger::TranscriptUpdate,
                json!({
                    "participant_uuid": uuid_owned,
                    "transcript": utterance.transcript,
                    "relative_timestamp_ms": utterance.relative_timestamp_ms,
                    "duration_ms": utterance.duration_ms,
                    "source": utterance.source,
                }),
            )?;
            Ok(())
        })
        .await
    }

    async fn on_transcript_event(&mut self, event: TranscriptEvent) -> anyhow::Result<()> {
        match event {
            TranscriptEvent::Partial {
                participant_uuid,
                transcript,
            } => {
                self.partials.insert(participant_uuid, transcript);
            }
            TranscriptEvent::Utterance {
                participant_uuid,
                transcript,
                words,
                relative_timestamp_ms,
                duration_ms,
            } => {
                self.partials.remove(&participant_uuid);
                let participant_id = self
                    .ensure_participant(&participant_uuid, None, None, false)
                    .await?;
                let Some(recording_id) = self.recording_id else {
                    return Ok(());
                };
                let bot = self.bot.clone();
                let words_json = serde_json::to_value(
                    words
                        .iter()
                        .map(|w| {
                            json!({
                                "word": w.word,
                                "start_ms": w.start_ms,
                                "end_ms": w.end_ms,
                                "confidence": w.confidence,
                            })
                        })
                        .collect::<Vec<_>>(),
                )?;
                with_conn(self.state.conn.clone(), move |conn| {
                    let utterance = crate::bots::insert_utterance(
                        conn,
                        NewUtterance {
                            id: Uuid::new_v4(),
                            recording_id,
                            participant_id,
                            source: UtteranceSource::PerParticipantAudio.as_str().to_string(),
                            relative_timestamp_ms,
                            duration_ms,
                            transcript: Some(transcript),
                            words: Some(words_json),
                            failure_data: None,
                        },
                    )?;
                    crate::webhooks::enqueue(
                        conn,
                        bot.project_id,
                        Some(&bot),
                        WebhookTrigger::TranscriptUpdate,
                        json!({
                            "participant_uuid": participant_uuid,
                            "transcript": utterance.transcript,
                            "relative_timestamp_ms": utterance.relative_timestamp_ms,
                            "duration_ms": utterance.duration_ms,
                            "words": utterance.words,
                        }),
                    )?;
                    Ok(())
                })
                .await?;
            }
            TranscriptEvent::Failure {
                participant_uuid,
                reason,
                detail,
            } => {
                warn!(
                    "Transcription failure for bot {} participant {}: {:?} ({})",
                    self.bot.object_id, participant_uuid, reason, detail
                );
                let participant_id = self
                    .ensure_participant(&participant_uuid, None, None, false)
                    .await?;
                let Some(recording_id) = self.recording_id else {
                    return Ok(());
                };
                let now_ms = self.now_ms();
                with_conn(self.state.conn.clone(), move |conn| {
                    crate::bots::insert_utterance(
                        conn,
                        NewUtterance {
                            id: Uuid::new_v4(),
                            recording_id,
                            participant_id,
                            source: UtteranceSource::PerParticipantAudio.as_str().to_string(),
                            relative_timestamp_ms: now_ms,
                            duration_ms: 0,
                            transcript: None,
                            words: None,
                            failure_data: Some(json!({
                                "reason": reason,
                                "detail": detail,
                            })),
                        },
                    )?;
                    Ok(())
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Clean teardown: drain the pipeline, flush transcription, upload
    /// artifacts, debit credits through the terminal transition, ENDED.
    async fn shutdown(&mut self) -> anyhow::Result<()> {
        info!("Bot {} shutting down", self.bot.object_id);
        self.transition(TransitionEvent::AdapterClosed, None, json!({}))
            .await?;

        if let Some(coordinator) = self.coordinator.take() {
            if tokio::time::timeout(FLUSH_TIMEOUT, coordinator.flush())
                .await
                .is_err()
            {
                warn!(
                    "Transcription flush timed out for bot {}; abandoning sessions",
                    self.bot.object_id
                );
            }
            // Persist whatever finals arrived during the flush.
            while let Ok(event) = self.transcript_rx.try_recv() {
                self.on_transcript_event(event).await?;
            }
            if !self.partials.is_empty() {
                warn!(
                    "Bot {} lost {} interim transcript(s) that never finalized",
                    self.bot.object_id,
                    self.partials.len()
                );
            }
        }

        let mut duration_ms = 0;
        let mut frames_dropped = 0;
        if let Some(pipeline) = self.pipeline.take() {
            let stats = pipeline.finalize().await?;
            self.uploader.upload_recording(&self.bot, &stats).await?;
            duration_ms = stats.duration_ms;
            frames_dropped = stats.frames_dropped;
        }

        self.transition(
            TransitionEvent::Finalized,
            None,
            json!({ "duration_ms": duration_ms, "frames_dropped": frames_dropped }),
        )
        .await?;
        info!(
            "Bot {} ended ({} ms recorded)",
            self.bot.object_id, duration_ms
        );
        Ok(())
    }

    /// Fatal path: record the error, finalize the recording if any frames
    /// were captured, otherwise tear the pipeline down.
    async fn fatal(&mut self, sub_state: &'static str, detail: &str) {
        error!("Bot {} fatal ({}): {}", self.bot.object_id, sub_state, detail);
        if let Some(coordinator) = self.coordinator.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), coordinator.flush()).await;
        }
        if let Some(pipeline) = self.pipeline.take() {
            match pipeline.finalize().await {
                Ok(stats) if stats.captured_frames => {
                    if let Err(e) = self.uploader.upload_recording(&self.bot, &stats).await {
                        warn!(
                            "Artifact upload failed during fatal teardown of bot {}: {}",
                            self.bot.object_id, e
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(
                    "Pipeline finalize failed during fatal teardown of bot {}: {}",
                    self.bot.object_id, e
                ),
            }
        }
        fail_bot(&self.state, self.bot.id, sub_state, detail).await;
    }
}

fn spawn_heartbeat(state: Arc<AppState>, bot_id: Uuid) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tick.tick().await;
            let outcome = with_conn(state.conn.clone(), move |conn| {
                crate::bots::write_heartbeat(conn, bot_id).map_err(Into::into)
            })
            .await;
            if let Err(e) = outcome {
                warn!("Heartbeat write failed for bot {}: {}", bot_id, e);
            }
        }
    })
}

/// Subscribe to the bot's command channel on the cache bus. Workers without
/// a reachable bus still run; they just cannot be commanded out-of-band.
async fn subscribe_commands(
    state: &Arc<AppState>,
    bot_id: Uuid,
) -> (mpsc::Receiver<WorkerCommand>, Option<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel(16);
    let redis_url = state.config.cache.redis_url.clone();
    let channel = command_channel(bot_id);

    let client = match redis::Client::open(redis_url) {
        Ok(client) => client,
        Err(e) => {
            warn!("Redis client init failed ({}); commands disabled", e);
            return (rx, None);
        }
    };
    let task = tokio::spawn(async move {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                warn!("Redis subscribe failed ({}); commands disabled", e);
                return;
            }
        };
        if let Err(e) = pubsub.subscribe(&channel).await {
            warn!("Redis subscribe to {} failed: {}", channel, e);
            return;
        }
        let mut stream = pubsub.on_message();
        while let Some(message) = stream.next().await {
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(_) => continue,
            };
            match serde_json::from_str::<WorkerCommand>(&payload) {
                Ok(command) => {
                    if tx.send(command).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!("Unparseable worker command {}: {}", payload, e),
            }
        }
    });
    (rx, Some(task))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_channel_embeds_bot_id() {
        let id = Uuid::nil();
        assert_eq!(
            command_channel(id),
            "meetserver:bot:00000000-0000-0000-0000-000000000000:commands"
        );
    }

    #[test]
    fn worker_commands_round_trip_as_json() {
        let line = serde_json::to_string(&WorkerCommand::PauseRecording).unwrap();
        assert_eq!(line, "{\"command\":\"pause_recording\"}");
        assert_eq!(
            serde_json::from_str::<WorkerCommand>("{\"command\":\"leave\"}").unwrap(),
            WorkerCommand::Leave
        );
    }
}
