use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::adapter::Platform;
use crate::bots::CreateBotRequest;
use crate::controller::{command_channel, WorkerCommand};
use crate::shared::models::{
    Bot, NewWebhookSubscription, Project, SessionType, WebhookTrigger,
};
use crate::shared::schema::{
    chat_messages, debug_screenshots, participant_events, participants, projects,
    webhook_delivery_attempts, webhook_subscriptions,
};
use crate::shared::state::AppState;
use crate::shared::utils::{generate_object_id, sha256_hex, with_conn};
use crate::storage::BlobStorage;

type ApiError = (StatusCode, Json<Value>);

fn error_response(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn internal_error<E: std::fmt::Display>(e: E) -> ApiError {
    warn!("API internal error: {}", e);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

/// Thin JSON translation layer over the core. All routes are project-scoped
/// through bearer-token auth.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/bots", post(create_bot).get(list_bots))
        .route("/bots/:object_id", get(get_bot))
        .route("/bots/:object_id/leave", post(leave_bot))
        .route("/bots/:object_id/pause_recording", post(pause_recording))
        .route("/bots/:object_id/resume_recording", post(resume_recording))
        .route("/bots/:object_id/transcript", get(get_transcript))
        .route("/bots/:object_id/participant_events", get(list_participant_events))
        .route("/bots/:object_id/chat_messages", get(list_chat_messages))
        .route("/bots/:object_id/recording_url", get(recording_url))
        .route("/bots/:object_id/debug_screenshots", get(list_debug_screenshots))
        .route(
            "/bots/:object_id/webhook_delivery_attempts",
            get(list_delivery_attempts),
        )
        .route(
            "/webhook_subscriptions",
            post(create_subscription).get(list_subscriptions),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolve the project from the bearer token before any handler runs.
async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut request: axum::extract::Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "missing bearer token"))?;

    let token_hash = sha256_hex(&token);
    let project: Option<Project> = with_conn(state.conn.clone(), move |conn| {
        projects::table
            .filter(projects::api_token_hash.eq(token_hash))
            .first(conn)
            .optional()
            .map_err(Into::into)
    })
    .await
    .map_err(internal_error)?;

    let project =
        project.ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "invalid token"))?;
    request.extensions_mut().insert(project);
    Ok(next.run(request).await)
}

#[derive(Serialize)]
struct BotResponse {
    id: String,
    meeting_url: String,
    name: String,
    state: String,
    sub_state: Option<String>,
    session_type: String,
    join_at: Option<DateTime<Utc>>,
    settings: Value,
    metadata: Value,
    created_at: DateTime<Utc>,
}

impl From<&Bot> for BotResponse {
    fn from(bot: &Bot) -> Self {
        Self {
            id: bot.object_id.clone(),
            meeting_url: bot.meeting_url.clone(),
            name: bot.name.clone(),
            state: bot.state.clone(),
            sub_state: bot.sub_state.clone(),
            session_type: bot.session_type.clone(),
            join_at: bot.join_at,
            settings: bot.settings.clone(),
            metadata: bot.metadata.clone(),
            created_at: bot.created_at,
        }
    }
}

async fn create_bot(
    State(state): State<Arc<AppState>>,
    Extension(project): Extension<Project>,
    Json(request): Json<CreateBotRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.meeting_url.is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "meeting_url is required"));
    }
    let (bot, created) = with_conn(state.conn.clone(), move |conn| {
        crate::bots::create_bot(conn, project.id, &request)
    })
    .await
    .map_err(internal_error)?;

    info!(
        "Bot {} {} via API",
        bot.object_id,
        if created { "created" } else { "deduplicated" }
    );
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(BotResponse::from(&bot))))
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    limit: Option<i64>,
}

async fn list_bots(
    State(state): State<Arc<AppState>>,
    Extension(project): Extension<Project>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<BotResponse>>, ApiError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let bots = with_conn(state.conn.clone(), move |conn| {
        crate::bots::list_bots(conn, project.id, limit).map_err(Into::into)
    })
    .await
    .map_err(internal_error)?;
    Ok(Json(bots.iter().map(BotResponse::from).collect()))
}

async fn load_bot(
    state: &Arc<AppState>,
    project_id: Uuid,
    object_id: String,
) -> Result<Bot, ApiError> {
    with_conn(state.conn.clone(), move |conn| {
        crate::bots::get_bot_by_object_id(conn, project_id, &object_id).map_err(Into::into)
    })
    .await
    .map_err(internal_error)?
    .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "bot not found"))
}

async fn get_bot(
    State(state): State<Arc<AppState>>,
    Extension(project): Extension<Project>,
    Path(object_id): Path<String>,
) -> Result<Json<BotResponse>, ApiError> {
    let bot = load_bot(&state, project.id, object_id).await?;
    Ok(Json(BotResponse::from(&bot)))
}

/// Publish a command to the bot's worker. State changes remain the worker's
/// job; the API only asks.
async fn publish_command(
    state: &Arc<AppState>,
    bot: &Bot,
    command: WorkerCommand,
) -> Result<(), ApiError> {
    let client = state.cache.as_ref().ok_or_else(|| {
        error_response(StatusCode::SERVICE_UNAVAILABLE, "command bus unavailable")
    })?;
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(internal_error)?;
    let payload = serde_json::to_string(&command).map_err(internal_error)?;
    redis::cmd("PUBLISH")
        .arg(command_channel(bot.id))
        .arg(payload)
        .query_async::<()>(&mut conn)
        .await
        .map_err(internal_error)?;
    Ok(())
}

async fn leave_bot(
    State(state): State<Arc<AppState>>,
    Extension(project): Extension<Project>,
    Path(object_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let bot = load_bot(&state, project.id, object_id).await?;
    if bot.bot_state().is_terminal() {
        return Err(error_response(StatusCode::CONFLICT, "bot already ended"));
    }
    // App sessions consume a platform-pushed stream; there is no participant
    // to remove and no leave control to invoke.
    if bot.session_type() == SessionType::AppSession || Platform::for_bot(&bot).is_push_stream() {
        return Err(error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "app sessions have no leave control",
        ));
    }
    publish_command(&state, &bot, WorkerCommand::Leave).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn pause_recording(
    State(state): State<Arc<AppState>>,
    Extension(project): Extension<Project>,
    Path(object_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let bot = load_bot(&state, project.id, object_id).await?;
    publish_command(&state, &bot, WorkerCommand::PauseRecording).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn resume_recording(
    State(state): State<Arc<AppState>>,
    Extension(project): Extension<Project>,
    Path(object_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let bot = load_bot(&state, project.id, object_id).await?;
    publish_command(&state, &bot, WorkerCommand::ResumeRecording).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn get_transcript(
    State(state): State<Arc<AppState>>,
    Extension(project): Extension<Project>,
    Path(object_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let bot = load_bot(&state, project.id, object_id).await?;
    let bot_id = bot.id;
    let utterances = with_conn(state.conn.clone(), move |conn| {
        let recording = match crate::bots::primary_recording(conn, bot_id)? {
            Some(recording) => recording,
            None => return Ok(Vec::new()),
        };
        crate::bots::transcript(conn, recording.id).map_err(Into::into)
    })
    .await
    .map_err(internal_error)?;

    let entries: Vec<Value> = utterances
        .iter()
        .map(|(utterance, participant)| {
            json!({
                "participant_uuid": participant.uuid,
                "participant_name": participant.full_name,
                "relative_timestamp_ms": utterance.relative_timestamp_ms,
                "duration_ms": utterance.duration_ms,
                "transcript": utterance.transcript,
                "words": utterance.words,
            })
        })
        .collect();
    Ok(Json(json!({ "transcript": entries })))
}

async fn list_participant_events(
    State(state): State<Arc<AppState>>,
    Extension(project): Extension<Project>,
    Path(object_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let bot = load_bot(&state, project.id, object_id).await?;
    let bot_id = bot.id;
    let events: Vec<(crate::shared::models::ParticipantEventRow, String)> =
        with_conn(state.conn.clone(), move |conn| {
            participant_events::table
                .inner_join(participants::table)
                .filter(participants::bot_id.eq(bot_id))
                .order(participant_events::timestamp_ms.asc())
                .select((
                    participant_events::all_columns,
                    participants::uuid,
                ))
                .load(conn)
                .map_err(Into::into)
        })
        .await
        .map_err(internal_error)?;

    let entries: Vec<Value> = events
        .iter()
        .map(|(event, participant_uuid)| {
            json!({
                "id": event.object_id,
                "participant_uuid": participant_uuid,
                "event_type": event.event_type,
                "event_data": event.event_data,
                "timestamp_ms": event.timestamp_ms,
            })
        })
        .collect();
    Ok(Json(json!({ "events": entries })))
}

async fn list_chat_messages(
    State(state): State<Arc<AppState>>,
    Extension(project): Extension<Project>,
    Path(object_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let bot = load_bot(&state, project.id, object_id).await?;
    let bot_id = bot.id;
    let messages: Vec<(crate::shared::models::ChatMessageRow, String)> =
        with_conn(state.conn.clone(), move |conn| {
            chat_messages::table
                .inner_join(participants::table)
                .filter(chat_messages::bot_id.eq(bot_id))
                .order(chat_messages::timestamp_ms.asc())
                .select((chat_messages::all_columns, participants::uuid))
                .load(conn)
                .map_err(Into::into)
        })
        .await
        .map_err(internal_error)?;

    let entries: Vec<Value> = messages
        .iter()
        .map(|(message, participant_uuid)| {
            json!({
                "id": message.object_id,
                "participant_uuid": participant_uuid,
                "text": message.text,
                "timestamp_ms": message.timestamp_ms,
            })
        })
        .collect();
    Ok(Json(json!({ "messages": entries })))
}

#[derive(Deserialize)]
struct RecordingUrlQuery {
    #[serde(default)]
    ttl_seconds: Option<u64>,
}

async fn recording_url(
    State(state): State<Arc<AppState>>,
    Extension(project): Extension<Project>,
    Path(object_id): Path<String>,
    Query(query): Query<RecordingUrlQuery>,
) -> Result<Json<Value>, ApiError> {
    let bot = load_bot(&state, project.id, object_id).await?;
    let bot_id = bot.id;
    let recording = with_conn(state.conn.clone(), move |conn| {
        crate::bots::primary_recording(conn, bot_id).map_err(Into::into)
    })
    .await
    .map_err(internal_error)?
    .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "no recording"))?;

    let key = recording
        .storage_key
        .ok_or_else(|| error_response(StatusCode::CONFLICT, "recording not uploaded"))?;
    let ttl = Duration::from_secs(query.ttl_seconds.unwrap_or(3600).clamp(60, 86_400));
    let url = state
        .storage
        .signed_url(&key, ttl)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({ "url": url, "expires_in_seconds": ttl.as_secs() })))
}

async fn list_debug_screenshots(
    State(state): State<Arc<AppState>>,
    Extension(project): Extension<Project>,
    Path(object_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let bot = load_bot(&state, project.id, object_id).await?;
    let bot_id = bot.id;
    let screenshots: Vec<crate::shared::models::DebugScreenshot> =
        with_conn(state.conn.clone(), move |conn| {
            debug_screenshots::table
                .filter(debug_screenshots::bot_id.eq(bot_id))
                .order(debug_screenshots::created_at.asc())
                .load(conn)
                .map_err(Into::into)
        })
        .await
        .map_err(internal_error)?;

    let mut entries = Vec::with_capacity(screenshots.len());
    for shot in &screenshots {
        let url = match &shot.storage_key {
            Some(key) => state
                .storage
                .signed_url(key, Duration::from_secs(3600))
                .await
                .ok(),
            None => None,
        };
        entries.push(json!({
            "id": shot.object_id,
            "created_at": shot.created_at,
            "url": url,
        }));
    }
    Ok(Json(json!({ "screenshots": entries })))
}

#[derive(Deserialize)]
struct CreateSubscriptionRequest {
    url: String,
    triggers: Vec<String>,
    #[serde(default)]
    secret: Option<String>,
}

async fn create_subscription(
    State(state): State<Arc<AppState>>,
    Extension(project): Extension<Project>,
    Json(request): Json<CreateSubscriptionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !request.url.starts_with("https://") && !request.url.starts_with("http://") {
        return Err(error_response(StatusCode::BAD_REQUEST, "url must be http(s)"));
    }
    for trigger in &request.triggers {
        if WebhookTrigger::parse(trigger).is_none() {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                format!("unknown trigger: {trigger}"),
            ));
        }
    }
    let secret = request
        .secret
        .unwrap_or_else(|| generate_object_id("whsec"));

    let row = NewWebhookSubscription {
        id: Uuid::new_v4(),
        object_id: generate_object_id("sub"),
        project_id: project.id,
        url: request.url,
        triggers: json!(request.triggers),
        secret: secret.clone(),
        is_active: true,
    };
    let subscription = with_conn(state.conn.clone(), move |conn| {
        diesel::insert_into(webhook_subscriptions::table)
            .values(&row)
            .get_result::<crate::shared::models::WebhookSubscription>(conn)
            .map_err(Into::into)
    })
    .await
    .map_err(internal_error)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": subscription.object_id,
            "url": subscription.url,
            "triggers": subscription.triggers,
            // The secret is shown once, at creation.
            "secret": secret,
        })),
    ))
}

async fn list_subscriptions(
    State(state): State<Arc<AppState>>,
    Extension(project): Extension<Project>,
) -> Result<Json<Value>, ApiError> {
    let subs: Vec<crate::shared::models::WebhookSubscription> =
        with_conn(state.conn.clone(), move |conn| {
            webhook_subscriptions::table
                .filter(webhook_subscriptions::project_id.eq(project.id))
                .order(webhook_subscriptions::created_at.desc())
                .load(conn)
                .map_err(Into::into)
        })
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({ "subscriptions": subs })))
}

async fn list_delivery_attempts(
    State(state): State<Arc<AppState>>,
    Extension(project): Extension<Project>,
    Path(object_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let bot = load_bot(&state, project.id, object_id).await?;
    let bot_id = bot.id;
    let attempts: Vec<crate::shared::models::WebhookDeliveryAttempt> =
        with_conn(state.conn.clone(), move |conn| {
            webhook_delivery_attempts::table
                .filter(webhook_delivery_attempts::bot_id.eq(bot_id))
                .order(webhook_delivery_attempts::created_at.desc())
                .load(conn)
                .map_err(Into::into)
        })
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({ "delivery_attempts": attempts })))
}

/// Serve the API until the process is stopped.
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API listening on {}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
