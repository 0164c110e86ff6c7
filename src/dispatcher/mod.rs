use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use diesel::prelude::*;
use diesel::sql_types::Integer;
use log::{error, info, warn};
use serde_json::json;

use crate::bots::state_machine::{self, sub_states, TransitionEvent};
use crate::billing;
use crate::launcher::{build_launcher, LaunchError, Launcher};
use crate::shared::models::Bot;
use crate::shared::state::AppState;
use crate::shared::utils::{establish_pg_connection, with_conn};

/// Advisory lock namespace for dispatcher leader election.
const DISPATCHER_LOCK_CLASS: i32 = 0x6d65;

#[derive(QueryableByName)]
struct LockRow {
    #[diesel(sql_type = diesel::sql_types::Bool)]
    acquired: bool,
}

/// Single-writer scheduler. Safe to run on every replica: a per-shard
/// advisory lock elects one leader, and all row claims use
/// `FOR UPDATE SKIP LOCKED`, so a replica that wins a tick anyway cannot
/// double-launch.
pub async fn run_dispatcher(state: Arc<AppState>) -> anyhow::Result<()> {
    let launcher = build_launcher(&state.config.launcher);
    // The advisory lock is session-scoped, so it lives on a dedicated
    // connection held for the dispatcher's lifetime.
    let mut lock_conn = tokio::task::spawn_blocking(establish_pg_connection).await??;
    let shard = state.config.dispatcher.shard;

    info!("Dispatcher starting (shard {})", shard);
    let mut tick = tokio::time::interval(state.config.dispatcher.tick);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;

        let acquired: bool = {
            let result: QueryResult<LockRow> = diesel::sql_query(
                "SELECT pg_try_advisory_lock($1, $2) AS acquired",
            )
            .bind::<Integer, _>(DISPATCHER_LOCK_CLASS)
            .bind::<Integer, _>(shard as i32)
            .get_result(&mut lock_conn);
            match result {
                Ok(row) => row.acquired,
                Err(e) => {
                    error!("Dispatcher lock query failed: {}", e);
                    false
                }
            }
        };
        if !acquired {
            continue;
        }

        if let Err(e) = run_tick(&state, launcher.as_ref()).await {
            // A failed tick delays launches but never drops them; the next
            // tick replays the same idempotent queries.
            error!("Dispatcher tick failed: {}", e);
        }
    }
}

pub async fn run_tick(state: &Arc<AppState>, launcher: &dyn Launcher) -> anyhow::Result<()> {
    promote_scheduled(state).await?;
    launch_ready(state, launcher).await?;
    sweep_stale_heartbeats(state).await?;
    Ok(())
}

/// SCHEDULED bots whose join time minus pre-roll has arrived become READY.
async fn promote_scheduled(state: &Arc<AppState>) -> anyhow::Result<()> {
    let pre_roll = ChronoDuration::from_std(state.config.dispatcher.pre_roll)?;
    with_conn(state.conn.clone(), move |conn| {
        let cutoff = Utc::now() + pre_roll;
        for bot in crate::bots::due_scheduled_bots(conn, cutoff)? {
            state_machine::try_transition(
                conn,
                bot.id,
                TransitionEvent::JoinAtReached,
                None,
                json!({}),
            )?;
        }
        Ok(())
    })
    .await
}

/// Claim READY bots one at a time, stage them, and hand them to the
/// launcher. Capacity refusals back off in READY; spawn failures are fatal
/// to the bot, never to the dispatcher.
async fn launch_ready(state: &Arc<AppState>, launcher: &dyn Launcher) -> anyhow::Result<()> {
    loop {
        let staged = claim_and_stage(state).await?;
        let Some(bot) = staged else { break };

        match launcher.launch(&bot).await {
            Ok(handle) => {
                info!(
                    "Bot {} staged on worker {}",
                    bot.object_id, handle.worker_id
                );
            }
            Err(LaunchError::Capacity(detail)) => {
                handle_capacity_refusal(state, &bot, &detail).await?;
            }
            Err(LaunchError::Spawn(detail)) => {
                warn!("Spawn failed for bot {}: {}", bot.object_id, detail);
                let pool = state.conn.clone();
                let bot_id = bot.id;
                with_conn(pool, move |conn| {
                    state_machine::try_transition(
                        conn,
                        bot_id,
                        TransitionEvent::FatalError,
                        Some(sub_states::LAUNCH_FAILED),
                        json!({ "error": detail }),
                    )?;
                    Ok(())
                })
                .await?;
            }
        }
    }
    Ok(())
}

/// Atomically claim one READY bot and move it to STAGED. The claim and the
/// transition share a transaction, so a crash between them cannot strand a
/// half-claimed bot.
async fn claim_and_stage(state: &Arc<AppState>) -> anyhow::Result<Option<Bot>> {
    with_conn(state.conn.clone(), move |conn| {
        conn.transaction::<_, anyhow::Error, _>(|conn| {
            let now = Utc::now();
            let candidate = match crate::bots::claim_ready_bot(conn, now)? {
                Some(bot) => bot,
                None => return Ok(None),
            };

            // Billing gate: exhausted orgs keep their bots in READY.
            if !billing::launch_allowed(conn, &candidate)? {
                warn!(
                    "Launch refused for bot {}: organization credits exhausted",
                    candidate.object_id
                );
                let org = billing::organization_for_project(conn, candidate.project_id)?;
                billing::notify_if_low(conn, &org, &org.credits)?;
                crate::bots::record_launch_backoff(
                    conn,
                    candidate.id,
                    now + ChronoDuration::seconds(60),
                )?;
                return Ok(None);
            }

            let transition = state_machine::try_transition(
                conn,
                candidate.id,
                TransitionEvent::Launch,
                None,
                json!({}),
            )?;
            Ok(transition.map(|t| t.bot))
        })
        .map_err(anyhow::Error::from)
    })
    .await
}

async fn handle_capacity_refusal(
    state: &Arc<AppState>,
    bot: &Bot,
    detail: &str,
) -> anyhow::Result<()> {
    let retry_window = ChronoDuration::from_std(state.config.dispatcher.launch_retry_window)?;
    let pool = state.conn.clone();
    let bot_id = bot.id;
    let bot_created = bot.created_at;
    let attempts = bot.launch_attempts;
    let detail = detail.to_string();
    let first_ready = bot.join_at.unwrap_or(bot_created);

    with_conn(pool, move |conn| {
        let now = Utc::now();
        if now - first_ready > retry_window {
            state_machine::try_transition(
                conn,
                bot_id,
                TransitionEvent::FatalError,
                Some(sub_states::LAUNCH_FAILED),
                json!({ "error": detail, "reason": "capacity retries exhausted" }),
            )?;
            return Ok(());
        }
        // Exponential backoff, capped at the dispatcher's retry window slice.
        let backoff_seconds = (1i64 << attempts.min(6)).min(120);
        state_machine::try_transition(
            conn,
            bot_id,
            TransitionEvent::LaunchReverted,
            None,
            json!({ "error": detail }),
        )?;
        crate::bots::record_launch_backoff(
            conn,
            bot_id,
            now + ChronoDuration::seconds(backoff_seconds),
        )?;
        Ok(())
    })
    .await
}

/// Janitor sweep: bots whose worker stopped heartbeating are failed and
/// billed from their last known runtime.
async fn sweep_stale_heartbeats(state: &Arc<AppState>) -> anyhow::Result<()> {
    let timeout = ChronoDuration::from_std(state.config.dispatcher.heartbeat_timeout)?;
    with_conn(state.conn.clone(), move |conn| {
        let deadline = Utc::now() - timeout;
        for bot in crate::bots::stale_heartbeat_bots(conn, deadline)? {
            warn!(
                "Heartbeat timeout for bot {} (last {:?})",
                bot.object_id, bot.heartbeat_timestamp
            );
            state_machine::try_transition(
                conn,
                bot.id,
                TransitionEvent::FatalError,
                Some(sub_states::HEARTBEAT_TIMEOUT),
                json!({
                    "last_heartbeat": bot.heartbeat_timestamp.map(|t| t.to_rfc3339()),
                }),
            )?;
        }
        Ok(())
    })
    .await
}
