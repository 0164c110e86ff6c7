use bigdecimal::{BigDecimal, Zero};
use chrono::Utc;
use diesel::prelude::*;
use log::{info, warn};
use uuid::Uuid;

use crate::adapter::Platform;
use crate::shared::models::{Bot, Organization, RecordingType, WebhookTrigger};
use crate::shared::schema::{organizations, projects};
use crate::webhooks;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("organization not found for project {0}")]
    OrganizationNotFound(Uuid),
    #[error(transparent)]
    Database(#[from] diesel::result::Error),
}

/// Credits per minute of bot runtime. Native SDK bots cost more than
/// browser-based ones; audio-only and no-recording runs are discounted.
pub fn rate(platform: Platform, recording_type: RecordingType) -> BigDecimal {
    let per_hour = match (platform, recording_type) {
        (Platform::ZoomNative, RecordingType::AudioAndVideo) => 60,
        (Platform::ZoomNative, RecordingType::AudioOnly) => 45,
        (Platform::ZoomRtms, _) => 30,
        (_, RecordingType::AudioAndVideo) => 48,
        (_, RecordingType::AudioOnly) => 36,
        (_, RecordingType::NoRecording) => 24,
    };
    // Stored as credits/minute with two decimal places.
    BigDecimal::from(per_hour) / BigDecimal::from(60)
}

pub fn minutes_for_runtime(runtime_ms: i64) -> i64 {
    (runtime_ms + 59_999) / 60_000
}

pub fn organization_for_project(
    conn: &mut PgConnection,
    project_id: Uuid,
) -> Result<Organization, BillingError> {
    organizations::table
        .inner_join(projects::table)
        .filter(projects::id.eq(project_id))
        .select(organizations::all_columns)
        .first(conn)
        .optional()?
        .ok_or(BillingError::OrganizationNotFound(project_id))
}

/// Pre-launch gate: an exhausted organization cannot launch unless it has the
/// allow-negative flag.
pub fn launch_allowed(conn: &mut PgConnection, bot: &Bot) -> Result<bool, BillingError> {
    let org = organization_for_project(conn, bot.project_id)?;
    Ok(org.allow_negative_credits || org.credits > BigDecimal::zero())
}

/// Debit the owning organization for a bot that just reached a terminal
/// state. Runs on the caller's connection so the debit commits or rolls back
/// with the terminal BotEvent.
pub fn debit_for_terminal_bot(conn: &mut PgConnection, bot: &Bot) -> Result<(), BillingError> {
    let runtime_ms = match crate::bots::runtime_ms(conn, bot)? {
        Some(ms) => ms,
        // Never joined: nothing to meter.
        None => return Ok(()),
    };
    let settings = bot.bot_settings();
    let platform = Platform::from_meeting_url(&bot.meeting_url);
    let credits_consumed = BigDecimal::from(minutes_for_runtime(runtime_ms))
        * rate(platform, settings.recording_type);

    let org = organization_for_project(conn, bot.project_id)?;
    let remaining: BigDecimal = diesel::update(organizations::table.filter(organizations::id.eq(org.id)))
        .set((
            organizations::credits.eq(organizations::credits - credits_consumed.clone()),
            organizations::updated_at.eq(Utc::now()),
        ))
        .returning(organizations::credits)
        .get_result(conn)?;

    info!(
        "Debited {} credits from org {} for bot {} ({} ms runtime), {} remaining",
        credits_consumed, org.id, bot.object_id, runtime_ms, remaining
    );

    notify_if_low(conn, &org, &remaining)?;
    Ok(())
}

/// Emit `organization.credits_low` once per threshold crossing. The
/// notified-at marker is cleared when a top-up brings the balance back above
/// the threshold.
pub fn notify_if_low(
    conn: &mut PgConnection,
    org: &Organization,
    remaining: &BigDecimal,
) -> Result<(), BillingError> {
    if remaining <= &org.credits_low_threshold {
        if org.credits_low_notified_at.is_none() {
            let payload = serde_json::json!({
                "organization_id": org.id,
                "credits_remaining": remaining.to_string(),
                "threshold": org.credits_low_threshold.to_string(),
            });
            if let Err(e) = webhooks::enqueue_for_organization(
                conn,
                org.id,
                WebhookTrigger::OrganizationCreditsLow,
                payload,
            ) {
                warn!("Failed to enqueue credits_low webhook for org {}: {}", org.id, e);
            }
            diesel::update(organizations::table.filter(organizations::id.eq(org.id)))
                .set(organizations::credits_low_notified_at.eq(Utc::now()))
                .execute(conn)?;
        }
    } else if org.credits_low_notified_at.is_some() {
        diesel::update(organizations::table.filter(organizations::id.eq(org.id)))
            .set(organizations::credits_low_notified_at.eq(None::<chrono::DateTime<Utc>>))
            .execute(conn)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_rounds_up_to_whole_minutes() {
        assert_eq!(minutes_for_runtime(1), 1);
        assert_eq!(minutes_for_runtime(60_000), 1);
        assert_eq!(minutes_for_runtime(60_001), 2);
        assert_eq!(minutes_for_runtime(20_000), 1);
        assert_eq!(minutes_for_runtime(3_600_000), 60);
    }

    #[test]
    fn native_zoom_costs_more_than_browser() {
        let native = rate(Platform::ZoomNative, RecordingType::AudioAndVideo);
        let browser = rate(Platform::GoogleMeet, RecordingType::AudioAndVideo);
        assert!(native > browser);
    }

    #[test]
    fn hour_of_native_video_is_sixty_credits() {
        let credits =
            BigDecimal::from(60) * rate(Platform::ZoomNative, RecordingType::AudioAndVideo);
        assert_eq!(credits, BigDecimal::from(60));
    }
}
