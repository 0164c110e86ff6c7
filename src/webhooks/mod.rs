use chrono::Utc;
use diesel::prelude::*;
use hmac::{Hmac, Mac};
use log::debug;
use serde_json::{json, Value};
use sha2::Sha256;
use uuid::Uuid;

use crate::shared::models::{
    Bot, BotEvent, NewWebhookDeliveryAttempt, SessionType, WebhookSubscription, WebhookTrigger,
};
use crate::shared::schema::{projects, webhook_delivery_attempts, webhook_subscriptions};
use crate::shared::utils::generate_object_id;

pub mod delivery;

type HmacSha256 = Hmac<Sha256>;

pub const MAX_ATTEMPTS: i32 = 5;
/// Seconds after the first attempt at which each attempt fires.
pub const RETRY_OFFSETS_SECONDS: [i64; 5] = [0, 30, 120, 600, 3600];

/// `X-Webhook-Signature` value: HMAC-SHA256 over the exact request body.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn build_payload(trigger: WebhookTrigger, bot: Option<&Bot>, data: Value, key: Uuid) -> Value {
    let mut payload = json!({
        "idempotency_key": key,
        "trigger": trigger.as_str(),
        "data": data,
        "timestamp": Utc::now().to_rfc3339(),
    });
    if let Some(bot) = bot {
        let field = match bot.session_type() {
            SessionType::Bot => "bot_id",
            SessionType::AppSession => "app_session_id",
        };
        payload[field] = json!(bot.object_id);
    }
    payload
}

fn active_subscriptions(
    conn: &mut PgConnection,
    project_id: Uuid,
    trigger: WebhookTrigger,
) -> QueryResult<Vec<WebhookSubscription>> {
    let subs: Vec<WebhookSubscription> = webhook_subscriptions::table
        .filter(webhook_subscriptions::project_id.eq(project_id))
        .filter(webhook_subscriptions::is_active.eq(true))
        .load(conn)?;
    Ok(subs
        .into_iter()
        .filter(|s| s.trigger_list().contains(&trigger))
        .collect())
}

/// Enqueue one delivery attempt per matching subscription. Runs on the
/// caller's connection so enqueues commit with whatever produced the event.
pub fn enqueue(
    conn: &mut PgConnection,
    project_id: Uuid,
    bot: Option<&Bot>,
    trigger: WebhookTrigger,
    data: Value,
) -> QueryResult<usize> {
    let subs = active_subscriptions(conn, project_id, trigger)?;
    if subs.is_empty() {
        return Ok(0);
    }
    let now = Utc::now();
    let rows: Vec<NewWebhookDeliveryAttempt> = subs
        .iter()
        .map(|sub| {
            let key = Uuid::new_v4();
            NewWebhookDeliveryAttempt {
                id: Uuid::new_v4(),
                object_id: generate_object_id("wda"),
                subscription_id: sub.id,
                bot_id: bot.map(|b| b.id),
                trigger_type: trigger.as_str().to_string(),
                idempotency_key: key,
                payload: build_payload(trigger, bot, data.clone(), key),
                status: "pending".to_string(),
                attempt_count: 0,
                next_attempt_at: Some(now),
                response_body_list: json!([]),
            }
        })
        .collect();
    let inserted = diesel::insert_into(webhook_delivery_attempts::table)
        .values(&rows)
        .execute(conn)?;
    debug!(
        "Enqueued {} deliveries for {} on project {}",
        inserted,
        trigger.as_str(),
        project_id
    );
    Ok(inserted)
}

pub fn enqueue_state_change(
    conn: &mut PgConnection,
    bot: &Bot,
    event: &BotEvent,
) -> QueryResult<usize> {
    let data = json!({
        "old_state": event.old_state,
        "new_state": event.new_state,
        "event_type": event.event_type,
        "event_sub_type": event.event_sub_type,
        "created_at": event.created_at.to_rfc3339(),
    });
    enqueue(conn, bot.project_id, Some(bot), WebhookTrigger::BotStateChange, data)
}

/// Fan an organization-level trigger out to every project in the org.
pub fn enqueue_for_organization(
    conn: &mut PgConnection,
    organization_id: Uuid,
    trigger: WebhookTrigger,
    data: Value,
) -> QueryResult<usize> {
    let project_ids: Vec<Uuid> = projects::table
        .filter(projects::organization_id.eq(organization_id))
        .select(projects::id)
        .load(conn)?;
    let mut total = 0;
    for project_id in project_ids {
        total += enqueue(conn, project_id, None, trigger, data.clone())?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_prefixed_hex_hmac() {
        let sig = sign_payload("topsecret", b"{\"a\":1}");
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
        // Stable across calls for the same body/secret.
        assert_eq!(sig, sign_payload("topsecret", b"{\"a\":1}"));
        assert_ne!(sig, sign_payload("othersecret", b"{\"a\":1}"));
    }

    #[test]
    fn payload_uses_app_session_field_for_rtms_rows() {
        let mut bot = test_bot();
        bot.session_type = "app_session".into();
        let payload = build_payload(
            WebhookTrigger::TranscriptUpdate,
            Some(&bot),
            json!({}),
            Uuid::new_v4(),
        );
        assert!(payload.get("app_session_id").is_some());
        assert!(payload.get("bot_id").is_none());
    }

    #[test]
    fn retry_offsets_match_policy() {
        assert_eq!(RETRY_OFFSETS_SECONDS, [0, 30, 120, 600, 3600]);
        assert_eq!(MAX_ATTEMPTS as usize, RETRY_OFFSETS_SECONDS.len());
    }

    fn test_bot() -> Bot {
        Bot {
            id: Uuid::new_v4(),
            object_id: "bot_test".into(),
            project_id: Uuid::new_v4(),
            session_type: "bot".into(),
            meeting_url: "https://zoom.us/j/1".into(),
            name: "Notetaker".into(),
            state: "ready".into(),
            sub_state: None,
            join_at: None,
            deduplication_key: None,
            settings: json!({}),
            metadata: json!({}),
            heartbeat_timestamp: None,
            first_heartbeat_timestamp: None,
            launch_attempts: 0,
            next_launch_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
