use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Uuid as SqlUuid};
use log::{error, info, warn};
use serde_json::json;
use uuid::Uuid;

use super::{sign_payload, MAX_ATTEMPTS, RETRY_OFFSETS_SECONDS};
use crate::shared::models::{WebhookDeliveryAttempt, WebhookSubscription};
use crate::shared::schema::{webhook_delivery_attempts, webhook_subscriptions};
use crate::shared::state::AppState;
use crate::shared::utils::{with_conn, DbPool};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a claimed attempt stays invisible to other delivery workers.
const CLAIM_VISIBILITY_SECONDS: i64 = 60;
const RESPONSE_BODY_LIMIT: usize = 4096;

/// Drains the webhook queue with a pool of delivery tasks. Runs until the
/// process is stopped; claim contention across replicas is resolved by
/// `FOR UPDATE SKIP LOCKED`.
pub async fn run_delivery_workers(state: Arc<AppState>, workers: usize) -> anyhow::Result<()> {
    info!("Starting {} webhook delivery workers", workers);
    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(TOTAL_TIMEOUT)
        .build()?;

    let mut handles = Vec::new();
    for worker_id in 0..workers {
        let pool = state.conn.clone();
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                match claim_due_attempt(pool.clone()).await {
                    Ok(Some((attempt, sub))) => {
                        if let Err(e) = deliver(&client, pool.clone(), attempt, sub).await {
                            error!("delivery worker {}: {}", worker_id, e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => error!("delivery worker {} claim failed: {}", worker_id, e),
                }
            }
        }));
    }
    for handle in handles {
        handle.await?;
    }
    Ok(())
}

#[derive(QueryableByName)]
struct ClaimedId {
    #[diesel(sql_type = SqlUuid)]
    id: Uuid,
}

/// Claim one due attempt. State-change deliveries are serialized per
/// `(subscription, bot)`: an attempt is skipped while an older pending
/// state-change attempt exists for the same pair, which keeps that stream
/// monotonic even across retries.
async fn claim_due_attempt(
    pool: DbPool,
) -> anyhow::Result<Option<(WebhookDeliveryAttempt, WebhookSubscription)>> {
    with_conn(pool, move |conn| {
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            let claimed: Option<ClaimedId> = diesel::sql_query(
                r#"
                SELECT w.id FROM webhook_delivery_attempts w
                WHERE w.status = 'pending'
                  AND (w.next_attempt_at IS NULL OR w.next_attempt_at <= NOW())
                  AND NOT (
                    w.trigger_type = 'bot.state_change'
                    AND EXISTS (
                      SELECT 1 FROM webhook_delivery_attempts earlier
                      WHERE earlier.subscription_id = w.subscription_id
                        AND earlier.bot_id IS NOT DISTINCT FROM w.bot_id
                        AND earlier.trigger_type = 'bot.state_change'
                        AND earlier.status = 'pending'
                        AND earlier.created_at < w.created_at
                    )
                  )
                ORDER BY w.next_attempt_at ASC
                LIMIT 1
                FOR UPDATE OF w SKIP LOCKED
                "#,
            )
            .get_result(conn)
            .optional()?;

            let claimed = match claimed {
                Some(c) => c,
                None => return Ok(None),
            };

            // Visibility timeout: a crashed worker's claim becomes due again.
            diesel::sql_query(
                "UPDATE webhook_delivery_attempts
                 SET next_attempt_at = NOW() + make_interval(secs => $1::double precision)
                 WHERE id = $2",
            )
            .bind::<BigInt, _>(CLAIM_VISIBILITY_SECONDS)
            .bind::<SqlUuid, _>(claimed.id)
            .execute(conn)?;

            let attempt: WebhookDeliveryAttempt = webhook_delivery_attempts::table
                .filter(webhook_delivery_attempts::id.eq(claimed.id))
                .first(conn)?;
            let sub: WebhookSubscription = webhook_subscriptions::table
                .filter(webhook_subscriptions::id.eq(attempt.subscription_id))
                .first(conn)?;
            Ok(Some((attempt, sub)))
        })
        .map_err(anyhow::Error::from)
    })
    .await
}

async fn deliver(
    client: &reqwest::Client,
    pool: DbPool,
    attempt: WebhookDeliveryAttempt,
    sub: WebhookSubscription,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&attempt.payload)?;
    let signature = sign_payload(&sub.secret, &body);

    let outcome = client
        .post(&sub.url)
        .header("Content-Type", "application/json")
        .header("X-Webhook-Signature", signature)
        .body(body)
        .send()
        .await;

    let (success, status_line, response_body) = match outcome {
        Ok(resp) => {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            (status.is_success(), status.as_u16().to_string(), text)
        }
        Err(e) => (false, "error".to_string(), e.to_string()),
    };

    let mut truncated = response_body;
    truncated.truncate(RESPONSE_BODY_LIMIT);

    record_outcome(pool, attempt, success, status_line, truncated).await
}

async fn record_outcome(
    pool: DbPool,
    attempt: WebhookDeliveryAttempt,
    success: bool,
    status_line: String,
    response_body: String,
) -> anyhow::Result<()> {
    with_conn(pool, move |conn| {
        let now = Utc::now();
        let attempts_done = attempt.attempt_count + 1;

        let mut bodies = attempt
            .response_body_list
            .as_array()
            .cloned()
            .unwrap_or_default();
        bodies.push(json!({
            "status": status_line,
            "body": response_body,
            "attempted_at": now.to_rfc3339(),
        }));

        let (status, next_attempt_at): (&str, Option<DateTime<Utc>>) = if success {
            ("success", None)
        } else if attempts_done >= MAX_ATTEMPTS {
            warn!(
                "Delivery {} exhausted {} attempts",
                attempt.object_id, attempts_done
            );
            ("failure", None)
        } else {
            let offset = RETRY_OFFSETS_SECONDS[attempts_done as usize];
            (
                "pending",
                Some(attempt.created_at + chrono::Duration::seconds(offset)),
            )
        };

        diesel::update(
            webhook_delivery_attempts::table.filter(webhook_delivery_attempts::id.eq(attempt.id)),
        )
        .set((
            webhook_delivery_attempts::status.eq(status),
            webhook_delivery_attempts::attempt_count.eq(attempts_done),
            webhook_delivery_attempts::last_attempt_at.eq(now),
            webhook_delivery_attempts::next_attempt_at.eq(next_attempt_at),
            webhook_delivery_attempts::response_body_list.eq(serde_json::Value::Array(bodies)),
            webhook_delivery_attempts::succeeded_at
                .eq(if success { Some(now) } else { None }),
        ))
        .execute(conn)?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_schedule_walks_the_offset_table() {
        // After n failed attempts the next one fires at created_at + offset[n].
        let created = Utc::now();
        for (done, expected) in [(1, 30), (2, 120), (3, 600), (4, 3600)] {
            let next = created + chrono::Duration::seconds(RETRY_OFFSETS_SECONDS[done]);
            assert_eq!((next - created).num_seconds(), expected);
        }
    }

    #[test]
    fn response_bodies_are_truncated() {
        let mut body = "x".repeat(10_000);
        body.truncate(RESPONSE_BODY_LIMIT);
        assert_eq!(body.len(), 4096);
    }
}
