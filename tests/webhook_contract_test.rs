//! Receiver-side contract checks for webhook payloads: signature scheme and
//! idempotency-key behavior a well-behaved subscriber relies on.

use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use std::collections::HashSet;

use meetserver::webhooks::{sign_payload, MAX_ATTEMPTS, RETRY_OFFSETS_SECONDS};

fn verify(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[test]
fn receiver_can_verify_the_signature_header() {
    let body = serde_json::to_vec(&json!({
        "idempotency_key": "0e4a1c9a-3c9f-4a96-9f2e-b7f6f4f7b111",
        "trigger": "bot.state_change",
        "bot_id": "bot_h4X9m2QpL7sWv0Ra",
        "data": { "old_state": "joining", "new_state": "joined_not_recording" },
        "timestamp": "2026-08-02T10:00:00Z",
    }))
    .unwrap();

    let header = sign_payload("whsec_topsecret", &body);
    assert!(verify("whsec_topsecret", &body, &header));
    assert!(!verify("whsec_other", &body, &header));

    // Any body mutation invalidates the signature.
    let mut tampered = body.clone();
    tampered[0] ^= 1;
    assert!(!verify("whsec_topsecret", &tampered, &header));
}

#[test]
fn redelivery_with_same_idempotency_key_is_deduplicable() {
    // A receiver that keys side effects on idempotency_key sees exactly one
    // effect no matter how many retries arrive.
    let payload = json!({
        "idempotency_key": "11111111-2222-3333-4444-555555555555",
        "trigger": "transcript.update",
    });
    let mut seen = HashSet::new();
    let mut side_effects = 0;
    for _ in 0..MAX_ATTEMPTS {
        let key = payload["idempotency_key"].as_str().unwrap().to_string();
        if seen.insert(key) {
            side_effects += 1;
        }
    }
    assert_eq!(side_effects, 1);
}

#[test]
fn retry_offsets_cover_an_hour_of_backoff() {
    assert_eq!(RETRY_OFFSETS_SECONDS.first(), Some(&0));
    assert_eq!(RETRY_OFFSETS_SECONDS.last(), Some(&3600));
    assert!(RETRY_OFFSETS_SECONDS.windows(2).all(|w| w[0] < w[1]));
}
