use crate::errors::AppError;
use crate::handlers::AppState;
use crate::models::EngagementEvent;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One engagement event reported by a tracking pixel, link redirect or
/// provider callback.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryEvent {
    pub delivery_id: i64,
    pub event: EngagementEvent,
}

/// Single event object or array of events.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum DeliveryEventPayload {
    Batch(Vec<DeliveryEvent>),
    Single(DeliveryEvent),
}

impl DeliveryEventPayload {
    pub fn into_events(self) -> Vec<DeliveryEvent> {
        match self {
            DeliveryEventPayload::Batch(events) => events,
            DeliveryEventPayload::Single(event) => vec![event],
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeliveryEventResponse {
    pub status: String,
    pub received: usize,
    pub applied: usize,
    pub failed: usize,
}

/// Delivery-event webhook
///
/// Advances delivery log rows on open/click/reply/bounce. Events that would
/// move a row backwards are accepted and leave it unchanged.
///
/// Authentication: X-Webhook-Token header must match WEBHOOK_SECRET env var
pub async fn delivery_events_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<DeliveryEventPayload>,
) -> Result<(StatusCode, Json<DeliveryEventResponse>), AppError> {
    validate_webhook_secret(&state, &headers)?;

    let events = payload.into_events();
    let total_received = events.len();
    tracing::info!("Processing {} delivery event(s)", total_received);

    let mut applied = 0;
    let mut failed = 0;

    for event in events {
        match state.ledger.advance(event.delivery_id, event.event).await {
            Ok(_) => applied += 1,
            Err(e) => {
                failed += 1;
                tracing::warn!(
                    "Failed to apply {:?} to delivery {}: {}",
                    event.event,
                    event.delivery_id,
                    e
                );
            }
        }
    }

    tracing::info!(
        "Delivery events complete: {} received, {} applied, {} failed",
        total_received,
        applied,
        failed
    );

    Ok((
        StatusCode::OK,
        Json(DeliveryEventResponse {
            status: "received".to_string(),
            received: total_received,
            applied,
            failed,
        }),
    ))
}

/// Validate webhook secret from X-Webhook-Token header
fn validate_webhook_secret(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    // No secret configured: open endpoint (warned at startup)
    let Some(ref expected_secret) = state.config.webhook_secret else {
        return Ok(());
    };

    let token = headers
        .get("X-Webhook-Token")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing X-Webhook-Token header".to_string()))?;

    if !constant_time_compare(token, expected_secret) {
        tracing::warn!("Invalid webhook token received");
        return Err(AppError::Unauthorized("Invalid webhook token".to_string()));
    }

    Ok(())
}

/// Constant-time string comparison
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
