//! Lead Outreach API Library
//!
//! Campaign lead pipeline: quota-guarded lead import, AI content generation,
//! throttled multi-channel delivery and an engagement ledger, run as
//! background jobs behind an HTTP API.
//!
//! # Modules
//!
//! - `circuit_breaker`: Circuit breaker for the generation endpoint.
//! - `config`: Configuration management.
//! - `contact`: Email and phone validation, contact scoring.
//! - `credentials`: Per-run channel credentials.
//! - `db`: Database connection pool and migrations.
//! - `errors`: Error handling types.
//! - `generation`: Content generator, generation backends and request queue.
//! - `handlers`: HTTP request handlers.
//! - `jobs`: Background job runner.
//! - `ledger`: Delivery ledger and analytics.
//! - `models`: Core data models.
//! - `orchestrator`: Bulk operations and lead import.
//! - `quota`: Tenant and campaign lead quotas.
//! - `senders`: Email and WhatsApp channel senders.
//! - `store`: Repository traits, Postgres and in-memory stores.
//! - `webhook_handler`: Delivery-event webhook.

pub mod circuit_breaker;
pub mod config;
pub mod contact;
pub mod credentials;
pub mod db;
pub mod errors;
pub mod generation;
pub mod handlers;
pub mod jobs;
pub mod ledger;
pub mod models;
pub mod orchestrator;
pub mod quota;
pub mod senders;
pub mod store;
pub mod webhook_handler;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers::AppState;

/// Tenant-facing API and webhook routes, without middleware.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/v1/campaigns/:campaign_id/leads/import",
            post(handlers::import_leads),
        )
        .route("/api/v1/campaigns/:campaign_id/jobs", post(handlers::start_job))
        .route(
            "/api/v1/campaigns/:campaign_id/deliveries",
            get(handlers::list_deliveries),
        )
        .route(
            "/api/v1/campaigns/:campaign_id/analytics",
            get(handlers::campaign_analytics),
        )
        .route("/api/v1/jobs/:job_id", get(handlers::get_job))
        .route("/api/v1/jobs/:job_id/cancel", post(handlers::cancel_job))
        .route("/api/v1/channels/test", post(handlers::test_channel))
        .route(
            "/api/v1/webhooks/delivery-events",
            post(webhook_handler::delivery_events_webhook),
        )
}
