use crate::config::Config;
use crate::credentials::ChannelCredentials;
use crate::errors::AppError;
use crate::jobs::JobRunner;
use crate::ledger::{CampaignAnalytics, DeliveryLedger};
use crate::models::*;
use crate::orchestrator::{BatchOrchestrator, BulkRequest};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// Runs bulk operations and lead imports.
    pub orchestrator: Arc<BatchOrchestrator>,
    /// Background job registry (dedupe, cancellation, status).
    pub jobs: JobRunner,
    /// Read side of the delivery log.
    pub ledger: DeliveryLedger,
}

/// Tenant identity set by the upstream auth layer.
fn tenant_id(headers: &HeaderMap) -> Result<Uuid, AppError> {
    let raw = headers
        .get("X-Tenant-Id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing X-Tenant-Id header".to_string()))?;
    Uuid::parse_str(raw.trim())
        .map_err(|_| AppError::Validation(format!("Invalid X-Tenant-Id header: {}", raw)))
}

/// Health check endpoint.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "rust-outreach-api",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

#[derive(Debug, Deserialize)]
pub struct ImportLeadsRequest {
    pub leads: Vec<NewLead>,
}

/// POST /api/v1/campaigns/:campaign_id/leads/import
///
/// Imports as many leads as the tenant quota and campaign ceiling allow;
/// the rest are reported as rejected.
pub async fn import_leads(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<ImportLeadsRequest>,
) -> Result<Json<ImportSummary>, AppError> {
    let tenant_id = tenant_id(&headers)?;
    tracing::info!(
        "POST /campaigns/{}/leads/import - {} leads",
        campaign_id,
        payload.leads.len()
    );

    let summary = state
        .orchestrator
        .import_leads(tenant_id, campaign_id, payload.leads)
        .await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct StartJobRequest {
    pub operation: Operation,
    #[serde(default)]
    pub lead_ids: Vec<Uuid>,
    #[serde(default)]
    pub template_id: Option<Uuid>,
    #[serde(default)]
    pub context: GenerationContext,
    #[serde(default)]
    pub credentials: Option<ChannelCredentials>,
    #[serde(default)]
    pub overwrite: bool,
}

/// POST /api/v1/campaigns/:campaign_id/jobs
///
/// Runs preflight synchronously, then returns 202 with the queued job while
/// the leads are processed in the background.
pub async fn start_job(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<StartJobRequest>,
) -> Result<(StatusCode, Json<Job>), AppError> {
    let tenant_id = tenant_id(&headers)?;
    tracing::info!(
        "POST /campaigns/{}/jobs - {}",
        campaign_id,
        payload.operation.as_str()
    );

    let job = state
        .jobs
        .submit(BulkRequest {
            tenant_id,
            campaign_id,
            operation: payload.operation,
            lead_ids: payload.lead_ids,
            template_id: payload.template_id,
            context: payload.context,
            credentials: payload.credentials,
            overwrite: payload.overwrite,
        })
        .await?;

    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// GET /api/v1/jobs/:job_id
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Job>, AppError> {
    let tenant_id = tenant_id(&headers)?;
    Ok(Json(state.jobs.get(tenant_id, job_id).await?))
}

/// POST /api/v1/jobs/:job_id/cancel
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<Job>), AppError> {
    let tenant_id = tenant_id(&headers)?;
    tracing::info!("POST /jobs/{}/cancel", job_id);
    let job = state.jobs.cancel(tenant_id, job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// POST /api/v1/channels/test
///
/// Runs the channel's connection test. Credentials are not stored.
pub async fn test_channel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(credentials): Json<ChannelCredentials>,
) -> Result<Json<serde_json::Value>, AppError> {
    tenant_id(&headers)?;
    let channel = credentials.channel();
    tracing::info!("POST /channels/test - {}", channel);

    state.orchestrator.check_credentials(&credentials).await?;
    Ok(Json(json!({
        "status": "ok",
        "channel": channel.as_str(),
        "fingerprint": credentials.fingerprint()
    })))
}

/// GET /api/v1/campaigns/:campaign_id/deliveries
///
/// Query params: `channel`, `status`, `lead_id`, `limit`, `offset`. Newest first.
pub async fn list_deliveries(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<Uuid>,
    headers: HeaderMap,
    Query(filter): Query<DeliveryFilter>,
) -> Result<Json<Vec<DeliveryLog>>, AppError> {
    let tenant_id = tenant_id(&headers)?;
    state
        .orchestrator
        .owned_campaign(tenant_id, campaign_id)
        .await?;

    let rows = state.ledger.query(campaign_id, &filter).await?;
    tracing::debug!("Campaign {}: {} delivery rows", campaign_id, rows.len());
    Ok(Json(rows))
}

#[derive(Debug, Default, Deserialize)]
pub struct AnalyticsQuery {
    #[serde(default)]
    pub channel: Option<Channel>,
}

/// GET /api/v1/campaigns/:campaign_id/analytics
pub async fn campaign_analytics(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<CampaignAnalytics>, AppError> {
    let tenant_id = tenant_id(&headers)?;
    state
        .orchestrator
        .owned_campaign(tenant_id, campaign_id)
        .await?;

    Ok(Json(state.ledger.analytics(campaign_id, query.channel).await?))
}
