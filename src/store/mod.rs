//! Persistence seams for the pipeline.
//!
//! Every write that a bulk job performs is its own commit, so a crash
//! mid-batch leaves earlier items durable and the batch resumable.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{
    BatchSummary, Campaign, Channel, DeliveryCounts, DeliveryFilter, DeliveryLog,
    EngagementEvent, Job, JobStatus, Lead, NewDeliveryLog, NewLead, Template, Tenant,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait TenantRepository: Send + Sync {
    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>, AppError>;

    async fn get_campaign(&self, campaign_id: Uuid) -> Result<Option<Campaign>, AppError>;

    async fn get_template(&self, template_id: Uuid) -> Result<Option<Template>, AppError>;

    async fn increment_template_usage(&self, template_id: Uuid) -> Result<(), AppError>;

    /// Atomically reserve up to `requested` leads against the tenant quota
    /// (and the campaign ceiling when given). Returns the granted count,
    /// which is 0 when either ceiling is already reached.
    async fn reserve_lead_capacity(
        &self,
        tenant_id: Uuid,
        campaign_id: Option<Uuid>,
        requested: i64,
    ) -> Result<i64, AppError>;

    /// Give back capacity reserved by [`TenantRepository::reserve_lead_capacity`].
    async fn release_lead_capacity(
        &self,
        tenant_id: Uuid,
        campaign_id: Option<Uuid>,
        count: i64,
    ) -> Result<(), AppError>;
}

#[async_trait]
pub trait LeadRepository: Send + Sync {
    async fn get_lead(&self, lead_id: Uuid) -> Result<Option<Lead>, AppError>;

    async fn get_leads(&self, lead_ids: &[Uuid]) -> Result<Vec<Lead>, AppError>;

    /// Lead ids of a campaign in creation order.
    async fn list_campaign_lead_ids(&self, campaign_id: Uuid) -> Result<Vec<Uuid>, AppError>;

    /// Insert already-reserved leads in a single transaction.
    async fn insert_leads(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        leads: &[NewLead],
    ) -> Result<Vec<Uuid>, AppError>;

    async fn save_description(
        &self,
        lead_id: Uuid,
        description: &str,
        lead_score: f64,
    ) -> Result<(), AppError>;

    async fn save_generated_email(
        &self,
        lead_id: Uuid,
        subject: Option<&str>,
        body: &str,
    ) -> Result<(), AppError>;

    async fn save_generated_whatsapp(&self, lead_id: Uuid, message: &str) -> Result<(), AppError>;
}

#[async_trait]
pub trait DeliveryLogRepository: Send + Sync {
    /// Append a row; when the row is not `failed`, raise the lead's sent flag
    /// for that channel in the same commit.
    async fn append_delivery(&self, record: &NewDeliveryLog) -> Result<i64, AppError>;

    /// Rows of a campaign, newest first.
    async fn query_deliveries(
        &self,
        campaign_id: Uuid,
        filter: &DeliveryFilter,
    ) -> Result<Vec<DeliveryLog>, AppError>;

    async fn get_delivery(&self, log_id: i64) -> Result<Option<DeliveryLog>, AppError>;

    /// Apply an engagement event; returns the updated row, or `None` when the
    /// row does not exist. Rows the event does not apply to are returned unchanged.
    async fn advance_delivery(
        &self,
        log_id: i64,
        event: EngagementEvent,
        at: DateTime<Utc>,
    ) -> Result<Option<DeliveryLog>, AppError>;

    async fn delivery_counts(
        &self,
        campaign_id: Uuid,
        channel: Option<Channel>,
    ) -> Result<DeliveryCounts, AppError>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create_job(&self, job: &Job) -> Result<(), AppError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, AppError>;

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<(), AppError>;

    async fn update_job_progress(&self, job_id: Uuid, summary: &BatchSummary)
        -> Result<(), AppError>;

    async fn list_jobs_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, AppError>;
}

/// Everything the pipeline needs from persistence.
pub trait Store: TenantRepository + LeadRepository + DeliveryLogRepository + JobRepository {}

impl<T> Store for T where T: TenantRepository + LeadRepository + DeliveryLogRepository + JobRepository
{}
