use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{DeliveryLogRepository, JobRepository, LeadRepository, TenantRepository};
use crate::errors::{AppError, ResultExt};
use crate::models::{
    BatchSummary, Campaign, Channel, DeliveryCounts, DeliveryFilter, DeliveryLog,
    DeliveryStatus, EngagementEvent, Job, JobStatus, Lead, NewDeliveryLog, NewLead, Template,
    Tenant,
};

const LEAD_COLUMNS: &str = "id, campaign_id, tenant_id, name, address, phone, website, email, \
     generated_description, generated_email_subject, generated_email, generated_whatsapp, \
     email_sent, whatsapp_sent, replied, lead_score, created_at, updated_at";

const DELIVERY_COLUMNS: &str = "id, lead_id, campaign_id, tenant_id, channel, status, sent_at, \
     error_message, retry_count, provider_message_id, opened_at, clicked_at, replied_at, created_at";

const JOB_COLUMNS: &str = "id, tenant_id, campaign_id, operation, status, lead_ids, summary, \
     credentials_fingerprint, error_message, created_at, started_at, finished_at";

/// Postgres-backed store. Each method is its own commit.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn tenant_from_row(row: &PgRow) -> Result<Tenant, AppError> {
    Ok(Tenant {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        plan: row.try_get("plan")?,
        leads_quota: row.try_get("leads_quota")?,
        leads_used: row.try_get("leads_used")?,
        created_at: row.try_get("created_at")?,
    })
}

fn campaign_from_row(row: &PgRow) -> Result<Campaign, AppError> {
    Ok(Campaign {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        max_leads: row.try_get("max_leads")?,
        leads_count: row.try_get("leads_count")?,
        created_at: row.try_get("created_at")?,
    })
}

fn template_from_row(row: &PgRow) -> Result<Template, AppError> {
    Ok(Template {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        ai_personalization: row.try_get("ai_personalization")?,
        times_used: row.try_get("times_used")?,
    })
}

fn lead_from_row(row: &PgRow) -> Result<Lead, AppError> {
    Ok(Lead {
        id: row.try_get("id")?,
        campaign_id: row.try_get("campaign_id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        address: row.try_get("address")?,
        phone: row.try_get("phone")?,
        website: row.try_get("website")?,
        email: row.try_get("email")?,
        generated_description: row.try_get("generated_description")?,
        generated_email_subject: row.try_get("generated_email_subject")?,
        generated_email: row.try_get("generated_email")?,
        generated_whatsapp: row.try_get("generated_whatsapp")?,
        email_sent: row.try_get("email_sent")?,
        whatsapp_sent: row.try_get("whatsapp_sent")?,
        replied: row.try_get("replied")?,
        lead_score: row.try_get("lead_score")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn delivery_from_row(row: &PgRow) -> Result<DeliveryLog, AppError> {
    Ok(DeliveryLog {
        id: row.try_get("id")?,
        lead_id: row.try_get("lead_id")?,
        campaign_id: row.try_get("campaign_id")?,
        tenant_id: row.try_get("tenant_id")?,
        channel: row.try_get::<String, _>("channel")?.parse()?,
        status: row.try_get::<String, _>("status")?.parse()?,
        sent_at: row.try_get("sent_at")?,
        error_message: row.try_get("error_message")?,
        retry_count: row.try_get("retry_count")?,
        provider_message_id: row.try_get("provider_message_id")?,
        opened_at: row.try_get("opened_at")?,
        clicked_at: row.try_get("clicked_at")?,
        replied_at: row.try_get("replied_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<Job, AppError> {
    let summary: Json<BatchSummary> = row.try_get("summary")?;
    Ok(Job {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        campaign_id: row.try_get("campaign_id")?,
        operation: row.try_get::<String, _>("operation")?.parse()?,
        status: row.try_get::<String, _>("status")?.parse()?,
        lead_ids: row.try_get("lead_ids")?,
        summary: summary.0,
        credentials_fingerprint: row.try_get("credentials_fingerprint")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

#[async_trait]
impl TenantRepository for PgStore {
    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>, AppError> {
        sqlx::query(
            "SELECT id, name, plan, leads_quota, leads_used, created_at FROM tenants WHERE id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load tenant")?
        .as_ref()
        .map(tenant_from_row)
        .transpose()
    }

    async fn get_campaign(&self, campaign_id: Uuid) -> Result<Option<Campaign>, AppError> {
        sqlx::query(
            "SELECT id, tenant_id, name, status, max_leads, leads_count, created_at \
             FROM campaigns WHERE id = $1",
        )
        .bind(campaign_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load campaign")?
        .as_ref()
        .map(campaign_from_row)
        .transpose()
    }

    async fn get_template(&self, template_id: Uuid) -> Result<Option<Template>, AppError> {
        sqlx::query(
            "SELECT id, tenant_id, name, subject, body, ai_personalization, times_used \
             FROM templates WHERE id = $1",
        )
        .bind(template_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load template")?
        .as_ref()
        .map(template_from_row)
        .transpose()
    }

    async fn increment_template_usage(&self, template_id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE templates SET times_used = times_used + 1 WHERE id = $1")
            .bind(template_id)
            .execute(&self.pool)
            .await
            .context("Failed to increment template usage")?;
        Ok(())
    }

    async fn reserve_lead_capacity(
        &self,
        tenant_id: Uuid,
        campaign_id: Option<Uuid>,
        requested: i64,
    ) -> Result<i64, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin quota transaction")?;

        let (quota, used): (i64, i64) = sqlx::query_as(
            "SELECT leads_quota, leads_used FROM tenants WHERE id = $1 FOR UPDATE",
        )
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Tenant {} not found", tenant_id)))?;

        let mut allowed = requested.min((quota - used).max(0));

        if let Some(campaign_id) = campaign_id {
            let (max_leads, leads_count): (i64, i64) = sqlx::query_as(
                "SELECT max_leads, leads_count FROM campaigns WHERE id = $1 FOR UPDATE",
            )
            .bind(campaign_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Campaign {} not found", campaign_id)))?;
            allowed = allowed.min((max_leads - leads_count).max(0));
        }

        let allowed = allowed.max(0);
        if allowed > 0 {
            sqlx::query("UPDATE tenants SET leads_used = leads_used + $2 WHERE id = $1")
                .bind(tenant_id)
                .bind(allowed)
                .execute(&mut *tx)
                .await?;
            if let Some(campaign_id) = campaign_id {
                sqlx::query("UPDATE campaigns SET leads_count = leads_count + $2 WHERE id = $1")
                    .bind(campaign_id)
                    .bind(allowed)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await.context("Failed to commit quota reservation")?;
        Ok(allowed)
    }

    async fn release_lead_capacity(
        &self,
        tenant_id: Uuid,
        campaign_id: Option<Uuid>,
        count: i64,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE tenants SET leads_used = GREATEST(leads_used - $2, 0) WHERE id = $1")
            .bind(tenant_id)
            .bind(count)
            .execute(&mut *tx)
            .await?;
        if let Some(campaign_id) = campaign_id {
            sqlx::query(
                "UPDATE campaigns SET leads_count = GREATEST(leads_count - $2, 0) WHERE id = $1",
            )
            .bind(campaign_id)
            .bind(count)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await.context("Failed to release lead capacity")?;
        Ok(())
    }
}

#[async_trait]
impl LeadRepository for PgStore {
    async fn get_lead(&self, lead_id: Uuid) -> Result<Option<Lead>, AppError> {
        sqlx::query(&format!("SELECT {} FROM leads WHERE id = $1", LEAD_COLUMNS))
            .bind(lead_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load lead")?
            .as_ref()
            .map(lead_from_row)
            .transpose()
    }

    async fn get_leads(&self, lead_ids: &[Uuid]) -> Result<Vec<Lead>, AppError> {
        sqlx::query(&format!("SELECT {} FROM leads WHERE id = ANY($1)", LEAD_COLUMNS))
            .bind(lead_ids)
            .fetch_all(&self.pool)
            .await
            .context("Failed to load leads")?
            .iter()
            .map(lead_from_row)
            .collect()
    }

    async fn list_campaign_lead_ids(&self, campaign_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT id FROM leads WHERE campaign_id = $1 ORDER BY created_at, id")
                .bind(campaign_id)
                .fetch_all(&self.pool)
                .await
                .context("Failed to list campaign leads")?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn insert_leads(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        leads: &[NewLead],
    ) -> Result<Vec<Uuid>, AppError> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(leads.len());
        for lead in leads {
            let id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO leads (id, campaign_id, tenant_id, name, address, phone, website, email) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(id)
            .bind(campaign_id)
            .bind(tenant_id)
            .bind(&lead.name)
            .bind(&lead.address)
            .bind(&lead.phone)
            .bind(&lead.website)
            .bind(&lead.email)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to insert lead '{}'", lead.name))?;
            ids.push(id);
        }
        tx.commit().await.context("Failed to commit lead import")?;
        Ok(ids)
    }

    async fn save_description(
        &self,
        lead_id: Uuid,
        description: &str,
        lead_score: f64,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE leads SET generated_description = $2, lead_score = $3, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(lead_id)
        .bind(description)
        .bind(lead_score)
        .execute(&self.pool)
        .await
        .context("Failed to save description")?;
        Ok(())
    }

    async fn save_generated_email(
        &self,
        lead_id: Uuid,
        subject: Option<&str>,
        body: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE leads SET generated_email_subject = $2, generated_email = $3, \
             updated_at = NOW() WHERE id = $1",
        )
        .bind(lead_id)
        .bind(subject)
        .bind(body)
        .execute(&self.pool)
        .await
        .context("Failed to save generated email")?;
        Ok(())
    }

    async fn save_generated_whatsapp(&self, lead_id: Uuid, message: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE leads SET generated_whatsapp = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(lead_id)
        .bind(message)
        .execute(&self.pool)
        .await
        .context("Failed to save generated chat message")?;
        Ok(())
    }
}

#[async_trait]
impl DeliveryLogRepository for PgStore {
    async fn append_delivery(&self, record: &NewDeliveryLog) -> Result<i64, AppError> {
        let mut tx = self.pool.begin().await?;

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO delivery_logs \
             (lead_id, campaign_id, tenant_id, channel, status, sent_at, error_message, \
              retry_count, provider_message_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING id",
        )
        .bind(record.lead_id)
        .bind(record.campaign_id)
        .bind(record.tenant_id)
        .bind(record.channel.as_str())
        .bind(record.status.as_str())
        .bind(record.sent_at)
        .bind(&record.error_message)
        .bind(record.retry_count)
        .bind(&record.provider_message_id)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to append delivery log")?;

        if record.status != DeliveryStatus::Failed {
            let flag_update = match record.channel {
                Channel::Email => {
                    "UPDATE leads SET email_sent = TRUE, updated_at = NOW() WHERE id = $1"
                }
                Channel::Chat => {
                    "UPDATE leads SET whatsapp_sent = TRUE, updated_at = NOW() WHERE id = $1"
                }
            };
            sqlx::query(flag_update)
                .bind(record.lead_id)
                .execute(&mut *tx)
                .await
                .context("Failed to mark lead as sent")?;
        }

        tx.commit().await.context("Failed to commit delivery log")?;
        Ok(id)
    }

    async fn query_deliveries(
        &self,
        campaign_id: Uuid,
        filter: &DeliveryFilter,
    ) -> Result<Vec<DeliveryLog>, AppError> {
        sqlx::query(&format!(
            "SELECT {} FROM delivery_logs \
             WHERE campaign_id = $1 \
               AND ($2::text IS NULL OR channel = $2) \
               AND ($3::text IS NULL OR status = $3) \
               AND ($4::uuid IS NULL OR lead_id = $4) \
             ORDER BY id DESC \
             LIMIT $5 OFFSET $6",
            DELIVERY_COLUMNS
        ))
        .bind(campaign_id)
        .bind(filter.channel.map(|c| c.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.lead_id)
        .bind(filter.limit.map(|l| l.max(0)))
        .bind(filter.offset.unwrap_or(0).max(0))
        .fetch_all(&self.pool)
        .await
        .context("Failed to query delivery logs")?
        .iter()
        .map(delivery_from_row)
        .collect()
    }

    async fn get_delivery(&self, log_id: i64) -> Result<Option<DeliveryLog>, AppError> {
        sqlx::query(&format!(
            "SELECT {} FROM delivery_logs WHERE id = $1",
            DELIVERY_COLUMNS
        ))
        .bind(log_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load delivery log")?
        .as_ref()
        .map(delivery_from_row)
        .transpose()
    }

    async fn advance_delivery(
        &self,
        log_id: i64,
        event: EngagementEvent,
        at: DateTime<Utc>,
    ) -> Result<Option<DeliveryLog>, AppError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM delivery_logs WHERE id = $1 FOR UPDATE",
            DELIVERY_COLUMNS
        ))
        .bind(log_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(current) = row.as_ref().map(delivery_from_row).transpose()? else {
            return Ok(None);
        };

        let Some(next) = current.status.advance(event) else {
            return Ok(Some(current));
        };

        let opened = matches!(event, EngagementEvent::Opened | EngagementEvent::Clicked);
        let clicked = event == EngagementEvent::Clicked;
        let replied = event == EngagementEvent::Replied;

        let updated = sqlx::query(&format!(
            "UPDATE delivery_logs SET status = $2, \
               opened_at = CASE WHEN $3 THEN COALESCE(opened_at, $6) ELSE opened_at END, \
               clicked_at = CASE WHEN $4 THEN COALESCE(clicked_at, $6) ELSE clicked_at END, \
               replied_at = CASE WHEN $5 THEN COALESCE(replied_at, $6) ELSE replied_at END \
             WHERE id = $1 RETURNING {}",
            DELIVERY_COLUMNS
        ))
        .bind(log_id)
        .bind(next.as_str())
        .bind(opened)
        .bind(clicked)
        .bind(replied)
        .bind(at)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to advance delivery log")?;

        if replied {
            sqlx::query("UPDATE leads SET replied = TRUE, updated_at = NOW() WHERE id = $1")
                .bind(current.lead_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        delivery_from_row(&updated).map(Some)
    }

    async fn delivery_counts(
        &self,
        campaign_id: Uuid,
        channel: Option<Channel>,
    ) -> Result<DeliveryCounts, AppError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS attempts, \
               COUNT(*) FILTER (WHERE status IN ('sent', 'opened', 'clicked', 'replied')) AS sent, \
               COUNT(*) FILTER (WHERE status = 'failed') AS failed, \
               COUNT(*) FILTER (WHERE status = 'bounced') AS bounced, \
               COUNT(opened_at) AS opened, \
               COUNT(clicked_at) AS clicked, \
               COUNT(replied_at) AS replied \
             FROM delivery_logs \
             WHERE campaign_id = $1 AND ($2::text IS NULL OR channel = $2)",
        )
        .bind(campaign_id)
        .bind(channel.map(|c| c.as_str()))
        .fetch_one(&self.pool)
        .await
        .context("Failed to count delivery logs")?;

        Ok(DeliveryCounts {
            attempts: row.try_get("attempts")?,
            sent: row.try_get("sent")?,
            failed: row.try_get("failed")?,
            bounced: row.try_get("bounced")?,
            opened: row.try_get("opened")?,
            clicked: row.try_get("clicked")?,
            replied: row.try_get("replied")?,
        })
    }
}

#[async_trait]
impl JobRepository for PgStore {
    async fn create_job(&self, job: &Job) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO outreach_jobs \
             (id, tenant_id, campaign_id, operation, status, lead_ids, summary, \
              credentials_fingerprint, error_message, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(job.id)
        .bind(job.tenant_id)
        .bind(job.campaign_id)
        .bind(job.operation.as_str())
        .bind(job.status.as_str())
        .bind(&job.lead_ids)
        .bind(Json(&job.summary))
        .bind(&job.credentials_fingerprint)
        .bind(&job.error_message)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to create job")?;
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, AppError> {
        sqlx::query(&format!("SELECT {} FROM outreach_jobs WHERE id = $1", JOB_COLUMNS))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load job")?
            .as_ref()
            .map(job_from_row)
            .transpose()
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE outreach_jobs SET status = $2, \
               error_message = COALESCE($3, error_message), \
               started_at = CASE WHEN $4 THEN NOW() ELSE started_at END, \
               finished_at = CASE WHEN $5 THEN NOW() ELSE finished_at END \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(error_message)
        .bind(status == JobStatus::Running)
        .bind(status.is_terminal())
        .execute(&self.pool)
        .await
        .context("Failed to update job status")?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Job {} not found", job_id)));
        }
        Ok(())
    }

    async fn update_job_progress(
        &self,
        job_id: Uuid,
        summary: &BatchSummary,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE outreach_jobs SET summary = $2 WHERE id = $1")
            .bind(job_id)
            .bind(Json(summary))
            .execute(&self.pool)
            .await
            .context("Failed to persist job progress")?;
        Ok(())
    }

    async fn list_jobs_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, AppError> {
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        sqlx::query(&format!(
            "SELECT {} FROM outreach_jobs WHERE status = ANY($1) ORDER BY created_at",
            JOB_COLUMNS
        ))
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list jobs")?
        .iter()
        .map(job_from_row)
        .collect()
    }
}
