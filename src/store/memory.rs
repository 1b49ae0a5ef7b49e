//! In-process store used by tests and single-node local runs.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{DeliveryLogRepository, JobRepository, LeadRepository, TenantRepository};
use crate::errors::AppError;
use crate::models::{
    BatchSummary, Campaign, CampaignStatus, Channel, DeliveryCounts, DeliveryFilter, DeliveryLog,
    DeliveryStatus, EngagementEvent, Job, JobStatus, Lead, NewDeliveryLog, NewLead, Template,
    Tenant,
};

#[derive(Default)]
struct State {
    tenants: HashMap<Uuid, Tenant>,
    campaigns: HashMap<Uuid, Campaign>,
    templates: HashMap<Uuid, Template>,
    leads: HashMap<Uuid, Lead>,
    lead_order: Vec<Uuid>,
    deliveries: Vec<DeliveryLog>,
    jobs: HashMap<Uuid, Job>,
}

/// A single mutex guards all state, which makes every trait method atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    reject_deliveries: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, AppError> {
        self.state
            .lock()
            .map_err(|_| AppError::InternalError("memory store lock poisoned".to_string()))
    }

    pub fn add_tenant(&self, name: &str, leads_quota: i64) -> Result<Tenant, AppError> {
        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: name.to_string(),
            plan: "standard".to_string(),
            leads_quota,
            leads_used: 0,
            created_at: Utc::now(),
        };
        self.lock()?.tenants.insert(tenant.id, tenant.clone());
        Ok(tenant)
    }

    pub fn add_campaign(
        &self,
        tenant_id: Uuid,
        name: &str,
        status: CampaignStatus,
        max_leads: i64,
    ) -> Result<Campaign, AppError> {
        let campaign = Campaign {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.to_string(),
            status,
            max_leads,
            leads_count: 0,
            created_at: Utc::now(),
        };
        self.lock()?.campaigns.insert(campaign.id, campaign.clone());
        Ok(campaign)
    }

    pub fn add_template(
        &self,
        tenant_id: Uuid,
        subject: &str,
        body: &str,
        ai_personalization: bool,
    ) -> Result<Template, AppError> {
        let template = Template {
            id: Uuid::new_v4(),
            tenant_id,
            name: subject.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            ai_personalization,
            times_used: 0,
        };
        self.lock()?.templates.insert(template.id, template.clone());
        Ok(template)
    }

    /// Insert a fully-formed lead, bypassing quota (fixtures, connector replays).
    pub fn put_lead(&self, lead: Lead) -> Result<(), AppError> {
        let mut state = self.lock()?;
        if !state.leads.contains_key(&lead.id) {
            state.lead_order.push(lead.id);
        }
        state.leads.insert(lead.id, lead);
        Ok(())
    }

    /// Make `append_delivery` fail until switched back, as a lost database would.
    pub fn reject_delivery_appends(&self, reject: bool) {
        self.reject_deliveries.store(reject, Ordering::SeqCst);
    }

    pub fn delivery_rows(&self) -> Result<Vec<DeliveryLog>, AppError> {
        Ok(self.lock()?.deliveries.clone())
    }
}

#[async_trait]
impl TenantRepository for MemoryStore {
    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>, AppError> {
        Ok(self.lock()?.tenants.get(&tenant_id).cloned())
    }

    async fn get_campaign(&self, campaign_id: Uuid) -> Result<Option<Campaign>, AppError> {
        Ok(self.lock()?.campaigns.get(&campaign_id).cloned())
    }

    async fn get_template(&self, template_id: Uuid) -> Result<Option<Template>, AppError> {
        Ok(self.lock()?.templates.get(&template_id).cloned())
    }

    async fn increment_template_usage(&self, template_id: Uuid) -> Result<(), AppError> {
        if let Some(template) = self.lock()?.templates.get_mut(&template_id) {
            template.times_used += 1;
        }
        Ok(())
    }

    async fn reserve_lead_capacity(
        &self,
        tenant_id: Uuid,
        campaign_id: Option<Uuid>,
        requested: i64,
    ) -> Result<i64, AppError> {
        let mut state = self.lock()?;
        let tenant_remaining = state
            .tenants
            .get(&tenant_id)
            .map(Tenant::remaining_quota)
            .ok_or_else(|| AppError::NotFound(format!("Tenant {} not found", tenant_id)))?;

        let campaign_remaining = match campaign_id {
            Some(id) => state
                .campaigns
                .get(&id)
                .map(Campaign::remaining_capacity)
                .ok_or_else(|| AppError::NotFound(format!("Campaign {} not found", id)))?,
            None => i64::MAX,
        };

        let allowed = requested.min(tenant_remaining).min(campaign_remaining).max(0);
        if allowed > 0 {
            if let Some(tenant) = state.tenants.get_mut(&tenant_id) {
                tenant.leads_used += allowed;
            }
            if let Some(campaign) = campaign_id.and_then(|id| state.campaigns.get_mut(&id)) {
                campaign.leads_count += allowed;
            }
        }
        Ok(allowed)
    }

    async fn release_lead_capacity(
        &self,
        tenant_id: Uuid,
        campaign_id: Option<Uuid>,
        count: i64,
    ) -> Result<(), AppError> {
        let mut state = self.lock()?;
        if let Some(tenant) = state.tenants.get_mut(&tenant_id) {
            tenant.leads_used = (tenant.leads_used - count).max(0);
        }
        if let Some(campaign) = campaign_id.and_then(|id| state.campaigns.get_mut(&id)) {
            campaign.leads_count = (campaign.leads_count - count).max(0);
        }
        Ok(())
    }
}

#[async_trait]
impl LeadRepository for MemoryStore {
    async fn get_lead(&self, lead_id: Uuid) -> Result<Option<Lead>, AppError> {
        Ok(self.lock()?.leads.get(&lead_id).cloned())
    }

    async fn get_leads(&self, lead_ids: &[Uuid]) -> Result<Vec<Lead>, AppError> {
        let state = self.lock()?;
        Ok(lead_ids
            .iter()
            .filter_map(|id| state.leads.get(id).cloned())
            .collect())
    }

    async fn list_campaign_lead_ids(&self, campaign_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        let state = self.lock()?;
        Ok(state
            .lead_order
            .iter()
            .filter(|id| {
                state
                    .leads
                    .get(id)
                    .map_or(false, |lead| lead.campaign_id == campaign_id)
            })
            .copied()
            .collect())
    }

    async fn insert_leads(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        leads: &[NewLead],
    ) -> Result<Vec<Uuid>, AppError> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let mut ids = Vec::with_capacity(leads.len());
        for new_lead in leads {
            let lead = Lead {
                id: Uuid::new_v4(),
                campaign_id,
                tenant_id,
                name: new_lead.name.clone(),
                address: new_lead.address.clone(),
                phone: new_lead.phone.clone(),
                website: new_lead.website.clone(),
                email: new_lead.email.clone(),
                generated_description: None,
                generated_email_subject: None,
                generated_email: None,
                generated_whatsapp: None,
                email_sent: false,
                whatsapp_sent: false,
                replied: false,
                lead_score: None,
                created_at: now,
                updated_at: now,
            };
            ids.push(lead.id);
            state.lead_order.push(lead.id);
            state.leads.insert(lead.id, lead);
        }
        Ok(ids)
    }

    async fn save_description(
        &self,
        lead_id: Uuid,
        description: &str,
        lead_score: f64,
    ) -> Result<(), AppError> {
        let mut state = self.lock()?;
        let lead = state
            .leads
            .get_mut(&lead_id)
            .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", lead_id)))?;
        lead.generated_description = Some(description.to_string());
        lead.lead_score = Some(lead_score);
        lead.updated_at = Utc::now();
        Ok(())
    }

    async fn save_generated_email(
        &self,
        lead_id: Uuid,
        subject: Option<&str>,
        body: &str,
    ) -> Result<(), AppError> {
        let mut state = self.lock()?;
        let lead = state
            .leads
            .get_mut(&lead_id)
            .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", lead_id)))?;
        lead.generated_email_subject = subject.map(str::to_string);
        lead.generated_email = Some(body.to_string());
        lead.updated_at = Utc::now();
        Ok(())
    }

    async fn save_generated_whatsapp(&self, lead_id: Uuid, message: &str) -> Result<(), AppError> {
        let mut state = self.lock()?;
        let lead = state
            .leads
            .get_mut(&lead_id)
            .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", lead_id)))?;
        lead.generated_whatsapp = Some(message.to_string());
        lead.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl DeliveryLogRepository for MemoryStore {
    async fn append_delivery(&self, record: &NewDeliveryLog) -> Result<i64, AppError> {
        if self.reject_deliveries.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(sqlx::Error::PoolTimedOut));
        }
        let mut state = self.lock()?;
        let id = state.deliveries.len() as i64 + 1;
        state.deliveries.push(DeliveryLog {
            id,
            lead_id: record.lead_id,
            campaign_id: record.campaign_id,
            tenant_id: record.tenant_id,
            channel: record.channel,
            status: record.status,
            sent_at: record.sent_at,
            error_message: record.error_message.clone(),
            retry_count: record.retry_count,
            provider_message_id: record.provider_message_id.clone(),
            opened_at: None,
            clicked_at: None,
            replied_at: None,
            created_at: Utc::now(),
        });
        if record.status != DeliveryStatus::Failed {
            if let Some(lead) = state.leads.get_mut(&record.lead_id) {
                match record.channel {
                    Channel::Email => lead.email_sent = true,
                    Channel::Chat => lead.whatsapp_sent = true,
                }
                lead.updated_at = Utc::now();
            }
        }
        Ok(id)
    }

    async fn query_deliveries(
        &self,
        campaign_id: Uuid,
        filter: &DeliveryFilter,
    ) -> Result<Vec<DeliveryLog>, AppError> {
        let state = self.lock()?;
        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.map_or(usize::MAX, |l| l.max(0) as usize);
        Ok(state
            .deliveries
            .iter()
            .rev()
            .filter(|log| log.campaign_id == campaign_id && filter.matches(log))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_delivery(&self, log_id: i64) -> Result<Option<DeliveryLog>, AppError> {
        Ok(self
            .lock()?
            .deliveries
            .iter()
            .find(|log| log.id == log_id)
            .cloned())
    }

    async fn advance_delivery(
        &self,
        log_id: i64,
        event: EngagementEvent,
        at: DateTime<Utc>,
    ) -> Result<Option<DeliveryLog>, AppError> {
        let mut state = self.lock()?;
        let Some(log) = state.deliveries.iter_mut().find(|log| log.id == log_id) else {
            return Ok(None);
        };
        let Some(next) = log.status.advance(event) else {
            return Ok(Some(log.clone()));
        };
        log.status = next;
        match event {
            EngagementEvent::Opened => {
                log.opened_at.get_or_insert(at);
            }
            EngagementEvent::Clicked => {
                log.opened_at.get_or_insert(at);
                log.clicked_at.get_or_insert(at);
            }
            EngagementEvent::Replied => {
                log.replied_at.get_or_insert(at);
            }
            EngagementEvent::Bounced => {}
        }
        let updated = log.clone();
        if event == EngagementEvent::Replied {
            if let Some(lead) = state.leads.get_mut(&updated.lead_id) {
                lead.replied = true;
                lead.updated_at = Utc::now();
            }
        }
        Ok(Some(updated))
    }

    async fn delivery_counts(
        &self,
        campaign_id: Uuid,
        channel: Option<Channel>,
    ) -> Result<DeliveryCounts, AppError> {
        let state = self.lock()?;
        let rows: Vec<DeliveryLog> = state
            .deliveries
            .iter()
            .filter(|log| {
                log.campaign_id == campaign_id && channel.map_or(true, |c| c == log.channel)
            })
            .cloned()
            .collect();
        Ok(DeliveryCounts::tally(&rows))
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn create_job(&self, job: &Job) -> Result<(), AppError> {
        self.lock()?.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, AppError> {
        Ok(self.lock()?.jobs.get(&job_id).cloned())
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<(), AppError> {
        let mut state = self.lock()?;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))?;
        job.status = status;
        if let Some(message) = error_message {
            job.error_message = Some(message.to_string());
        }
        match status {
            JobStatus::Running => job.started_at = Some(Utc::now()),
            s if s.is_terminal() => job.finished_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    async fn update_job_progress(
        &self,
        job_id: Uuid,
        summary: &BatchSummary,
    ) -> Result<(), AppError> {
        if let Some(job) = self.lock()?.jobs.get_mut(&job_id) {
            job.summary = summary.clone();
        }
        Ok(())
    }

    async fn list_jobs_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, AppError> {
        Ok(self
            .lock()?
            .jobs
            .values()
            .filter(|job| statuses.contains(&job.status))
            .cloned()
            .collect())
    }
}
