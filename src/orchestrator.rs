//! Bulk operations over the leads of one campaign.
//!
//! [`BatchOrchestrator::prepare`] validates everything that can abort a run
//! before any side effect happens; [`BatchOrchestrator::run`] then walks the
//! leads one at a time, persisting each outcome as it goes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::contact::{contact_score, is_valid_email, normalize_phone};
use crate::credentials::ChannelCredentials;
use crate::errors::{AppError, ResultExt};
use crate::generation::{ContentGenerator, GenerationKind};
use crate::ledger::DeliveryLedger;
use crate::models::{
    BatchSummary, Campaign, Channel, GenerationContext, ImportSummary, ItemOutcome, Lead,
    NewLead, Operation, OutboundContent, Template,
};
use crate::quota::QuotaGuard;
use crate::senders::{ChannelSender, Throttle};
use crate::store::Store;

const CANCELLED: &str = "cancelled";

/// A bulk operation as requested by a tenant.
#[derive(Debug, Clone)]
pub struct BulkRequest {
    pub tenant_id: Uuid,
    pub campaign_id: Uuid,
    pub operation: Operation,
    /// Leads to process, in order; empty means every lead of the campaign.
    pub lead_ids: Vec<Uuid>,
    pub template_id: Option<Uuid>,
    pub context: GenerationContext,
    /// Required for send operations; used for this run only.
    pub credentials: Option<ChannelCredentials>,
    /// Regenerate content that already exists instead of skipping the lead.
    pub overwrite: bool,
}

/// A request that passed preflight and may be run.
#[derive(Debug)]
pub struct PreparedBatch {
    pub tenant_id: Uuid,
    pub campaign: Campaign,
    pub operation: Operation,
    pub lead_ids: Vec<Uuid>,
    pub template: Option<Template>,
    pub context: GenerationContext,
    pub credentials: Option<ChannelCredentials>,
    pub overwrite: bool,
}

pub struct BatchOrchestrator {
    store: Arc<dyn Store>,
    generator: Arc<ContentGenerator>,
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
    ledger: DeliveryLedger,
    quota: QuotaGuard,
    throttle: Throttle,
    default_region: String,
}

impl BatchOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        generator: Arc<ContentGenerator>,
        senders: Vec<Arc<dyn ChannelSender>>,
        throttle: Throttle,
        default_region: impl Into<String>,
    ) -> Self {
        let senders = senders
            .into_iter()
            .map(|sender| (sender.channel(), sender))
            .collect();

        Self {
            ledger: DeliveryLedger::new(store.clone()),
            quota: QuotaGuard::new(store.clone()),
            store,
            generator,
            senders,
            throttle,
            default_region: default_region.into(),
        }
    }

    pub fn sender(&self, channel: Channel) -> Option<Arc<dyn ChannelSender>> {
        self.senders.get(&channel).cloned()
    }

    /// Load the campaign and check that it belongs to the tenant.
    pub async fn owned_campaign(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
    ) -> Result<Campaign, AppError> {
        let campaign = self
            .store
            .get_campaign(campaign_id)
            .await?
            .ok_or_else(|| AppError::Validation(format!("Campaign {} does not exist", campaign_id)))?;

        if campaign.tenant_id != tenant_id {
            return Err(AppError::Ownership(format!(
                "Campaign {} does not belong to tenant {}",
                campaign_id, tenant_id
            )));
        }
        Ok(campaign)
    }

    /// Fail-fast validation. Nothing is written.
    pub async fn prepare(&self, request: BulkRequest) -> Result<PreparedBatch, AppError> {
        let campaign = self
            .owned_campaign(request.tenant_id, request.campaign_id)
            .await?;

        let lead_ids = if request.lead_ids.is_empty() {
            self.store.list_campaign_lead_ids(campaign.id).await?
        } else {
            let mut seen = HashSet::new();
            request
                .lead_ids
                .iter()
                .copied()
                .filter(|id| seen.insert(*id))
                .collect()
        };

        for lead in self.store.get_leads(&lead_ids).await? {
            if lead.tenant_id != request.tenant_id {
                return Err(AppError::Ownership(format!(
                    "Lead {} does not belong to tenant {}",
                    lead.id, request.tenant_id
                )));
            }
            if lead.campaign_id != campaign.id {
                return Err(AppError::Validation(format!(
                    "Lead {} is not part of campaign {}",
                    lead.id, campaign.id
                )));
            }
        }

        let template = match request.template_id {
            Some(template_id) => {
                let template = self
                    .store
                    .get_template(template_id)
                    .await?
                    .ok_or_else(|| {
                        AppError::Validation(format!("Template {} does not exist", template_id))
                    })?;
                if template.tenant_id != request.tenant_id {
                    return Err(AppError::Ownership(format!(
                        "Template {} does not belong to tenant {}",
                        template_id, request.tenant_id
                    )));
                }
                Some(template)
            }
            None => None,
        };

        if let Some(channel) = request.operation.channel() {
            if !campaign.status.accepts_sends() {
                return Err(AppError::Validation(format!(
                    "Campaign {} is {}; sends are not allowed",
                    campaign.id,
                    campaign.status.as_str()
                )));
            }

            let credentials = request.credentials.as_ref().ok_or_else(|| {
                AppError::Validation(format!("{} requires {} credentials", request.operation.as_str(), channel))
            })?;
            if credentials.channel() != channel {
                return Err(AppError::Validation(format!(
                    "{} requires {} credentials, got {}",
                    request.operation.as_str(),
                    channel,
                    credentials.channel()
                )));
            }

            self.check_credentials(credentials).await?;
        }

        tracing::info!(
            "Preflight passed: {} on campaign {} ({} leads)",
            request.operation.as_str(),
            campaign.id,
            lead_ids.len()
        );

        Ok(PreparedBatch {
            tenant_id: request.tenant_id,
            campaign,
            operation: request.operation,
            lead_ids,
            template,
            context: request.context,
            credentials: request.credentials,
            overwrite: request.overwrite,
        })
    }

    /// Run `test_connection` for the credentials' channel.
    pub async fn check_credentials(&self, credentials: &ChannelCredentials) -> Result<(), AppError> {
        let channel = credentials.channel();
        let sender = self
            .sender(channel)
            .ok_or_else(|| AppError::InternalError(format!("No sender configured for {}", channel)))?;

        sender.test_connection(credentials).await.map_err(|e| {
            tracing::warn!("{} credentials rejected: {}", channel, e);
            AppError::InvalidCredentials(format!("{} connection test failed: {}", channel, e.reason()))
        })
    }

    /// Prepare and run in one go, without a job record.
    pub async fn execute(
        &self,
        request: BulkRequest,
        cancel: &AtomicBool,
    ) -> Result<BatchSummary, AppError> {
        let prepared = self.prepare(request).await?;
        self.run(&prepared, cancel, None).await
    }

    /// Process every lead sequentially. Item failures are recorded in the
    /// summary; only a cancelled flag stops the walk early.
    pub async fn run(
        &self,
        prepared: &PreparedBatch,
        cancel: &AtomicBool,
        job_id: Option<Uuid>,
    ) -> Result<BatchSummary, AppError> {
        let mut summary = BatchSummary::new(prepared.lead_ids.len());
        let mut dispatched = false;

        tracing::info!(
            "Starting {} for campaign {} ({} leads)",
            prepared.operation.as_str(),
            prepared.campaign.id,
            summary.total
        );

        let mut pending = prepared.lead_ids.iter().copied();
        while let Some(lead_id) = pending.next() {
            if cancel.load(Ordering::SeqCst) {
                summary.record(lead_id, &ItemOutcome::Skipped(CANCELLED.to_string()));
                for rest in pending.by_ref() {
                    summary.record(rest, &ItemOutcome::Skipped(CANCELLED.to_string()));
                }
                summary.cancelled = true;
                break;
            }

            let outcome = match self
                .process_lead(prepared, lead_id, &mut dispatched, cancel)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("Lead {} could not be processed: {}", lead_id, e);
                    ItemOutcome::Failed(e.to_string())
                }
            };

            match &outcome {
                ItemOutcome::Succeeded => tracing::debug!("Lead {} succeeded", lead_id),
                ItemOutcome::Skipped(reason) => {
                    tracing::debug!("Lead {} skipped: {}", lead_id, reason)
                }
                ItemOutcome::Failed(reason) => tracing::warn!("Lead {} failed: {}", lead_id, reason),
            }
            summary.record(lead_id, &outcome);

            if outcome == ItemOutcome::Skipped(CANCELLED.to_string()) {
                for rest in pending.by_ref() {
                    summary.record(rest, &ItemOutcome::Skipped(CANCELLED.to_string()));
                }
                summary.cancelled = true;
            }

            if let Some(job_id) = job_id {
                if let Err(e) = self.store.update_job_progress(job_id, &summary).await {
                    tracing::warn!("Failed to persist progress of job {}: {}", job_id, e);
                }
            }
        }

        // once per generation run that carries a template, whatever the outcome
        if let Some(template) = &prepared.template {
            if prepared.operation.channel().is_none() {
                self.store
                    .increment_template_usage(template.id)
                    .await
                    .context("Failed to record template usage")?;
            }
        }

        tracing::info!(
            "✓ {} finished for campaign {}: {} succeeded, {} failed, {} skipped{}",
            prepared.operation.as_str(),
            prepared.campaign.id,
            summary.succeeded,
            summary.failed,
            summary.skipped,
            if summary.cancelled { " (cancelled)" } else { "" }
        );
        Ok(summary)
    }

    async fn process_lead(
        &self,
        prepared: &PreparedBatch,
        lead_id: Uuid,
        dispatched: &mut bool,
        cancel: &AtomicBool,
    ) -> Result<ItemOutcome, AppError> {
        let Some(lead) = self.store.get_lead(lead_id).await? else {
            return Ok(ItemOutcome::Failed("lead not found".to_string()));
        };
        if lead.tenant_id != prepared.tenant_id {
            return Ok(ItemOutcome::Failed("lead belongs to another tenant".to_string()));
        }
        if lead.campaign_id != prepared.campaign.id {
            return Ok(ItemOutcome::Failed("lead is not part of this campaign".to_string()));
        }

        match prepared.operation {
            Operation::GenerateDescriptions => {
                if lead.generated_description.is_some() && !prepared.overwrite {
                    return Ok(ItemOutcome::Skipped("description already generated".to_string()));
                }
                self.generate_item(prepared, &lead, GenerationKind::Description).await
            }
            Operation::GenerateEmails => {
                if lead.generated_email.is_some() && !prepared.overwrite {
                    return Ok(ItemOutcome::Skipped("email already generated".to_string()));
                }
                self.generate_item(prepared, &lead, GenerationKind::Email).await
            }
            Operation::GenerateWhatsapp => {
                if lead.generated_whatsapp.is_some() && !prepared.overwrite {
                    return Ok(ItemOutcome::Skipped("message already generated".to_string()));
                }
                self.generate_item(prepared, &lead, GenerationKind::Whatsapp).await
            }
            Operation::SendEmails => {
                self.send_item(prepared, &lead, Channel::Email, dispatched, cancel)
                    .await
            }
            Operation::SendWhatsapp => {
                self.send_item(prepared, &lead, Channel::Chat, dispatched, cancel)
                    .await
            }
        }
    }

    async fn generate_item(
        &self,
        prepared: &PreparedBatch,
        lead: &Lead,
        kind: GenerationKind,
    ) -> Result<ItemOutcome, AppError> {
        let content = match self
            .generator
            .generate(kind, lead, prepared.template.as_ref(), &prepared.context)
            .await
        {
            Ok(content) => content,
            Err(e) => return Ok(ItemOutcome::Failed(e.to_string())),
        };

        match kind {
            GenerationKind::Description => {
                let score = contact_score(
                    lead.email.as_deref(),
                    lead.phone.as_deref(),
                    lead.website.as_deref(),
                    lead.address.as_deref(),
                    &self.default_region,
                );
                self.store
                    .save_description(lead.id, &content.body, score)
                    .await?;
            }
            GenerationKind::Email => {
                self.store
                    .save_generated_email(lead.id, content.subject.as_deref(), &content.body)
                    .await?;
            }
            GenerationKind::Whatsapp => {
                self.store
                    .save_generated_whatsapp(lead.id, &content.body)
                    .await?;
            }
        }
        Ok(ItemOutcome::Succeeded)
    }

    async fn send_item(
        &self,
        prepared: &PreparedBatch,
        lead: &Lead,
        channel: Channel,
        dispatched: &mut bool,
        cancel: &AtomicBool,
    ) -> Result<ItemOutcome, AppError> {
        if lead.sent_on(channel) {
            return Ok(ItemOutcome::Skipped("already sent".to_string()));
        }

        let content = match channel {
            Channel::Email => {
                let Some(body) = lead.generated_email.clone() else {
                    return Ok(ItemOutcome::Failed("no generated email".to_string()));
                };
                if !lead.email.as_deref().map_or(false, is_valid_email) {
                    return Ok(ItemOutcome::Failed("invalid or missing email address".to_string()));
                }
                OutboundContent {
                    subject: Some(
                        lead.generated_email_subject
                            .clone()
                            .unwrap_or_else(|| format!("A quick idea for {}", lead.name)),
                    ),
                    body,
                }
            }
            Channel::Chat => {
                let Some(body) = lead.generated_whatsapp.clone() else {
                    return Ok(ItemOutcome::Failed("no generated message".to_string()));
                };
                let Some(phone) = lead.phone.as_deref() else {
                    return Ok(ItemOutcome::Failed("missing phone number".to_string()));
                };
                if let Err(reason) = normalize_phone(phone, &self.default_region) {
                    return Ok(ItemOutcome::Failed(format!("invalid phone number: {}", reason)));
                }
                OutboundContent {
                    subject: None,
                    body,
                }
            }
        };

        let sender = self
            .sender(channel)
            .ok_or_else(|| AppError::InternalError(format!("No sender configured for {}", channel)))?;
        let credentials = prepared
            .credentials
            .as_ref()
            .ok_or_else(|| AppError::InternalError("send run without credentials".to_string()))?;

        if *dispatched {
            let delay = self.throttle.next_delay();
            tracing::debug!("Throttling {} for {}ms", channel, delay.as_millis());
            tokio::time::sleep(delay).await;
            if cancel.load(Ordering::SeqCst) {
                return Ok(ItemOutcome::Skipped(CANCELLED.to_string()));
            }
        }
        *dispatched = true;

        let record = sender.send(lead, &content, credentials).await;
        let failure = record.error_message.clone();
        let delivered = record.status.is_delivered();
        if let Err(e) = self.ledger.append(&record).await {
            if !delivered {
                return Err(e);
            }
            tracing::error!(
                "Lead {} was sent via {} but the delivery could not be recorded: {}",
                lead.id,
                channel,
                e
            );
            return Ok(ItemOutcome::Failed(format!(
                "sent via {} but not recorded: {}",
                channel, e
            )));
        }

        Ok(if delivered {
            ItemOutcome::Succeeded
        } else {
            ItemOutcome::Failed(failure.unwrap_or_else(|| "delivery failed".to_string()))
        })
    }

    /// Quota-guarded import of normalised lead records into a campaign.
    pub async fn import_leads(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        leads: Vec<NewLead>,
    ) -> Result<ImportSummary, AppError> {
        let campaign = self.owned_campaign(tenant_id, campaign_id).await?;
        if leads.is_empty() {
            return Err(AppError::Validation("No leads to import".to_string()));
        }

        let requested = leads.len();
        let valid: Vec<NewLead> = leads
            .into_iter()
            .filter(|lead| !lead.name.trim().is_empty())
            .collect();
        if valid.is_empty() {
            return Err(AppError::Validation("Every lead is missing a name".to_string()));
        }

        let allowed = self
            .quota
            .check_and_reserve_for_campaign(tenant_id, campaign.id, valid.len() as i64)
            .await?;
        let to_insert = &valid[..(allowed as usize).min(valid.len())];

        match self.store.insert_leads(tenant_id, campaign.id, to_insert).await {
            Ok(lead_ids) => {
                tracing::info!(
                    "✓ Imported {}/{} leads into campaign {}",
                    lead_ids.len(),
                    requested,
                    campaign.id
                );
                Ok(ImportSummary {
                    requested,
                    imported: lead_ids.len(),
                    rejected: requested - lead_ids.len(),
                    lead_ids,
                })
            }
            Err(e) => {
                tracing::error!("Lead import into campaign {} failed: {}", campaign.id, e);
                if let Err(release_err) = self.quota.release(tenant_id, Some(campaign.id), allowed).await {
                    tracing::error!("Failed to release reserved lead capacity: {}", release_err);
                }
                Err(e)
            }
        }
    }
}
