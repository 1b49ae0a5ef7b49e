use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::AppError;

// ============ Tenancy ============

/// An isolated customer organization with a lead ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    /// Plan label (e.g. "free", "pro"); billing itself lives elsewhere.
    pub plan: String,
    pub leads_quota: i64,
    pub leads_used: i64,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn remaining_quota(&self) -> i64 {
        (self.leads_quota - self.leads_used).max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Active => "active",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
        }
    }

    /// Whether outbound sends may run for a campaign in this state.
    pub fn accepts_sends(&self) -> bool {
        matches!(self, CampaignStatus::Draft | CampaignStatus::Active)
    }
}

impl FromStr for CampaignStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "active" => Ok(CampaignStatus::Active),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            other => Err(AppError::InternalError(format!(
                "Unknown campaign status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub status: CampaignStatus,
    pub max_leads: i64,
    pub leads_count: i64,
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    pub fn remaining_capacity(&self) -> i64 {
        (self.max_leads - self.leads_count).max(0)
    }
}

// ============ Leads ============

/// A contact record. Contact fields are immutable after import; generated
/// fields belong to the content generator, `*_sent` flags to the senders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub email: Option<String>,
    pub generated_description: Option<String>,
    pub generated_email_subject: Option<String>,
    pub generated_email: Option<String>,
    pub generated_whatsapp: Option<String>,
    pub email_sent: bool,
    pub whatsapp_sent: bool,
    pub replied: bool,
    pub lead_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn sent_on(&self, channel: Channel) -> bool {
        match channel {
            Channel::Email => self.email_sent,
            Channel::Chat => self.whatsapp_sent,
        }
    }

    /// First word of the lead name, used for `{{first_name}}`.
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or("")
    }
}

/// Normalized contact record handed over by an import connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLead {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub subject: String,
    pub body: String,
    pub ai_personalization: bool,
    pub times_used: i64,
}

/// Tenant-supplied context for generation (sender identity, offer, tone).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationContext {
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub sender_company: Option<String>,
    /// What the tenant is offering, in their own words.
    #[serde(default)]
    pub offer: Option<String>,
    #[serde(default)]
    pub tone: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    /// Extra placeholder values, addressable as `{{key}}`.
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

// ============ Delivery ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    /// WhatsApp chat messages.
    #[serde(alias = "whatsapp")]
    Chat,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Chat => "chat",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Channel::Email),
            "chat" | "whatsapp" => Ok(Channel::Chat),
            other => Err(AppError::Validation(format!("Unknown channel '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
    Bounced,
    Opened,
    Clicked,
    Replied,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Bounced => "bounced",
            DeliveryStatus::Opened => "opened",
            DeliveryStatus::Clicked => "clicked",
            DeliveryStatus::Replied => "replied",
        }
    }

    /// Reached the provider successfully (counts towards `sent_count`).
    pub fn is_delivered(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Sent
                | DeliveryStatus::Opened
                | DeliveryStatus::Clicked
                | DeliveryStatus::Replied
        )
    }

    /// Position on the engagement ladder; statuses only move upwards.
    fn rank(&self) -> u8 {
        match self {
            DeliveryStatus::Pending => 0,
            DeliveryStatus::Failed => 1,
            DeliveryStatus::Sent => 2,
            DeliveryStatus::Bounced => 3,
            DeliveryStatus::Opened => 3,
            DeliveryStatus::Clicked => 4,
            DeliveryStatus::Replied => 5,
        }
    }

    /// Status after applying an engagement event, or `None` if the event
    /// does not apply (failed rows, bounces after engagement, regressions).
    pub fn advance(&self, event: EngagementEvent) -> Option<DeliveryStatus> {
        if !self.is_delivered() && *self != DeliveryStatus::Bounced {
            return None;
        }
        let target = match event {
            EngagementEvent::Bounced => {
                return (*self == DeliveryStatus::Sent).then_some(DeliveryStatus::Bounced)
            }
            EngagementEvent::Opened => DeliveryStatus::Opened,
            EngagementEvent::Clicked => DeliveryStatus::Clicked,
            EngagementEvent::Replied => DeliveryStatus::Replied,
        };
        if *self == DeliveryStatus::Bounced {
            return None;
        }
        Some(if target.rank() > self.rank() { target } else { *self })
    }
}

impl FromStr for DeliveryStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            "bounced" => Ok(DeliveryStatus::Bounced),
            "opened" => Ok(DeliveryStatus::Opened),
            "clicked" => Ok(DeliveryStatus::Clicked),
            "replied" => Ok(DeliveryStatus::Replied),
            other => Err(AppError::Validation(format!(
                "Unknown delivery status '{}'",
                other
            ))),
        }
    }
}

/// Provider/tracking event that may advance a delivery row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementEvent {
    Opened,
    Clicked,
    Replied,
    Bounced,
}

/// Content handed to a channel sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundContent {
    pub subject: Option<String>,
    pub body: String,
}

/// A delivery attempt as produced by a channel sender, before it gets an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDeliveryLog {
    pub lead_id: Uuid,
    pub campaign_id: Uuid,
    pub tenant_id: Uuid,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub provider_message_id: Option<String>,
}

impl NewDeliveryLog {
    pub fn sent(lead: &Lead, channel: Channel, provider_message_id: String, retries: u32) -> Self {
        Self {
            lead_id: lead.id,
            campaign_id: lead.campaign_id,
            tenant_id: lead.tenant_id,
            channel,
            status: DeliveryStatus::Sent,
            sent_at: Some(Utc::now()),
            error_message: None,
            retry_count: retries as i32,
            provider_message_id: Some(provider_message_id),
        }
    }

    pub fn failed(lead: &Lead, channel: Channel, error_message: String, retries: u32) -> Self {
        Self {
            lead_id: lead.id,
            campaign_id: lead.campaign_id,
            tenant_id: lead.tenant_id,
            channel,
            status: DeliveryStatus::Failed,
            sent_at: None,
            error_message: Some(error_message),
            retry_count: retries as i32,
            provider_message_id: None,
        }
    }
}

/// One row of the append-only delivery ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLog {
    pub id: i64,
    pub lead_id: Uuid,
    pub campaign_id: Uuid,
    pub tenant_id: Uuid,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub provider_message_id: Option<String>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub replied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryFilter {
    #[serde(default)]
    pub channel: Option<Channel>,
    #[serde(default)]
    pub status: Option<DeliveryStatus>,
    #[serde(default)]
    pub lead_id: Option<Uuid>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl DeliveryFilter {
    pub fn matches(&self, log: &DeliveryLog) -> bool {
        self.channel.map_or(true, |c| c == log.channel)
            && self.status.map_or(true, |s| s == log.status)
            && self.lead_id.map_or(true, |id| id == log.lead_id)
    }
}

/// Raw counters the analytics are derived from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryCounts {
    pub attempts: i64,
    pub sent: i64,
    pub failed: i64,
    pub bounced: i64,
    pub opened: i64,
    pub clicked: i64,
    pub replied: i64,
}

impl DeliveryCounts {
    pub fn tally(logs: &[DeliveryLog]) -> Self {
        let mut counts = DeliveryCounts::default();
        for log in logs {
            counts.attempts += 1;
            if log.status.is_delivered() {
                counts.sent += 1;
            }
            match log.status {
                DeliveryStatus::Failed => counts.failed += 1,
                DeliveryStatus::Bounced => counts.bounced += 1,
                _ => {}
            }
            if log.opened_at.is_some() {
                counts.opened += 1;
            }
            if log.clicked_at.is_some() {
                counts.clicked += 1;
            }
            if log.replied_at.is_some() {
                counts.replied += 1;
            }
        }
        counts
    }
}

// ============ Bulk operations & jobs ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    GenerateDescriptions,
    GenerateEmails,
    GenerateWhatsapp,
    SendEmails,
    SendWhatsapp,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::GenerateDescriptions => "generate_descriptions",
            Operation::GenerateEmails => "generate_emails",
            Operation::GenerateWhatsapp => "generate_whatsapp",
            Operation::SendEmails => "send_emails",
            Operation::SendWhatsapp => "send_whatsapp",
        }
    }

    /// Channel used by send operations.
    pub fn channel(&self) -> Option<Channel> {
        match self {
            Operation::SendEmails => Some(Channel::Email),
            Operation::SendWhatsapp => Some(Channel::Chat),
            _ => None,
        }
    }
}

impl FromStr for Operation {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generate_descriptions" => Ok(Operation::GenerateDescriptions),
            "generate_emails" => Ok(Operation::GenerateEmails),
            "generate_whatsapp" => Ok(Operation::GenerateWhatsapp),
            "send_emails" => Ok(Operation::SendEmails),
            "send_whatsapp" => Ok(Operation::SendWhatsapp),
            other => Err(AppError::Validation(format!("Unknown operation '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub lead_id: Uuid,
    pub reason: String,
}

/// Terminal (or in-progress) summary of a bulk operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: Vec<ItemError>,
    pub cancelled: bool,
}

impl BatchSummary {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn processed(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }

    pub fn record(&mut self, lead_id: Uuid, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Succeeded => self.succeeded += 1,
            ItemOutcome::Skipped(_) => self.skipped += 1,
            ItemOutcome::Failed(reason) => {
                self.failed += 1;
                self.errors.push(ItemError {
                    lead_id,
                    reason: reason.clone(),
                });
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed
        )
    }
}

impl FromStr for JobStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "failed" => Ok(JobStatus::Failed),
            other => Err(AppError::InternalError(format!(
                "Unknown job status '{}'",
                other
            ))),
        }
    }
}

/// A persisted, queryable bulk operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub campaign_id: Uuid,
    pub operation: Operation,
    pub status: JobStatus,
    pub lead_ids: Vec<Uuid>,
    pub summary: BatchSummary,
    /// SHA-256 of the run's channel credentials; the credentials themselves are never stored.
    pub credentials_fingerprint: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn queued(
        tenant_id: Uuid,
        campaign_id: Uuid,
        operation: Operation,
        lead_ids: Vec<Uuid>,
        credentials_fingerprint: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            campaign_id,
            operation,
            status: JobStatus::Queued,
            summary: BatchSummary::new(lead_ids.len()),
            lead_ids,
            credentials_fingerprint,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Result of a quota-guarded lead import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSummary {
    pub requested: usize,
    pub imported: usize,
    pub rejected: usize,
    pub lead_ids: Vec<Uuid>,
}
