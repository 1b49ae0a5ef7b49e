//! Shared fixtures: scriptable generation backend and channel sender,
//! and a pipeline wired to the in-memory store.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

use rust_outreach_api::config::{Config, DeliveryConfig, GenerationConfig};
use rust_outreach_api::credentials::{ChannelCredentials, SmtpCredentials, WhatsAppCredentials};
use rust_outreach_api::errors::{DeliveryError, GenerationError};
use rust_outreach_api::generation::{ContentGenerator, GenerationBackend, Prompt};
use rust_outreach_api::models::{
    Campaign, CampaignStatus, Channel, GenerationContext, Lead, NewLead, Operation, OutboundContent,
    Tenant,
};
use rust_outreach_api::orchestrator::{BatchOrchestrator, BulkRequest};
use rust_outreach_api::senders::{ChannelSender, RetryPolicy, Throttle};
use rust_outreach_api::store::{LeadRepository, MemoryStore, Store};

/// Backend that answers with a fixed text and fails on chosen call numbers (1-based).
pub struct FakeBackend {
    pub calls: AtomicUsize,
    pub fail_on: HashSet<usize>,
    pub reply: String,
    pub delay: Duration,
}

impl FakeBackend {
    pub fn replying(reply: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_on: HashSet::new(),
            reply: reply.to_string(),
            delay: Duration::ZERO,
        }
    }

    pub fn failing_on(mut self, call: usize) -> Self {
        self.fail_on.insert(call);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn complete(&self, _prompt: &Prompt) -> Result<String, GenerationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_on.contains(&call) {
            return Err(GenerationError::Unavailable("model process crashed".to_string()));
        }
        Ok(self.reply.clone())
    }
}

/// Sender that records every dispatch instead of talking to a provider.
pub struct FakeSender {
    pub channel: Channel,
    pub accept_credentials: bool,
    pub sent: Mutex<Vec<(Uuid, Instant)>>,
    pub reject_leads: Mutex<HashSet<Uuid>>,
    /// Raised once this many messages went out.
    pub cancel_after: Option<(usize, Arc<AtomicBool>)>,
}

impl FakeSender {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            accept_credentials: true,
            sent: Mutex::new(Vec::new()),
            reject_leads: Mutex::new(HashSet::new()),
            cancel_after: None,
        }
    }

    pub fn rejecting_credentials(mut self) -> Self {
        self.accept_credentials = false;
        self
    }

    pub fn cancelling_after(mut self, sends: usize, flag: Arc<AtomicBool>) -> Self {
        self.cancel_after = Some((sends, flag));
        self
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn sent_instants(&self) -> Vec<Instant> {
        self.sent.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }
}

#[async_trait]
impl ChannelSender for FakeSender {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: 1,
            backoff: Duration::from_millis(1),
            timeout: Duration::from_secs(1),
        }
    }

    async fn test_connection(&self, _credentials: &ChannelCredentials) -> Result<(), DeliveryError> {
        if self.accept_credentials {
            Ok(())
        } else {
            Err(DeliveryError::Permanent("535 authentication failed".to_string()))
        }
    }

    async fn deliver(
        &self,
        lead: &Lead,
        _content: &OutboundContent,
        _credentials: &ChannelCredentials,
    ) -> Result<String, DeliveryError> {
        if self.reject_leads.lock().unwrap().contains(&lead.id) {
            return Err(DeliveryError::Permanent("550 mailbox unavailable".to_string()));
        }
        let count = {
            let mut sent = self.sent.lock().unwrap();
            sent.push((lead.id, Instant::now()));
            sent.len()
        };
        if let Some((limit, flag)) = &self.cancel_after {
            if count >= *limit {
                flag.store(true, Ordering::SeqCst);
            }
        }
        Ok(format!("msg-{}", lead.id))
    }
}

pub fn smtp_credentials() -> ChannelCredentials {
    ChannelCredentials::Email(SmtpCredentials {
        host: "smtp.example.com".to_string(),
        port: 587,
        username: "outreach@example.com".to_string(),
        password: "app-password".to_string(),
        from_email: "outreach@example.com".to_string(),
        from_name: Some("Outreach".to_string()),
        implicit_tls: false,
    })
}

pub fn whatsapp_credentials() -> ChannelCredentials {
    ChannelCredentials::Whatsapp(WhatsAppCredentials {
        phone_number_id: "109876543210".to_string(),
        access_token: "EAAG-test".to_string(),
    })
}

pub fn test_config() -> Config {
    Config {
        database_url: "postgresql://test".to_string(),
        port: 8080,
        generation: GenerationConfig {
            api_key: "test_key".to_string(),
            timeout: Duration::from_secs(2),
            ..GenerationConfig::default()
        },
        delivery: DeliveryConfig {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..DeliveryConfig::default()
        },
        webhook_secret: Some("hook-secret".to_string()),
    }
}

pub struct Pipeline {
    pub store: Arc<MemoryStore>,
    pub backend: Arc<FakeBackend>,
    pub email: Arc<FakeSender>,
    pub chat: Arc<FakeSender>,
    pub orchestrator: Arc<BatchOrchestrator>,
    pub tenant: Tenant,
    pub campaign: Campaign,
}

pub struct PipelineBuilder {
    backend: FakeBackend,
    email: FakeSender,
    chat: FakeSender,
    throttle: Throttle,
    leads_quota: i64,
    max_leads: i64,
    status: CampaignStatus,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            backend: FakeBackend::replying("Subject: A better oven schedule\n\nHello from the bakery team."),
            email: FakeSender::new(Channel::Email),
            chat: FakeSender::new(Channel::Chat),
            throttle: Throttle::new(Duration::ZERO, Duration::ZERO),
            leads_quota: 1_000,
            max_leads: 1_000,
            status: CampaignStatus::Active,
        }
    }

    pub fn backend(mut self, backend: FakeBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn email_sender(mut self, sender: FakeSender) -> Self {
        self.email = sender;
        self
    }

    pub fn throttle(mut self, min: Duration, max: Duration) -> Self {
        self.throttle = Throttle::new(min, max);
        self
    }

    pub fn quota(mut self, leads_quota: i64, max_leads: i64) -> Self {
        self.leads_quota = leads_quota;
        self.max_leads = max_leads;
        self
    }

    pub fn campaign_status(mut self, status: CampaignStatus) -> Self {
        self.status = status;
        self
    }

    pub fn build(self) -> Pipeline {
        let store = Arc::new(MemoryStore::new());
        let tenant = store.add_tenant("Acme Outreach", self.leads_quota).unwrap();
        let campaign = store
            .add_campaign(tenant.id, "Bakeries Q3", self.status, self.max_leads)
            .unwrap();

        let backend = Arc::new(self.backend);
        let generator = Arc::new(ContentGenerator::new(
            backend.clone(),
            &test_config().generation,
        ));
        let email = Arc::new(self.email);
        let chat = Arc::new(self.chat);
        let senders: Vec<Arc<dyn ChannelSender>> = vec![email.clone(), chat.clone()];
        let store_dyn: Arc<dyn Store> = store.clone();

        let orchestrator = Arc::new(BatchOrchestrator::new(
            store_dyn,
            generator,
            senders,
            self.throttle,
            "BR",
        ));

        Pipeline {
            store,
            backend,
            email,
            chat,
            orchestrator,
            tenant,
            campaign,
        }
    }
}

impl Pipeline {
    /// Insert leads straight into the campaign, bypassing quota.
    pub async fn seed_leads(&self, count: usize) -> Vec<Uuid> {
        let leads: Vec<NewLead> = (1..=count)
            .map(|i| NewLead {
                name: format!("Bakery {}", i),
                address: Some(format!("Rua das Flores, {}", i)),
                phone: Some(format!("11 98765-43{:02}", i)),
                website: Some(format!("https://bakery{}.example.com", i)),
                email: Some(format!("owner{}@bakery{}.com", i, i)),
            })
            .collect();
        self.store
            .insert_leads(self.tenant.id, self.campaign.id, &leads)
            .await
            .unwrap()
    }

    pub async fn seed_generated_emails(&self, lead_ids: &[Uuid]) {
        for id in lead_ids {
            self.store
                .save_generated_email(*id, Some("Hello"), "A short pitch.")
                .await
                .unwrap();
        }
    }

    pub fn request(&self, operation: Operation, lead_ids: Vec<Uuid>) -> BulkRequest {
        BulkRequest {
            tenant_id: self.tenant.id,
            campaign_id: self.campaign.id,
            operation,
            lead_ids,
            template_id: None,
            context: GenerationContext {
                sender_name: Some("Ana".to_string()),
                sender_company: Some("OvenWorks".to_string()),
                offer: Some("smart oven scheduling".to_string()),
                ..GenerationContext::default()
            },
            credentials: match operation.channel() {
                Some(Channel::Email) => Some(smtp_credentials()),
                Some(Channel::Chat) => Some(whatsapp_credentials()),
                None => None,
            },
            overwrite: false,
        }
    }
}
