//! Content generation: descriptions, outreach emails and chat messages.
//!
//! Template-only content is rendered locally; everything else goes through the
//! shared generation backend, serialised by [`GenerationQueue`] and guarded by
//! a circuit breaker.

pub mod backend;
pub mod queue;

use failsafe::CircuitBreaker;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use uuid::Uuid;

use crate::circuit_breaker::{create_generation_circuit_breaker, GenerationBreaker};
use crate::config::GenerationConfig;
use crate::errors::GenerationError;
use crate::models::{GenerationContext, ItemError, Lead, Template};

pub use backend::{GenerationBackend, OpenAiCompatibleBackend, Prompt};
pub use queue::GenerationQueue;

/// Hard cap for chat messages, in characters.
pub const WHATSAPP_MAX_CHARS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    Description,
    Email,
    Whatsapp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub subject: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkGeneration {
    pub generated: usize,
    pub failed: usize,
    pub errors: Vec<ItemError>,
    pub outputs: Vec<(Uuid, GeneratedContent)>,
}

enum Dispatch {
    Queued(GenerationQueue),
    Direct(Arc<dyn GenerationBackend>),
}

pub struct ContentGenerator {
    dispatch: Dispatch,
    breaker: GenerationBreaker,
    max_output_tokens: u32,
    temperature: f32,
    timeout: Duration,
}

impl ContentGenerator {
    /// Must be called from within a tokio runtime when the backend needs the queue.
    pub fn new(backend: Arc<dyn GenerationBackend>, config: &GenerationConfig) -> Self {
        let dispatch = if backend.supports_concurrent_calls() {
            Dispatch::Direct(backend)
        } else {
            Dispatch::Queued(GenerationQueue::spawn(
                backend,
                config.queue_capacity,
                config.timeout,
            ))
        };

        Self {
            dispatch,
            breaker: create_generation_circuit_breaker(),
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
            timeout: config.timeout,
        }
    }

    pub async fn generate(
        &self,
        kind: GenerationKind,
        lead: &Lead,
        template: Option<&Template>,
        context: &GenerationContext,
    ) -> Result<GeneratedContent, GenerationError> {
        let template = template.filter(|_| kind != GenerationKind::Description);
        let values = placeholder_values(lead, context);

        if let Some(t) = template.filter(|t| !t.ai_personalization) {
            let body = render_placeholders(&t.body, &values);
            return Ok(match kind {
                GenerationKind::Whatsapp => GeneratedContent {
                    subject: None,
                    body: cap_chars(&body, WHATSAPP_MAX_CHARS),
                },
                _ => GeneratedContent {
                    subject: Some(render_placeholders(&t.subject, &values)),
                    body,
                },
            });
        }

        let prompt = self.build_prompt(kind, lead, template, context, &values);
        let text = self.complete(prompt).await?;

        let content = match kind {
            GenerationKind::Description => GeneratedContent {
                subject: None,
                body: text,
            },
            GenerationKind::Email => {
                let (parsed_subject, body) = split_subject_line(&text);
                let subject = parsed_subject
                    .or_else(|| template.map(|t| render_placeholders(&t.subject, &values)))
                    .unwrap_or_else(|| format!("A quick idea for {}", lead.name));
                GeneratedContent {
                    subject: Some(subject),
                    body,
                }
            }
            GenerationKind::Whatsapp => GeneratedContent {
                subject: None,
                body: cap_chars(&text, WHATSAPP_MAX_CHARS),
            },
        };

        if content.body.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        Ok(content)
    }

    /// Generate for every lead; a failed lead is recorded and the batch goes on.
    pub async fn generate_bulk(
        &self,
        kind: GenerationKind,
        leads: &[Lead],
        template: Option<&Template>,
        context: &GenerationContext,
    ) -> BulkGeneration {
        let mut result = BulkGeneration::default();
        for lead in leads {
            match self.generate(kind, lead, template, context).await {
                Ok(content) => {
                    result.generated += 1;
                    result.outputs.push((lead.id, content));
                }
                Err(e) => {
                    tracing::warn!("Generation failed for lead {}: {}", lead.id, e);
                    result.failed += 1;
                    result.errors.push(ItemError {
                        lead_id: lead.id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        result
    }

    async fn complete(&self, prompt: Prompt) -> Result<String, GenerationError> {
        if !self.breaker.is_call_permitted() {
            return Err(GenerationError::Unavailable(
                "circuit open after repeated endpoint failures".to_string(),
            ));
        }

        let result = match &self.dispatch {
            Dispatch::Queued(queue) => queue.submit(prompt).await,
            Dispatch::Direct(backend) => {
                queue::complete_with_timeout(backend.as_ref(), &prompt, self.timeout).await
            }
        };

        // Only endpoint health feeds the breaker; rejected prompts do not.
        let endpoint_down = matches!(
            result,
            Err(GenerationError::Unavailable(_)) | Err(GenerationError::Timeout(_))
        );
        let _ = self
            .breaker
            .call(|| if endpoint_down { Err(()) } else { Ok(()) });

        result
    }

    fn build_prompt(
        &self,
        kind: GenerationKind,
        lead: &Lead,
        template: Option<&Template>,
        context: &GenerationContext,
        values: &HashMap<String, String>,
    ) -> Prompt {
        let mut system = match kind {
            GenerationKind::Description => {
                "You write concise, factual company summaries (3-4 sentences) for B2B sales \
                 research. Do not invent facts that are not supported by the data given."
                    .to_string()
            }
            GenerationKind::Email => {
                "You write short, personalised B2B cold outreach emails. Start the answer \
                 with a single line 'Subject: <subject>' followed by the email body. \
                 No placeholders, no markdown."
                    .to_string()
            }
            GenerationKind::Whatsapp => format!(
                "You write short, friendly WhatsApp messages for first business contact. \
                 Plain text, no subject, at most {} characters.",
                WHATSAPP_MAX_CHARS
            ),
        };
        if let Some(tone) = &context.tone {
            system.push_str(&format!(" Tone: {}.", tone));
        }
        if let Some(language) = &context.language {
            system.push_str(&format!(" Write in {}.", language));
        }

        let mut user = format!("Company: {}\n", lead.name);
        for (label, value) in [
            ("Address", &lead.address),
            ("Phone", &lead.phone),
            ("Website", &lead.website),
            ("Email", &lead.email),
        ] {
            if let Some(v) = value.as_deref().filter(|v| !v.trim().is_empty()) {
                user.push_str(&format!("{}: {}\n", label, v));
            }
        }

        if kind != GenerationKind::Description {
            if let Some(description) = &lead.generated_description {
                user.push_str(&format!("About the company: {}\n", description));
            }
            if let Some(name) = &context.sender_name {
                user.push_str(&format!("Sender: {}\n", name));
            }
            if let Some(company) = &context.sender_company {
                user.push_str(&format!("Sender company: {}\n", company));
            }
            if let Some(offer) = &context.offer {
                user.push_str(&format!("Offer: {}\n", offer));
            }
            if let Some(t) = template {
                user.push_str(&format!(
                    "\nPersonalise this template for the company:\nSubject: {}\n{}\n",
                    render_placeholders(&t.subject, values),
                    render_placeholders(&t.body, values)
                ));
            }
        }

        Prompt {
            system,
            user,
            max_output_tokens: self.max_output_tokens,
            temperature: self.temperature,
        }
    }
}

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("placeholder regex is valid"))
}

/// Values for every known placeholder. Caller-supplied keys never shadow
/// lead or sender fields that are actually set.
pub fn placeholder_values(lead: &Lead, context: &GenerationContext) -> HashMap<String, String> {
    let mut values = context.extra.clone();
    let known: [(&str, Option<&str>); 10] = [
        ("name", Some(lead.name.as_str())),
        ("company", Some(lead.name.as_str())),
        ("first_name", Some(lead.first_name())),
        ("website", lead.website.as_deref()),
        ("address", lead.address.as_deref()),
        ("phone", lead.phone.as_deref()),
        ("email", lead.email.as_deref()),
        ("sender_name", context.sender_name.as_deref()),
        ("sender_company", context.sender_company.as_deref()),
        ("offer", context.offer.as_deref()),
    ];
    for (key, value) in known {
        match value {
            Some(v) => {
                values.insert(key.to_string(), v.to_string());
            }
            None => {
                values.entry(key.to_string()).or_default();
            }
        }
    }
    values
}

/// Substitute `{{key}}` tokens; unknown tokens are left as written.
pub fn render_placeholders(text: &str, values: &HashMap<String, String>) -> String {
    placeholder_regex()
        .replace_all(text, |caps: &regex::Captures| match values.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Split a leading `Subject: ...` line off a generated email.
pub fn split_subject_line(text: &str) -> (Option<String>, String) {
    let trimmed = text.trim();
    let (first, rest) = trimmed.split_once('\n').unwrap_or((trimmed, ""));
    let first = first.trim();
    if first
        .get(..8)
        .map_or(false, |prefix| prefix.eq_ignore_ascii_case("subject:"))
    {
        let subject = first[8..].trim();
        if !subject.is_empty() {
            return (Some(subject.to_string()), rest.trim().to_string());
        }
    }
    (None, trimmed.to_string())
}

fn cap_chars(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max) {
        Some((idx, _)) => trimmed[..idx].trim_end().to_string(),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn lead() -> Lead {
        Lead {
            id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "Padaria Central".into(),
            address: Some("Rua A, 10".into()),
            phone: None,
            website: Some("https://padaria.example".into()),
            email: Some("contato@padaria.example".into()),
            generated_description: None,
            generated_email_subject: None,
            generated_email: None,
            generated_whatsapp: None,
            email_sent: false,
            whatsapp_sent: false,
            replied: false,
            lead_score: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn renders_known_and_keeps_unknown_tokens() {
        let mut context = GenerationContext {
            sender_name: Some("Ana".into()),
            ..Default::default()
        };
        context.extra.insert("city".into(), "Recife".into());
        context.extra.insert("name".into(), "ignored".into());

        let values = placeholder_values(&lead(), &context);
        let rendered = render_placeholders(
            "Hi {{first_name}} at {{ company }} in {{city}}, {{phone}}{{unknown}} - {{sender_name}}",
            &values,
        );
        assert_eq!(
            rendered,
            "Hi Padaria at Padaria Central in Recife, {{unknown}} - Ana"
        );
    }

    #[test]
    fn subject_line_is_split_off() {
        let (subject, body) = split_subject_line("Subject: Fresh bread, faster\n\nHello there");
        assert_eq!(subject.as_deref(), Some("Fresh bread, faster"));
        assert_eq!(body, "Hello there");

        let (subject, body) = split_subject_line("Hello there");
        assert_eq!(subject, None);
        assert_eq!(body, "Hello there");
    }

    struct RefusesSecond {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl GenerationBackend for RefusesSecond {
        fn name(&self) -> &str {
            "refuses-second"
        }

        async fn complete(&self, prompt: &Prompt) -> Result<String, GenerationError> {
            let call = self
                .calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if call == 1 {
                return Err(GenerationError::Rejected("content filter".into()));
            }
            Ok(format!("Summary of {}", prompt.user.lines().next().unwrap_or("")))
        }
    }

    #[tokio::test]
    async fn bulk_generation_records_failures_and_continues() {
        let backend = Arc::new(RefusesSecond {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let generator = ContentGenerator::new(backend, &GenerationConfig::default());
        let leads = vec![lead(), lead(), lead()];

        let result = generator
            .generate_bulk(
                GenerationKind::Description,
                &leads,
                None,
                &GenerationContext::default(),
            )
            .await;

        assert_eq!(result.generated, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.errors[0].lead_id, leads[1].id);
        assert_eq!(result.outputs[1].0, leads[2].id);
        assert_eq!(result.outputs[0].1.body, "Summary of Company: Padaria Central");
    }

    #[tokio::test]
    async fn plain_template_is_rendered_without_the_backend() {
        let backend = Arc::new(RefusesSecond {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let generator = ContentGenerator::new(backend.clone(), &GenerationConfig::default());
        let lead = lead();
        let template = Template {
            id: Uuid::new_v4(),
            tenant_id: lead.tenant_id,
            name: "intro".into(),
            subject: "Hello {{company}}".into(),
            body: "Hi {{first_name}}!".into(),
            ai_personalization: false,
            times_used: 0,
        };

        let content = generator
            .generate(
                GenerationKind::Email,
                &lead,
                Some(&template),
                &GenerationContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(content.subject.as_deref(), Some("Hello Padaria Central"));
        assert_eq!(content.body, "Hi Padaria!");
        assert_eq!(backend.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn chat_messages_are_capped_on_char_boundaries() {
        let long = "é".repeat(WHATSAPP_MAX_CHARS + 50);
        assert_eq!(cap_chars(&long, WHATSAPP_MAX_CHARS).chars().count(), WHATSAPP_MAX_CHARS);
        assert_eq!(cap_chars("short", WHATSAPP_MAX_CHARS), "short");
    }
}
