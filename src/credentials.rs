use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::models::Channel;

/// Per-run channel credentials supplied by the caller.
///
/// Never persisted: jobs store only [`ChannelCredentials::fingerprint`], and
/// `Debug` redacts every secret.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum ChannelCredentials {
    Email(SmtpCredentials),
    #[serde(alias = "chat")]
    Whatsapp(WhatsAppCredentials),
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SmtpCredentials {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_email: String,
    #[serde(default)]
    pub from_name: Option<String>,
    /// Implicit TLS (SMTPS, port 465) instead of STARTTLS.
    #[serde(default)]
    pub implicit_tls: bool,
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Clone, Serialize, Deserialize)]
pub struct WhatsAppCredentials {
    /// WhatsApp Cloud API phone-number id of the sending business number.
    pub phone_number_id: String,
    pub access_token: String,
}

impl ChannelCredentials {
    pub fn channel(&self) -> Channel {
        match self {
            ChannelCredentials::Email(_) => Channel::Email,
            ChannelCredentials::Whatsapp(_) => Channel::Chat,
        }
    }

    /// SHA-256 (hex) over the identifying, non-secret fields.
    ///
    /// Lets an operator tell which account a job ran with. Passwords and
    /// tokens never enter the hash, so a leaked fingerprint cannot be
    /// brute-forced back into a secret.
    pub fn fingerprint(&self) -> String {
        let identity = match self {
            ChannelCredentials::Email(smtp) => format!(
                "email\n{}\n{}\n{}\n{}",
                smtp.host.to_lowercase(),
                smtp.port,
                smtp.username,
                smtp.from_email.to_lowercase()
            ),
            ChannelCredentials::Whatsapp(wa) => format!("whatsapp\n{}", wa.phone_number_id),
        };
        let mut hasher = Sha256::new();
        hasher.update(identity.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Debug for ChannelCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelCredentials::Email(smtp) => f
                .debug_struct("Email")
                .field("host", &smtp.host)
                .field("port", &smtp.port)
                .field("username", &smtp.username)
                .field("password", &"[REDACTED]")
                .field("from_email", &smtp.from_email)
                .finish(),
            ChannelCredentials::Whatsapp(wa) => f
                .debug_struct("Whatsapp")
                .field("phone_number_id", &wa.phone_number_id)
                .field("access_token", &"[REDACTED]")
                .finish(),
        }
    }
}
