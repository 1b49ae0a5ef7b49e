//! Recipient validation shared by the channel senders and lead scoring.
use phonenumber::country::Id as CountryId;
use phonenumber::Mode;
use regex::Regex;
use std::sync::OnceLock;

fn email_regex() -> &'static Regex {
    static EMAIL_REGEX: OnceLock<Regex> = OnceLock::new();
    // RFC 5322 simplified: local@domain.tld
    EMAIL_REGEX.get_or_init(|| {
        Regex::new(
            r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
        )
        .expect("email regex is valid")
    })
}

/// Validate an email address before handing it to a provider.
///
/// Checks for:
/// - Basic email format (contains @ and .)
/// - Fake/placeholder patterns scraped from listings (repeated digits like 9999, 1111)
/// - Minimum length requirements
/// - Valid domain structure
pub fn is_valid_email(email: &str) -> bool {
    if email.len() < 5 || !email.contains('@') || !email.contains('.') {
        return false;
    }

    let fake_patterns = ["999999", "111111", "000000", "123456789"];

    for pattern in &fake_patterns {
        if email.contains(pattern) {
            tracing::warn!(
                "Invalid email detected (fake pattern '{}'): {}",
                pattern,
                email
            );
            return false;
        }
    }

    if !email_regex().is_match(email) {
        tracing::warn!("Invalid email format: {}", email);
        return false;
    }

    let domain = email.rsplit('@').next().unwrap_or("");
    if !domain.contains('.') {
        return false;
    }

    true
}

/// Parse and normalize a phone number to E.164 (`+5511987654321`).
///
/// Numbers without a country prefix are read in `default_region`
/// (ISO 3166 alpha-2, e.g. "BR"). Returns the reason on failure.
pub fn normalize_phone(raw: &str, default_region: &str) -> Result<String, String> {
    if raw.trim().is_empty() || raw.len() < 8 {
        return Err("Phone too short".to_string());
    }

    let region: Option<CountryId> = default_region.parse().ok();
    if region.is_none() {
        tracing::warn!("Unknown default phone region '{}'", default_region);
    }

    match phonenumber::parse(region, raw) {
        Ok(number) => {
            if phonenumber::is_valid(&number) {
                let formatted = number.format().mode(Mode::E164).to_string();
                tracing::debug!("Valid phone: {} -> {}", raw, formatted);
                Ok(formatted)
            } else {
                tracing::warn!("Invalid phone number for region {}: {}", default_region, raw);
                Err(format!("Invalid phone number for region {}", default_region))
            }
        }
        Err(e) => {
            tracing::warn!("Failed to parse phone '{}': {:?}", raw, e);
            Err(format!("Parse error: {:?}", e))
        }
    }
}

/// Completeness score (0-100) of a lead's contact data.
///
/// Email and phone reachability dominate; website and address add context
/// for personalization.
pub fn contact_score(
    email: Option<&str>,
    phone: Option<&str>,
    website: Option<&str>,
    address: Option<&str>,
    default_region: &str,
) -> f64 {
    let mut score = 0.0;
    if email.map_or(false, is_valid_email) {
        score += 40.0;
    }
    if phone.map_or(false, |p| normalize_phone(p, default_region).is_ok()) {
        score += 30.0;
    }
    if website.map_or(false, |w| !w.trim().is_empty()) {
        score += 20.0;
    }
    if address.map_or(false, |a| !a.trim().is_empty()) {
        score += 10.0;
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_emails() {
        assert!(is_valid_email("user@example.com"));
        assert!(is_valid_email("test.user+tag@subdomain.example.co.uk"));
    }

    #[test]
    fn test_invalid_emails() {
        assert!(!is_valid_email("fake999999@example.com"));
        assert!(!is_valid_email("missing@domain"));
        assert!(!is_valid_email("user @example.com"));
        assert!(!is_valid_email(""));
    }

    #[test]
    fn test_phone_normalization_br() {
        assert_eq!(
            normalize_phone("(11) 98765-4321", "BR").unwrap(),
            "+5511987654321"
        );
        assert_eq!(normalize_phone("1133334444", "BR").unwrap(), "+551133334444");
        assert!(normalize_phone("123", "BR").is_err());
    }

    #[test]
    fn test_phone_with_explicit_country_ignores_region() {
        assert_eq!(
            normalize_phone("+5511987654321", "US").unwrap(),
            "+5511987654321"
        );
    }

    #[test]
    fn test_contact_score_weights() {
        let full = contact_score(
            Some("owner@bakery.com"),
            Some("11987654321"),
            Some("https://bakery.com"),
            Some("Rua A, 10"),
            "BR",
        );
        assert_eq!(full, 100.0);
        assert_eq!(contact_score(None, None, None, None, "BR"), 0.0);
        assert_eq!(
            contact_score(Some("not-an-email"), None, Some("x.com"), None, "BR"),
            20.0
        );
    }
}
