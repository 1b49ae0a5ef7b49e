/// Property-based tests using proptest
/// Tests invariants and properties that should hold for all inputs
use proptest::prelude::*;
use rust_outreach_api::contact::{contact_score, is_valid_email, normalize_phone};
use rust_outreach_api::generation::render_placeholders;
use rust_outreach_api::ledger::rate;
use rust_outreach_api::models::{BatchSummary, ItemOutcome};
use rust_outreach_api::quota::QuotaGuard;
use rust_outreach_api::senders::Throttle;
use rust_outreach_api::store::{MemoryStore, TenantRepository};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// Property: Email validation should never panic
proptest! {
    #[test]
    fn email_validation_never_panics(email in "\\PC*") {
        let _ = is_valid_email(&email);
    }

    #[test]
    fn well_formed_emails_are_accepted(
        local in "[a-z]{1,10}",
        domain in "[a-z]{1,10}",
        tld in "[a-z]{2,4}"
    ) {
        let email = format!("{}@{}.{}", local, domain, tld);
        prop_assert!(is_valid_email(&email));
    }
}

// Property: Phone normalization should never panic
proptest! {
    #[test]
    fn phone_normalization_never_panics(phone in "\\PC*", region in "[A-Z]{0,3}") {
        let _ = normalize_phone(&phone, &region);
    }

    #[test]
    fn normalized_phones_are_e164(ddd in 11u8..=99u8, number in 900000000u32..=999999999u32) {
        let phone = format!("{}{}", ddd, number);
        if let Ok(normalized) = normalize_phone(&phone, "BR") {
            prop_assert!(normalized.starts_with("+55"));
            prop_assert!(normalized[1..].chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn contact_score_is_bounded(
        email in proptest::option::of("\\PC{0,30}"),
        phone in proptest::option::of("[0-9 ()+-]{0,20}"),
        website in proptest::option::of("\\PC{0,30}"),
        address in proptest::option::of("\\PC{0,30}")
    ) {
        let score = contact_score(
            email.as_deref(),
            phone.as_deref(),
            website.as_deref(),
            address.as_deref(),
            "BR",
        );
        prop_assert!((0.0..=100.0).contains(&score));
    }
}

// Property: Engagement rates
proptest! {
    #[test]
    fn rates_are_percentages(sent in 1i64..100_000, fraction in 0.0f64..=1.0) {
        let count = (sent as f64 * fraction) as i64;
        let r = rate(count, sent);
        prop_assert!((0.0..=100.0).contains(&r));
        // two decimals at most
        prop_assert!(((r * 100.0).round() - r * 100.0).abs() < 1e-6);
    }

    #[test]
    fn nothing_sent_means_zero_rate(count in 0i64..1_000) {
        prop_assert_eq!(rate(count, 0), 0.0);
    }
}

// Property: Summary arithmetic
proptest! {
    #[test]
    fn every_recorded_item_is_counted_once(outcomes in proptest::collection::vec(0u8..3, 0..50)) {
        let mut summary = BatchSummary::new(outcomes.len());
        for kind in &outcomes {
            let outcome = match kind {
                0 => ItemOutcome::Succeeded,
                1 => ItemOutcome::Skipped("already sent".to_string()),
                _ => ItemOutcome::Failed("no generated email".to_string()),
            };
            summary.record(Uuid::new_v4(), &outcome);
        }
        prop_assert_eq!(summary.processed(), summary.total);
        prop_assert_eq!(summary.errors.len(), summary.failed);
    }
}

// Property: Templates
proptest! {
    #[test]
    fn unknown_placeholders_are_left_as_written(text in "\\PC*") {
        prop_assert_eq!(render_placeholders(&text, &HashMap::new()), text);
    }

    #[test]
    fn known_placeholders_are_substituted(key in "[a-z_]{1,12}", value in "[A-Za-z ]{0,20}") {
        let mut values = HashMap::new();
        values.insert(key.clone(), value.clone());
        let rendered = render_placeholders(&format!("<{{{{ {} }}}}>", key), &values);
        prop_assert_eq!(rendered, format!("<{}>", value));
    }
}

// Property: Throttle
proptest! {
    #[test]
    fn throttle_delay_stays_in_range(min_ms in 0u64..5_000, extra_ms in 0u64..5_000) {
        let min = Duration::from_millis(min_ms);
        let max = Duration::from_millis(min_ms + extra_ms);
        let throttle = Throttle::new(min, max);
        for _ in 0..10 {
            let delay = throttle.next_delay();
            prop_assert!(delay >= min && delay <= max);
        }
    }
}

// Property: Quota never over-commits
proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]
    #[test]
    fn reservations_never_exceed_quota(
        quota in 0i64..200,
        requests in proptest::collection::vec(1i64..50, 1..20)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let store = Arc::new(MemoryStore::new());
        let tenant = store.add_tenant("Prop Tenant", quota).unwrap();
        let guard = QuotaGuard::new(store.clone());

        let granted: i64 = runtime.block_on(async {
            let mut granted = 0;
            for requested in &requests {
                if let Ok(allowed) = guard.check_and_reserve(tenant.id, *requested).await {
                    prop_assert!(allowed <= *requested);
                    granted += allowed;
                }
            }
            Ok(granted)
        })?;

        let used = runtime
            .block_on(store.get_tenant(tenant.id))
            .unwrap()
            .unwrap()
            .leads_used;
        prop_assert!(granted <= quota);
        prop_assert_eq!(used, granted);
    }
}
