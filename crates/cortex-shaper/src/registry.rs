//! The single provider table shared by webhook shaping, pull polling, and
//! tool dispatch.
//!
//! Each entry binds a normalized provider name to one synced entity kind: the
//! webhook `model` name it arrives under, the gateway resource the poller
//! fetches, and the shaper that classifies its records.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Email,
    Calendar,
    Lead,
    Opportunity,
}

impl EntityKind {
    /// Key segment used for `shaper:{kind}:{user}` state.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Email => "email",
            EntityKind::Calendar => "calendar",
            EntityKind::Lead => "lead",
            EntityKind::Opportunity => "opportunity",
        }
    }

    /// How long per-entity shaper state is retained. Email threads go cold in
    /// a week; calendar events live on the scale of a month; CRM records move
    /// slowest.
    pub fn state_ttl(&self) -> Duration {
        match self {
            EntityKind::Email => Duration::from_secs(7 * 24 * 3600),
            EntityKind::Calendar => Duration::from_secs(30 * 24 * 3600),
            EntityKind::Lead | EntityKind::Opportunity => Duration::from_secs(60 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProviderSpec {
    /// Normalized provider name carried on events as `source`.
    pub provider: &'static str,
    /// Webhook `model` this entity kind arrives under.
    pub model: &'static str,
    /// Gateway resource the poller fetches for this kind.
    pub resource: &'static str,
    pub kind: EntityKind,
}

pub const PROVIDER_SPECS: &[ProviderSpec] = &[
    ProviderSpec {
        provider: "gmail",
        model: "Email",
        resource: "emails",
        kind: EntityKind::Email,
    },
    ProviderSpec {
        provider: "google-calendar",
        model: "CalendarEvent",
        resource: "calendar-events",
        kind: EntityKind::Calendar,
    },
    ProviderSpec {
        provider: "salesforce",
        model: "Lead",
        resource: "leads",
        kind: EntityKind::Lead,
    },
    ProviderSpec {
        provider: "salesforce",
        model: "Opportunity",
        resource: "opportunities",
        kind: EntityKind::Opportunity,
    },
];

pub fn spec_for_model(model: &str) -> Option<&'static ProviderSpec> {
    PROVIDER_SPECS.iter().find(|s| s.model == model)
}

/// All synced entity kinds for one provider (salesforce carries two).
pub fn specs_for_provider(provider: &str) -> Vec<&'static ProviderSpec> {
    PROVIDER_SPECS
        .iter()
        .filter(|s| s.provider == provider)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_model_resolves_to_exactly_one_spec() {
        for spec in PROVIDER_SPECS {
            let found = spec_for_model(spec.model).unwrap();
            assert_eq!(found.provider, spec.provider);
        }
        assert!(spec_for_model("Unknown").is_none());
    }

    #[test]
    fn salesforce_has_two_entity_kinds() {
        let specs = specs_for_provider("salesforce");
        assert_eq!(specs.len(), 2);
        assert!(specs.iter().any(|s| s.kind == EntityKind::Lead));
        assert!(specs.iter().any(|s| s.kind == EntityKind::Opportunity));
    }

    #[test]
    fn state_ttls_scale_with_entity_lifetime() {
        assert!(EntityKind::Email.state_ttl() < EntityKind::Calendar.state_ttl());
        assert!(EntityKind::Calendar.state_ttl() < EntityKind::Lead.state_ttl());
        assert_eq!(
            EntityKind::Lead.state_ttl(),
            EntityKind::Opportunity.state_ttl()
        );
    }
}
