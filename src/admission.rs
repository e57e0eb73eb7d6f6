//! Origin admission (C2): resolves a host to an allow/deny decision and,
//! opportunistically, the tenant records that should receive usage credit.

use std::sync::Arc;

use tracing::error;

use crate::registry::{DomainRecord, Registry, TenantStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionMode {
    Open,
    List,
    Registered,
    /// Any configured mode string that isn't one of the three above. Kept as
    /// an explicit variant (rather than falling back ad hoc) so `validate`'s
    /// match stays total and the deny-by-default rule lives in one place.
    Unknown,
}

impl AdmissionMode {
    pub fn parse(s: &str) -> AdmissionMode {
        match s.to_ascii_lowercase().as_str() {
            "list" => AdmissionMode::List,
            "registered" => AdmissionMode::Registered,
            "open" => AdmissionMode::Open,
            _ => {
                error!(mode = %s, "unknown ORIGIN_MODE, defaulting to deny-all behavior");
                AdmissionMode::Unknown
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionReason {
    Allowed,
    Blocklisted,
    NotInAllowlist,
    NotRegistered,
    UnknownMode,
    RegistryMisconfigured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionSource {
    Config,
    Registry,
    Default,
}

#[derive(Debug, Clone)]
pub struct AdmissionResult {
    pub allowed: bool,
    pub reason: AdmissionReason,
    pub source: AdmissionSource,
    pub domain_records: Option<Vec<DomainRecord>>,
}

impl AdmissionResult {
    fn denied(reason: AdmissionReason) -> Self {
        Self {
            allowed: false,
            reason,
            source: AdmissionSource::Default,
            domain_records: None,
        }
    }
}

/// Parsed comma-separated pattern list: exact hosts and `*.parent` wildcards.
pub struct PatternList {
    exact: Vec<String>,
    wildcard_parents: Vec<String>,
    is_kill_switch: bool,
}

impl PatternList {
    pub fn parse(raw: &str) -> Self {
        let mut exact = Vec::new();
        let mut wildcard_parents = Vec::new();
        let mut is_kill_switch = false;
        for pattern in raw.split(',').map(|p| p.trim()).filter(|p| !p.is_empty()) {
            if pattern == "*" {
                is_kill_switch = true;
            } else if let Some(parent) = pattern.strip_prefix("*.") {
                wildcard_parents.push(parent.to_ascii_lowercase());
            } else {
                exact.push(pattern.to_ascii_lowercase());
            }
        }
        Self {
            exact,
            wildcard_parents,
            is_kill_switch,
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        if self.is_kill_switch {
            return true;
        }
        if self.exact.iter().any(|h| h == host) {
            return true;
        }
        self.wildcard_parents.iter().any(|parent| {
            host.len() > parent.len() + 1
                && host.ends_with(parent.as_str())
                && host.as_bytes()[host.len() - parent.len() - 1] == b'.'
        })
    }
}

pub struct OriginAdmission {
    mode: AdmissionMode,
    allowlist: PatternList,
    blocklist: PatternList,
    /// Absent when no registry backend is bound (§4.2). In `open`/`list`
    /// mode a missing registry just means no opportunistic tenant credit;
    /// in `registered` mode it is a hard deny.
    registry: Option<Arc<dyn Registry>>,
}

impl OriginAdmission {
    pub fn new(
        mode_str: &str,
        allowed_origins: &str,
        blocked_origins: &str,
        registry: Option<Arc<dyn Registry>>,
    ) -> Self {
        Self {
            mode: AdmissionMode::parse(mode_str),
            allowlist: PatternList::parse(allowed_origins),
            blocklist: PatternList::parse(blocked_origins),
            registry,
        }
    }

    /// Opportunistic lookup used by `open`/`list` mode: absent registry or a
    /// failed lookup both just mean no tenant records, never a deny.
    async fn opportunistic_lookup(&self, host: &str) -> Vec<DomainRecord> {
        match &self.registry {
            Some(registry) => registry.lookup(host).await.unwrap_or_default(),
            None => Vec::new(),
        }
    }

    pub async fn validate(&self, host: &str) -> AdmissionResult {
        if self.blocklist.matches(host) {
            return AdmissionResult::denied(AdmissionReason::Blocklisted);
        }

        match self.mode {
            AdmissionMode::Unknown => AdmissionResult::denied(AdmissionReason::UnknownMode),
            AdmissionMode::Open => {
                let records = self.opportunistic_lookup(host).await;
                AdmissionResult {
                    allowed: true,
                    reason: AdmissionReason::Allowed,
                    source: AdmissionSource::Config,
                    domain_records: Some(records),
                }
            }
            AdmissionMode::List => {
                if !self.allowlist.matches(host) {
                    return AdmissionResult::denied(AdmissionReason::NotInAllowlist);
                }
                let records = self.opportunistic_lookup(host).await;
                AdmissionResult {
                    allowed: true,
                    reason: AdmissionReason::Allowed,
                    source: AdmissionSource::Config,
                    domain_records: Some(records),
                }
            }
            AdmissionMode::Registered => {
                let Some(registry) = &self.registry else {
                    error!(host = %host, "registered mode has no registry backend bound");
                    return AdmissionResult::denied(AdmissionReason::RegistryMisconfigured);
                };
                match registry.lookup(host).await {
                    Ok(records) if records.iter().any(|r| r.status == TenantStatus::Active) => {
                        AdmissionResult {
                            allowed: true,
                            reason: AdmissionReason::Allowed,
                            source: AdmissionSource::Registry,
                            domain_records: Some(records),
                        }
                    }
                    Ok(_) => AdmissionResult::denied(AdmissionReason::NotRegistered),
                    Err(_) => {
                        error!(host = %host, "registry lookup failed in registered mode");
                        AdmissionResult::denied(AdmissionReason::RegistryMisconfigured)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;

    fn admission(mode: &str, allow: &str, block: &str) -> OriginAdmission {
        OriginAdmission::new(mode, allow, block, Some(Arc::new(InMemoryRegistry::new())))
    }

    #[tokio::test]
    async fn open_mode_allows_any_valid_host() {
        let a = admission("open", "", "");
        let result = a.validate("example.com").await;
        assert!(result.allowed);
    }

    #[tokio::test]
    async fn blocklist_kill_switch_denies_everything() {
        let a = admission("open", "", "*");
        let result = a.validate("example.com").await;
        assert!(!result.allowed);
        assert_eq!(result.reason, AdmissionReason::Blocklisted);
    }

    #[tokio::test]
    async fn wildcard_blocklist_matches_subdomain_not_parent() {
        let a = admission("open", "", "*.evil.com");
        assert!(!a.validate("sub.evil.com").await.allowed);
        assert!(a.validate("evil.com").await.allowed);
    }

    #[tokio::test]
    async fn list_mode_requires_allowlist_match() {
        let a = admission("list", "example.com,*.good.com", "");
        assert!(a.validate("example.com").await.allowed);
        assert!(a.validate("cdn.good.com").await.allowed);
        assert!(!a.validate("other.com").await.allowed);
    }

    #[tokio::test]
    async fn unknown_mode_denies() {
        let a = admission("yolo", "", "");
        let result = a.validate("example.com").await;
        assert!(!result.allowed);
        assert_eq!(result.reason, AdmissionReason::UnknownMode);
    }

    #[tokio::test]
    async fn registered_mode_with_no_registry_bound_is_a_misconfiguration_not_a_deny_by_default() {
        let a = OriginAdmission::new("registered", "", "", None);
        let result = a.validate("example.com").await;
        assert!(!result.allowed);
        assert_eq!(result.reason, AdmissionReason::RegistryMisconfigured);
    }

    #[tokio::test]
    async fn registered_mode_with_empty_registry_is_not_registered_not_misconfigured() {
        let a = admission("registered", "", "");
        let result = a.validate("example.com").await;
        assert!(!result.allowed);
        assert_eq!(result.reason, AdmissionReason::NotRegistered);
    }

    #[tokio::test]
    async fn open_mode_without_registry_still_allows() {
        let a = OriginAdmission::new("open", "", "", None);
        let result = a.validate("example.com").await;
        assert!(result.allowed);
        assert_eq!(result.domain_records, Some(Vec::new()));
    }
}
