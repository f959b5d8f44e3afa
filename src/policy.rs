//! Policy engine
//!
//! Decides whether a domain (and optionally its software) may interact
//! with the relay. The decision is a pure function of a snapshot of the
//! store, so two evaluations over the same snapshot always agree.

use std::collections::HashSet;
use std::sync::Arc;

use crate::data::Store;
use crate::error::Result;

/// Outcome of a policy check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allow,
    DenyBannedDomain,
    DenyBannedSoftware,
    DenyNotWhitelisted,
}

impl Access {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Access::Allow)
    }
}

/// Point-in-time view of the rules relevant to policy decisions
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    banned_domains: HashSet<String>,
    banned_software: HashSet<String>,
    whitelist: HashSet<String>,
    whitelist_enabled: bool,
}

impl PolicySnapshot {
    /// Load the current rules from the store
    pub async fn load(store: &Arc<Store>) -> Result<Self> {
        let relay_config = store.get_relay_config().await?;

        Ok(Self {
            banned_domains: store
                .get_domain_bans()
                .await?
                .into_iter()
                .map(|ban| ban.domain)
                .collect(),
            banned_software: store
                .get_software_bans()
                .await?
                .into_iter()
                .map(|ban| ban.name)
                .collect(),
            whitelist: store
                .get_whitelist()
                .await?
                .into_iter()
                .map(|entry| entry.domain)
                .collect(),
            whitelist_enabled: relay_config.whitelist_enabled,
        })
    }

    /// Evaluate a domain and optional software name against the snapshot
    ///
    /// Ban rules win over the whitelist; unknown software only triggers
    /// domain and whitelist rules.
    pub fn evaluate(&self, domain: &str, software: Option<&str>) -> Access {
        let domain = domain.to_ascii_lowercase();

        if self.banned_domains.contains(&domain) {
            return Access::DenyBannedDomain;
        }

        if let Some(software) = software {
            if self.banned_software.contains(&software.to_ascii_lowercase()) {
                return Access::DenyBannedSoftware;
            }
        }

        if self.whitelist_enabled && !self.whitelist.contains(&domain) {
            return Access::DenyNotWhitelisted;
        }

        Access::Allow
    }
}
