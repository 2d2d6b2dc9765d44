//! Virtual-host membership for local/remote sender classification.

use std::collections::HashSet;

use crate::stanza::BareJid;

/// The set of domains this server hosts locally.
///
/// Owned by the host configuration; the offender cache only asks membership
/// questions. Comparison is ASCII case-insensitive, matching how the host
/// normalizes domains.
#[derive(Debug, Default)]
pub struct VirtualHosts {
    domains: HashSet<String>,
}

impl VirtualHosts {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.into().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_local_domain(&self, domain: &str) -> bool {
        self.domains.contains(&domain.to_ascii_lowercase())
    }

    pub fn is_local(&self, jid: &BareJid) -> bool {
        self.is_local_domain(jid.domain())
    }
}
