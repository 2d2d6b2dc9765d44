//! Known-offender cache.
//!
//! Tracks accumulated suspicion per sender identity. Every rejection anywhere
//! in the chain lands here through [`ResultsAwareSpamFilter`]; once a sender
//! has a record, it stays rejected until the ban time has elapsed since its
//! last detection. Ban state is always recomputed from the last-activity
//! timestamp, never stored as a boolean, so a record can age out of its ban
//! while still being retained for reputation.
//!
//! Side effects on detection:
//! - a local, authorized sender reporting itself gets its session terminated
//!   with a policy-violation reason
//! - crossing the disable threshold disables the backing account (one-way,
//!   idempotent; repository failures are logged, not retried)

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::KnownSpammersConfig;
use crate::filter::{ResultsAwareSpamFilter, SpamFilter};
use crate::session::Session;
use crate::stanza::{BareJid, Stanza};
use crate::stats::StatsSink;
use crate::vhosts::VirtualHosts;

pub const ID: &str = "known-spammers";

/// Per-sender offender record. Owned exclusively by the cache.
#[derive(Debug, Clone)]
struct SpammerRecord {
    last_activity: Instant,
    detections: u64,
    probability: f64,
    local: bool,
    disable_issued: bool,
}

impl SpammerRecord {
    fn new(local: bool, now: Instant) -> Self {
        Self {
            last_activity: now,
            detections: 0,
            probability: 0.0,
            local,
            disable_issued: false,
        }
    }

    fn record_detection(&mut self, probability: f64, now: Instant) {
        self.last_activity = now;
        self.detections += 1;
        self.probability += probability;
    }

    /// Whether `timeout` has fully elapsed since the last detection.
    fn timeout_elapsed(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) >= timeout
    }

    fn probability_reached(&self, threshold: f64) -> bool {
        self.probability >= threshold
    }
}

/// Read-only view of an offender record, for the admin listing.
#[derive(Debug, Clone)]
pub struct SpammerEntry {
    pub jid: BareJid,
    pub probability: f64,
    pub detections: u64,
    pub local: bool,
    pub banned: bool,
}

impl std::fmt::Display for SpammerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[count: {}, probability: {:.2}, banned: {}]",
            self.jid, self.detections, self.probability, self.banned
        )
    }
}

/// Offender cache filter. See the module docs for the lifecycle.
pub struct KnownSpammersFilter {
    config: KnownSpammersConfig,
    vhosts: Arc<VirtualHosts>,
    spammers: DashMap<BareJid, SpammerRecord>,
    disabled_accounts: AtomicU64,
    // Gauges refreshed by log_spammers / report_statistics.
    local_spammers: AtomicI64,
    remote_spammers: AtomicI64,
}

impl KnownSpammersFilter {
    pub fn new(config: KnownSpammersConfig, vhosts: Arc<VirtualHosts>) -> Self {
        Self {
            config,
            vhosts,
            spammers: DashMap::new(),
            disabled_accounts: AtomicU64::new(0),
            local_spammers: AtomicI64::new(0),
            remote_spammers: AtomicI64::new(0),
        }
    }

    pub fn config(&self) -> &KnownSpammersConfig {
        &self.config
    }

    /// Decision at an explicit instant. The trait impl passes `Instant::now`;
    /// tests and hosts with their own clock pass a chosen instant.
    pub fn filter_at(&self, stanza: &Stanza, now: Instant) -> bool {
        let Some(from) = stanza.from() else {
            return true;
        };
        match self.spammers.get(from.bare()) {
            None => true,
            Some(record) => record.timeout_elapsed(self.config.ban_time(), now),
        }
    }

    /// Record a detection reported by `reporter` at an explicit instant.
    pub fn identified_spam_at(
        &self,
        stanza: &Stanza,
        session: Option<&Session>,
        reporter: &dyn SpamFilter,
        now: Instant,
    ) {
        let sender = stanza
            .from()
            .map(|jid| jid.to_bare())
            .or_else(|| session.and_then(Session::bare_identity));
        let Some(sender) = sender else {
            return;
        };

        let own_session = session.is_some_and(|s| s.is_own_identity(&sender));

        let (probability, newly_over_threshold) = {
            let mut record = self
                .spammers
                .entry(sender.clone())
                .or_insert_with(|| SpammerRecord::new(self.vhosts.is_local(&sender), now));
            record.record_detection(reporter.spam_probability(), now);
            if own_session {
                // An authenticated session on one of our domains is local by
                // definition, whatever the vhost set says.
                record.local = true;
            }
            let newly_over = self.config.disable_account
                && !record.disable_issued
                && record.probability_reached(self.config.disable_account_probability);
            if newly_over {
                record.disable_issued = true;
            }
            (record.probability, newly_over)
        };

        debug!(
            sender = %sender,
            reporter = reporter.id(),
            probability,
            "spam detection recorded"
        );

        // Side effects run outside the record's critical section.
        if let Some(session) = session {
            if own_session {
                debug!(sender = %sender, "local sender detected as spammer, terminating session");
                session.terminate("policy-violation");
            }
            if newly_over_threshold {
                match session.account_repository() {
                    Some(repository) => match repository.set_account_disabled(&sender, true) {
                        Ok(()) => {
                            info!(
                                sender = %sender,
                                probability,
                                threshold = self.config.disable_account_probability,
                                "account disabled as a likely spammer"
                            );
                            self.disabled_accounts.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            warn!(sender = %sender, error = %err, "failed to disable spammer account");
                        }
                    },
                    None => {
                        warn!(sender = %sender, "no account repository on session, cannot disable account");
                    }
                }
            }
        }
    }

    /// Record an external reputation signal (e.g. a federation peer's abuse
    /// report) for `sender`, without a live session.
    ///
    /// Returns whether the accumulated probability now meets the disable
    /// threshold, so the caller can act on its own account storage.
    pub fn report_external_detection(&self, sender: &BareJid) -> bool {
        self.report_external_detection_at(sender, Instant::now())
    }

    pub fn report_external_detection_at(&self, sender: &BareJid, now: Instant) -> bool {
        let mut record = self
            .spammers
            .entry(sender.clone())
            .or_insert_with(|| SpammerRecord::new(self.vhosts.is_local(sender), now));
        record.record_detection(self.config.external_report_increment, now);
        record.probability_reached(self.config.disable_account_probability)
    }

    /// Evict stale records: first those whose probability crossed the disable
    /// threshold (already acted upon), then those past the retention window.
    pub fn clean_up(&self) {
        self.clean_up_at(Instant::now());
    }

    pub fn clean_up_at(&self, now: Instant) {
        if self.spammers.is_empty() {
            return;
        }
        let threshold = self.config.disable_account_probability;
        let retention = self.config.cache_time();
        let before = self.spammers.len();
        self.spammers
            .retain(|_, record| !record.probability_reached(threshold));
        self.spammers
            .retain(|_, record| !record.timeout_elapsed(retention, now));
        let removed = before - self.spammers.len();
        if removed > 0 {
            debug!(removed, remaining = self.spammers.len(), "offender cache cleanup");
        }
    }

    /// Read-only offender listing for operator tooling, sorted by jid.
    pub fn known_spammers(&self, contains: Option<&str>, limit: usize) -> Vec<SpammerEntry> {
        let now = Instant::now();
        let ban_time = self.config.ban_time();
        let mut entries: Vec<SpammerEntry> = self
            .spammers
            .iter()
            .map(|entry| SpammerEntry {
                jid: entry.key().clone(),
                probability: entry.value().probability,
                detections: entry.value().detections,
                local: entry.value().local,
                banned: !entry.value().timeout_elapsed(ban_time, now),
            })
            .filter(|entry| {
                contains.is_none_or(|needle| entry.jid.to_string().contains(needle))
            })
            .collect();
        entries.sort_by(|a, b| a.jid.cmp(&b.jid));
        entries.truncate(limit);
        entries
    }

    /// Forget one offender. The identity is immediately allowed again.
    pub fn remove(&self, sender: &BareJid) -> bool {
        self.spammers.remove(sender).is_some()
    }

    /// Forget all offenders.
    pub fn clear(&self) {
        self.spammers.clear();
    }

    pub fn len(&self) -> usize {
        self.spammers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spammers.is_empty()
    }

    /// Log the current offender list, grouped local/remote then by domain.
    ///
    /// Runs at info level when `print_spammers` is set, at debug otherwise.
    /// Also refreshes the local/remote gauges reported via statistics.
    pub fn log_spammers(&self) {
        let entries = self.known_spammers(None, usize::MAX);
        let (local, remote): (Vec<_>, Vec<_>) = entries.into_iter().partition(|e| e.local);
        self.local_spammers.store(local.len() as i64, Ordering::Relaxed);
        self.remote_spammers.store(remote.len() as i64, Ordering::Relaxed);
        self.log_spammer_group("local", &local);
        self.log_spammer_group("remote", &remote);
    }

    fn log_spammer_group(&self, scope: &str, entries: &[SpammerEntry]) {
        let mut by_domain: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for entry in entries {
            by_domain
                .entry(entry.jid.domain())
                .or_default()
                .push(entry.to_string());
        }
        if self.config.print_spammers {
            info!(
                scope,
                spammers = entries.len(),
                domains = by_domain.len(),
                "known spammers"
            );
        } else {
            debug!(
                scope,
                spammers = entries.len(),
                domains = by_domain.len(),
                "known spammers"
            );
        }
        for (domain, spammers) in &by_domain {
            if self.config.print_spammers {
                info!(scope, domain, spammers = %spammers.join(", "), "spammers for domain");
            } else {
                debug!(scope, domain, spammers = %spammers.join(", "), "spammers for domain");
            }
        }
    }
}

impl SpamFilter for KnownSpammersFilter {
    fn id(&self) -> &'static str {
        ID
    }

    fn filter(&self, stanza: &Stanza, _session: Option<&Session>) -> bool {
        self.filter_at(stanza, Instant::now())
    }

    fn self_reporting(&self) -> bool {
        self.config.count_own_rejections
    }

    fn report_statistics(&self, scope: &str, sink: &StatsSink) {
        sink.set(
            scope,
            &format!("{ID}/known_spammers"),
            self.spammers.len() as i64,
        );
        sink.set(
            scope,
            &format!("{ID}/known_local_spammers"),
            self.local_spammers.load(Ordering::Relaxed),
        );
        sink.set(
            scope,
            &format!("{ID}/known_remote_spammers"),
            self.remote_spammers.load(Ordering::Relaxed),
        );
        sink.set(
            scope,
            &format!("{ID}/disabled_accounts"),
            self.disabled_accounts.load(Ordering::Relaxed) as i64,
        );
    }
}

impl ResultsAwareSpamFilter for KnownSpammersFilter {
    fn identified_spam(&self, stanza: &Stanza, session: Option<&Session>, reporter: &dyn SpamFilter) {
        self.identified_spam_at(stanza, session, reporter, Instant::now());
    }
}
