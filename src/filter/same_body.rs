//! Repeated-body flood detection.
//!
//! Counts occurrences of SHA-256 fingerprints of long message bodies and
//! rejects a body once it has been seen more often than the configured
//! repeat limit. Memory stays bounded: when the fingerprint map outgrows its
//! ceiling a single background cleanup pass drops every fingerprint that
//! never became spammy, freeing space for new entries without blocking the
//! hot path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::SameBodyConfig;
use crate::filter::SpamFilter;
use crate::session::Session;
use crate::stanza::{Stanza, StanzaKind, StanzaType};
use crate::stats::StatsSink;

pub const ID: &str = "message-same-long-body";

type Fingerprint = [u8; 32];

#[derive(Debug, Default)]
struct DedupState {
    counters: DashMap<Fingerprint, u32>,
    cleaner_running: AtomicBool,
    cleanup_passes: AtomicU64,
}

impl DedupState {
    /// Remove every fingerprint still below the repeat limit. Entries at or
    /// above the limit are kept: they identify active floods.
    fn run_cleanup(&self, repeat_limit: u32) {
        let before = self.counters.len();
        self.counters.retain(|_, count| *count >= repeat_limit);
        self.cleanup_passes.fetch_add(1, Ordering::Relaxed);
        debug!(
            removed = before - self.counters.len(),
            remaining = self.counters.len(),
            "fingerprint cache cleanup"
        );
        self.cleaner_running.store(false, Ordering::Release);
    }
}

/// Content dedup filter. One instance is shared by all workers.
pub struct SameLongBodyFilter {
    config: SameBodyConfig,
    state: Arc<DedupState>,
}

impl SameLongBodyFilter {
    pub fn new(config: SameBodyConfig) -> Self {
        Self {
            config,
            state: Arc::new(DedupState::default()),
        }
    }

    /// Number of fingerprints currently tracked.
    pub fn cache_size(&self) -> usize {
        self.state.counters.len()
    }

    fn is_exempt(&self, body: &str) -> bool {
        self.config.exemptions.iter().any(|rule| rule.matches(body))
    }

    /// Kick off one asynchronous cleanup pass unless one is already running.
    fn trigger_cleanup(&self) {
        if self
            .state
            .cleaner_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let state = Arc::clone(&self.state);
        let repeat_limit = self.config.repeat_limit;
        let spawned = std::thread::Builder::new()
            .name(format!("{ID}-cleaner"))
            .spawn(move || state.run_cleanup(repeat_limit));
        if let Err(err) = spawned {
            // Fail open: reset the guard so a later overflow can retry.
            warn!(error = %err, "could not spawn fingerprint cleanup thread");
            self.state.cleaner_running.store(false, Ordering::Release);
        }
    }

    /// Synchronous cleanup, for maintenance paths and tests.
    pub fn run_cleanup_now(&self) {
        if self
            .state
            .cleaner_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.state.run_cleanup(self.config.repeat_limit);
        }
    }
}

impl SpamFilter for SameLongBodyFilter {
    fn id(&self) -> &'static str {
        ID
    }

    fn filter(&self, stanza: &Stanza, _session: Option<&Session>) -> bool {
        if stanza.kind() != StanzaKind::Message
            || stanza.stanza_type() == Some(StanzaType::Groupchat)
        {
            return true;
        }
        let Some(body) = stanza.body() else {
            return true;
        };
        if body.len() <= self.config.min_body_size || self.is_exempt(body) {
            return true;
        }

        let fingerprint: Fingerprint = Sha256::digest(body.as_bytes()).into();
        let count = {
            let mut entry = self.state.counters.entry(fingerprint).or_insert(0);
            *entry += 1;
            *entry
        };

        if self.state.counters.len() > self.config.cache_size_limit {
            self.trigger_cleanup();
        }

        if count > self.config.repeat_limit {
            if count <= self.config.repeat_limit + 10 {
                debug!(count, "repeated long body assumed to be spam");
            }
            return false;
        }
        true
    }

    fn report_statistics(&self, scope: &str, sink: &StatsSink) {
        sink.set(scope, &format!("{ID}/cache_size"), self.cache_size() as i64);
        sink.set(
            scope,
            &format!("{ID}/cleanup_passes"),
            self.state.cleanup_passes.load(Ordering::Relaxed) as i64,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExemptionRule;
    use crate::stanza::Jid;

    const LONG_BODY: &str = "Here we need some long and ugly spam message, padded well \
                             past the default one hundred byte threshold for long bodies.";

    fn small_filter(repeat_limit: u32) -> SameLongBodyFilter {
        SameLongBodyFilter::new(SameBodyConfig {
            min_body_size: 20,
            repeat_limit,
            ..SameBodyConfig::default()
        })
    }

    fn message(body: &str) -> Stanza {
        let from: Jid = "spammer@example.com".parse().unwrap();
        let to: Jid = "recipient@example.com".parse().unwrap();
        Stanza::message(from, to, body)
    }

    #[test]
    fn repeats_below_limit_pass_then_reject() {
        let filter = small_filter(3);
        for _ in 0..3 {
            assert!(filter.filter(&message(LONG_BODY), None));
        }
        // Fourth identical body crosses the limit.
        assert!(!filter.filter(&message(LONG_BODY), None));
        assert!(!filter.filter(&message(LONG_BODY), None));
    }

    #[test]
    fn different_bodies_do_not_share_a_counter() {
        let filter = small_filter(1);
        let other = "A completely different body, also long enough to be fingerprinted.";
        assert!(filter.filter(&message(LONG_BODY), None));
        assert!(filter.filter(&message(other), None));
        assert!(!filter.filter(&message(LONG_BODY), None));
        // The other body is still at one occurrence.
        assert!(!filter.filter(&message(other), None));
        assert_eq!(filter.cache_size(), 2);
    }

    #[test]
    fn short_groupchat_and_bodyless_stanzas_pass() {
        let filter = small_filter(0);
        assert!(filter.filter(&message("short"), None));

        let from: Jid = "room@muc.example.com/nick".parse().unwrap();
        let to: Jid = "user@example.com".parse().unwrap();
        let groupchat = Stanza::new(StanzaKind::Message)
            .with_type(StanzaType::Groupchat)
            .with_from(from.clone())
            .with_to(to.clone())
            .with_body(LONG_BODY);
        assert!(filter.filter(&groupchat, None));

        let presence = Stanza::subscribe(from, to);
        assert!(filter.filter(&presence, None));
    }

    #[test]
    fn exempt_bodies_bypass_fingerprinting() {
        let filter = SameLongBodyFilter::new(SameBodyConfig {
            min_body_size: 10,
            repeat_limit: 0,
            exemptions: vec![ExemptionRule::Prefix {
                value: "?OTR".to_string(),
            }],
            ..SameBodyConfig::default()
        });
        let otr = "?OTR:AAMDJ+MVmSfjFZcAAAAAAQAAAAIAAADA1g5IjD1ZGLDVQEyCgCyn9hb";
        for _ in 0..5 {
            assert!(filter.filter(&message(otr), None));
        }
        assert_eq!(filter.cache_size(), 0);
    }

    #[test]
    fn cleanup_keeps_spammy_fingerprints_only() {
        let filter = small_filter(2);
        // One flooding body (3 occurrences, >= limit) and one one-off.
        for _ in 0..3 {
            filter.filter(&message(LONG_BODY), None);
        }
        filter.filter(
            &message("A one-off body that is long enough to be counted once."),
            None,
        );
        assert_eq!(filter.cache_size(), 2);

        filter.run_cleanup_now();
        assert_eq!(filter.cache_size(), 1);
        // The flood is still rejected after cleanup.
        assert!(!filter.filter(&message(LONG_BODY), None));
    }

    #[test]
    fn overflow_triggers_single_flight_cleanup() {
        let filter = SameLongBodyFilter::new(SameBodyConfig {
            min_body_size: 10,
            cache_size_limit: 4,
            repeat_limit: 2,
            ..SameBodyConfig::default()
        });
        for i in 0..8 {
            let body = format!("unique filler body number {i}, long enough to count");
            filter.filter(&message(&body), None);
        }
        // Cleanup runs on a background thread; wait for the guard to clear.
        for _ in 0..100 {
            if !filter.state.cleaner_running.load(Ordering::Acquire)
                && filter.state.cleanup_passes.load(Ordering::Relaxed) > 0
            {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(filter.state.cleanup_passes.load(Ordering::Relaxed) >= 1);
        // Every fingerprint was below the limit, so the map drained.
        assert!(filter.cache_size() < 8);
    }
}
