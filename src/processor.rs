//! Filter chain coordinator.
//!
//! Owns the ordered, immutable filter sequence assembled once at startup
//! from [`PipelineConfig`]. Per stanza the chain is walked in order; the
//! first rejection stops it, fans the detection out to every results-aware
//! filter, and executes the side-effect protocol (drop or error bounce).
//! Runtime reconfiguration is a rebuild, never in-place mutation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::filter::{
    KnownSpammersFilter, MessageErrorEnsureErrorChild, MucMessageEnsureToFullJid,
    ResultsAwareSpamFilter, SameLongBodyFilter, SpamFilter, SpammerEntry, SubscribeRateFilter,
    known_spammers,
};
use crate::session::Session;
use crate::stanza::Stanza;
use crate::stats::StatsSink;
use crate::vhosts::VirtualHosts;

/// Statistics scope of the whole pipeline.
pub const ID: &str = "spam-filter";

/// Outcome of running a stanza through the chain.
#[derive(Debug)]
pub enum Verdict {
    /// No filter objected; the host should route the stanza normally.
    Allow,
    /// A filter flagged the stanza as spam. When the pipeline is configured
    /// to answer with an error, `error_response` carries the bounce to send;
    /// otherwise the stanza has been marked processed and is silently
    /// dropped.
    Reject { error_response: Option<Stanza> },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// Chain-level counters for one filter, updated on every invocation.
#[derive(Debug, Default)]
struct FilterMetrics {
    processed: AtomicU64,
    rejected: AtomicU64,
    total_micros: AtomicU64,
}

impl FilterMetrics {
    fn record(&self, elapsed: Duration, allowed: bool) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if !allowed {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        self.total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    fn average_micros(&self) -> u64 {
        let processed = self.processed.load(Ordering::Relaxed);
        if processed == 0 {
            0
        } else {
            self.total_micros.load(Ordering::Relaxed) / processed
        }
    }
}

struct FilterEntry {
    filter: Arc<dyn SpamFilter>,
    metrics: FilterMetrics,
}

impl FilterEntry {
    fn new(filter: Arc<dyn SpamFilter>) -> Self {
        Self {
            filter,
            metrics: FilterMetrics::default(),
        }
    }
}

/// The assembled pipeline. Cheap to share behind an `Arc`; all state is
/// interior and synchronized.
pub struct SpamProcessor {
    filters: Vec<FilterEntry>,
    results_aware: Vec<Arc<dyn ResultsAwareSpamFilter>>,
    return_error: bool,
    offender_cache: Option<Arc<KnownSpammersFilter>>,
}

impl SpamProcessor {
    /// Assemble the chain from configuration.
    ///
    /// Unknown and duplicate filter tags are logged and skipped, so one bad
    /// config line disables one filter instead of the pipeline. The
    /// known-spammers filter, when present, is moved to the front: it is the
    /// cheapest and most authoritative already-known-bad check.
    pub fn new(config: &PipelineConfig, vhosts: Arc<VirtualHosts>) -> Self {
        let mut filters: Vec<FilterEntry> = Vec::new();
        let mut results_aware: Vec<Arc<dyn ResultsAwareSpamFilter>> = Vec::new();
        let mut offender_cache = None;

        for tag in &config.filters {
            if filters.iter().any(|entry| entry.filter.id() == tag) {
                warn!(filter = %tag, "duplicate filter tag in config, skipping");
                continue;
            }
            match tag.as_str() {
                known_spammers::ID => {
                    let cache = Arc::new(KnownSpammersFilter::new(
                        config.known_spammers.clone(),
                        Arc::clone(&vhosts),
                    ));
                    filters.push(FilterEntry::new(cache.clone()));
                    results_aware.push(cache.clone());
                    offender_cache = Some(cache);
                }
                crate::filter::same_body::ID => {
                    filters.push(FilterEntry::new(Arc::new(SameLongBodyFilter::new(
                        config.same_body.clone(),
                    ))));
                }
                crate::filter::subscribe_rate::ID => {
                    filters.push(FilterEntry::new(Arc::new(SubscribeRateFilter::new(
                        config.subscribe_rate.clone(),
                    ))));
                }
                crate::filter::structural::MUC_TO_FULL_JID_ID => {
                    filters.push(FilterEntry::new(Arc::new(MucMessageEnsureToFullJid)));
                }
                crate::filter::structural::MESSAGE_ERROR_ID => {
                    filters.push(FilterEntry::new(Arc::new(MessageErrorEnsureErrorChild)));
                }
                other => {
                    warn!(filter = %other, "unknown filter tag in config, skipping");
                }
            }
        }

        // Ordering is finalized here, not at dispatch time.
        filters.sort_by_key(|entry| entry.filter.id() != known_spammers::ID);

        debug!(
            filters = %filters
                .iter()
                .map(|entry| entry.filter.id())
                .collect::<Vec<_>>()
                .join(","),
            return_error = config.return_error,
            "spam filter chain assembled"
        );

        Self {
            filters,
            results_aware,
            return_error: config.return_error,
            offender_cache,
        }
    }

    /// Run one stanza through the chain. Never fails; filter internals are
    /// not allowed to destabilize the calling pipeline.
    pub fn process(&self, stanza: &Stanza, session: Option<&Session>) -> Verdict {
        for entry in &self.filters {
            let start = Instant::now();
            let allowed = entry.filter.filter(stanza, session);
            entry.metrics.record(start.elapsed(), allowed);
            if allowed {
                continue;
            }

            debug!(
                filter = entry.filter.id(),
                return_error = self.return_error,
                "stanza rejected as spam"
            );
            for aware in &self.results_aware {
                if aware.id() == entry.filter.id() && !entry.filter.self_reporting() {
                    continue;
                }
                aware.identified_spam(stanza, session, entry.filter.as_ref());
            }

            let error_response = if self.return_error {
                Some(stanza.error_response())
            } else {
                stanza.mark_processed();
                None
            };
            return Verdict::Reject { error_response };
        }
        Verdict::Allow
    }

    /// Ids of the assembled filters, in execution order.
    pub fn filter_ids(&self) -> Vec<&'static str> {
        self.filters.iter().map(|entry| entry.filter.id()).collect()
    }

    /// The offender cache, when the chain contains one. Absence is a defined
    /// state the caller must handle (e.g. report "storage unavailable").
    pub fn offender_cache(&self) -> Option<&Arc<KnownSpammersFilter>> {
        self.offender_cache.as_ref()
    }

    /// Read-only offender listing for operator tooling. `None` when the
    /// chain has no offender cache.
    pub fn known_spammers(
        &self,
        contains: Option<&str>,
        limit: usize,
    ) -> Option<Vec<SpammerEntry>> {
        self.offender_cache
            .as_ref()
            .map(|cache| cache.known_spammers(contains, limit))
    }

    /// Publish chain-level and per-filter counters into the sink.
    pub fn report_statistics(&self, sink: &StatsSink) {
        for entry in &self.filters {
            let id = entry.filter.id();
            sink.set(
                ID,
                &format!("{id}/processed"),
                entry.metrics.processed.load(Ordering::Relaxed) as i64,
            );
            sink.set(
                ID,
                &format!("{id}/rejected"),
                entry.metrics.rejected.load(Ordering::Relaxed) as i64,
            );
            sink.set(
                ID,
                &format!("{id}/total_processing_micros"),
                entry.metrics.total_micros.load(Ordering::Relaxed) as i64,
            );
            sink.set(
                ID,
                &format!("{id}/avg_processing_micros"),
                entry.metrics.average_micros() as i64,
            );
            entry.filter.report_statistics(ID, sink);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KnownSpammersConfig, SameBodyConfig};
    use crate::stanza::Jid;

    const FLOOD_BODY: &str = "Here we need some long and ugly spam message, padded well \
                              past the configured body size threshold for this test.";

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            same_body: SameBodyConfig {
                min_body_size: 20,
                repeat_limit: 2,
                ..SameBodyConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    fn processor(config: &PipelineConfig) -> SpamProcessor {
        SpamProcessor::new(config, Arc::new(VirtualHosts::new(["example.com"])))
    }

    fn flood_message(from: &str) -> Stanza {
        let from: Jid = from.parse().unwrap();
        let to: Jid = "victim@example.com".parse().unwrap();
        Stanza::message(from, to, FLOOD_BODY)
    }

    #[test]
    fn known_spammers_runs_first_regardless_of_config_order() {
        let config = PipelineConfig {
            filters: vec![
                "message-same-long-body".to_string(),
                "known-spammers".to_string(),
            ],
            ..test_config()
        };
        let processor = processor(&config);
        assert_eq!(
            processor.filter_ids(),
            vec!["known-spammers", "message-same-long-body"]
        );
    }

    #[test]
    fn unknown_and_duplicate_tags_are_skipped() {
        let config = PipelineConfig {
            filters: vec![
                "known-spammers".to_string(),
                "no-such-filter".to_string(),
                "known-spammers".to_string(),
            ],
            ..test_config()
        };
        let processor = processor(&config);
        assert_eq!(processor.filter_ids(), vec!["known-spammers"]);
    }

    #[test]
    fn clean_traffic_is_allowed() {
        let processor = processor(&test_config());
        let verdict = processor.process(&flood_message("alice@example.com"), None);
        assert!(verdict.is_allowed());
    }

    #[test]
    fn rejection_feeds_the_offender_cache() {
        let processor = processor(&test_config());
        let sender = "spammer@evil.example";

        // Flood until the dedup filter rejects.
        for _ in 0..2 {
            assert!(processor.process(&flood_message(sender), None).is_allowed());
        }
        assert!(!processor.process(&flood_message(sender), None).is_allowed());

        // The offender cache heard about it: a fresh, different message from
        // the same sender is now rejected by the cache directly.
        let from: Jid = sender.parse().unwrap();
        let to: Jid = "victim@example.com".parse().unwrap();
        let fresh = Stanza::message(from, to, "something entirely new");
        assert!(!processor.process(&fresh, None).is_allowed());

        let spammers = processor.known_spammers(None, 10).unwrap();
        assert_eq!(spammers.len(), 1);
        assert_eq!(spammers[0].jid.to_string(), sender);
    }

    #[test]
    fn silent_drop_marks_the_stanza_processed() {
        let processor = processor(&test_config());
        let sender = "spammer@evil.example";
        for _ in 0..2 {
            processor.process(&flood_message(sender), None);
        }
        let stanza = flood_message(sender);
        let verdict = processor.process(&stanza, None);
        match verdict {
            Verdict::Reject { error_response } => assert!(error_response.is_none()),
            Verdict::Allow => panic!("expected rejection"),
        }
        assert!(stanza.is_processed());
    }

    #[test]
    fn return_error_synthesizes_a_bounce() {
        let config = PipelineConfig {
            return_error: true,
            ..test_config()
        };
        let processor = processor(&config);
        let sender = "spammer@evil.example";
        for _ in 0..2 {
            processor.process(&flood_message(sender), None);
        }
        let stanza = flood_message(sender);
        let verdict = processor.process(&stanza, None);
        match verdict {
            Verdict::Reject { error_response } => {
                let response = error_response.expect("bounce expected");
                assert_eq!(response.to().unwrap().to_string(), sender);
            }
            Verdict::Allow => panic!("expected rejection"),
        }
        // The bounce replaces the processed marker.
        assert!(!stanza.is_processed());
    }

    #[test]
    fn self_reporting_opt_out_freezes_the_score() {
        let base = KnownSpammersConfig {
            disable_account: false,
            ..KnownSpammersConfig::default()
        };
        let sender = "spammer@evil.example";

        // Default: the cache's own rejections keep accumulating.
        let config = PipelineConfig {
            known_spammers: base.clone(),
            ..test_config()
        };
        let with_self = processor(&config);
        for _ in 0..3 {
            with_self.process(&flood_message(sender), None);
        }
        let first_score = with_self.known_spammers(None, 1).unwrap()[0].probability;
        with_self.process(&flood_message(sender), None);
        let second_score = with_self.known_spammers(None, 1).unwrap()[0].probability;
        assert!(second_score > first_score);

        // Opted out: once banned, further blocked attempts change nothing.
        let config = PipelineConfig {
            known_spammers: KnownSpammersConfig {
                count_own_rejections: false,
                ..base
            },
            ..test_config()
        };
        let without_self = processor(&config);
        for _ in 0..3 {
            without_self.process(&flood_message(sender), None);
        }
        let first_score = without_self.known_spammers(None, 1).unwrap()[0].probability;
        without_self.process(&flood_message(sender), None);
        let second_score = without_self.known_spammers(None, 1).unwrap()[0].probability;
        assert!((second_score - first_score).abs() < 1e-9);
    }

    #[test]
    fn statistics_cover_every_filter() {
        let processor = processor(&test_config());
        processor.process(&flood_message("alice@example.com"), None);

        let sink = StatsSink::new();
        processor.report_statistics(&sink);
        for id in processor.filter_ids() {
            assert!(sink.get(ID, &format!("{id}/processed")).is_some(), "{id}");
            assert!(sink.get(ID, &format!("{id}/rejected")).is_some(), "{id}");
        }
        // Filter-specific counters ride along.
        assert!(sink.get(ID, "known-spammers/known_spammers").is_some());
        assert!(sink.get(ID, "message-same-long-body/cache_size").is_some());
    }
}
