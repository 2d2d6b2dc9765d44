//! Filter capability contracts and the built-in filters.
//!
//! A filter is a small, independently configured unit with one decision
//! function. Built-ins:
//! - **known-spammers**: offender cache with probability accumulation and
//!   time-bounded bans
//! - **message-same-long-body**: content dedup cache for repeated-body floods
//! - **presence-subscribe**: sliding-window rate limiter for subscription
//!   requests
//! - **muc-message-ensure-to-full-jid** / **message-error-ensure-error-child**:
//!   stateless structural validity checks

pub mod known_spammers;
pub mod same_body;
pub mod structural;
pub mod subscribe_rate;

pub use known_spammers::{KnownSpammersFilter, SpammerEntry};
pub use same_body::SameLongBodyFilter;
pub use structural::{MessageErrorEnsureErrorChild, MucMessageEnsureToFullJid};
pub use subscribe_rate::{RateCounter, SubscribeRateFilter};

use crate::session::Session;
use crate::stanza::Stanza;
use crate::stats::StatsSink;

/// A single spam filter.
///
/// Implementations are shared across all stanza-processing workers, so any
/// internal state must be synchronized. `filter` must be non-blocking and
/// must not panic on malformed input: an internal fault is logged and
/// answered with `true` (fail open) so infrastructure errors never produce
/// false positives.
pub trait SpamFilter: Send + Sync {
    /// Stable unique id, used for statistics namespacing and configuration.
    fn id(&self) -> &'static str;

    /// Decide on a stanza. `false` means spam: reject and flag.
    fn filter(&self, stanza: &Stanza, session: Option<&Session>) -> bool;

    /// Confidence weight this filter contributes to reputation accumulation
    /// when it rejects a stanza. 1.0 means certain.
    fn spam_probability(&self) -> f64 {
        1.0
    }

    /// Whether this filter's own rejections should be reported back to it
    /// (and to reputation accumulation) through [`ResultsAwareSpamFilter`].
    fn self_reporting(&self) -> bool {
        true
    }

    /// Publish filter-specific counters. Chain-level counters (processed,
    /// rejected, timing) are published by the processor.
    fn report_statistics(&self, scope: &str, sink: &StatsSink) {
        let _ = (scope, sink);
    }
}

/// A filter that wants to hear about every rejection in the chain, no matter
/// which filter produced it. This is how the offender cache accumulates
/// reputation from filters that know nothing about reputations.
pub trait ResultsAwareSpamFilter: SpamFilter {
    /// Called by the processor after any filter rejected `stanza`.
    fn identified_spam(&self, stanza: &Stanza, session: Option<&Session>, reporter: &dyn SpamFilter);
}
