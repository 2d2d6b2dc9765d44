//! Sliding-window rate limiter for presence subscription requests.
//!
//! Applies only to subscription requests originating from the session's own
//! connection while authorized; relayed and third-party stanzas pass
//! untouched. The counter lives in session scratch data and dies with the
//! session.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::SubscribeRateConfig;
use crate::filter::SpamFilter;
use crate::session::Session;
use crate::stanza::{Stanza, StanzaKind, StanzaType};

pub const ID: &str = "presence-subscribe";

/// Length of the sliding window.
const WINDOW: Duration = Duration::from_secs(60);

/// Per-session request counter: a time-ascending sequence of recent request
/// timestamps, all within the sliding window.
///
/// A session processes one stanza at a time per connection, but admin and
/// maintenance paths may inspect the counter concurrently, so it carries its
/// own lock.
#[derive(Debug, Default)]
pub struct RateCounter {
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateCounter {
    /// Record a request and decide whether it is within `limit`.
    ///
    /// Appends the current timestamp, expires entries older than the window,
    /// and rejects when more than `limit` requests remain, truncating the
    /// sequence back down to `limit` so one sustained burst cannot extend
    /// the rejection forever.
    pub fn check(&self, limit: usize) -> bool {
        self.check_at(limit, Instant::now())
    }

    pub fn check_at(&self, limit: usize, now: Instant) -> bool {
        let mut timestamps = self.timestamps.lock();
        timestamps.push_back(now);
        while let Some(&front) = timestamps.front() {
            if now.saturating_duration_since(front) > WINDOW {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        if timestamps.len() > limit {
            while timestamps.len() > limit {
                timestamps.pop_front();
            }
            return false;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.timestamps.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.lock().is_empty()
    }
}

/// Subscription-request rate limit filter.
pub struct SubscribeRateFilter {
    config: SubscribeRateConfig,
}

impl SubscribeRateFilter {
    pub fn new(config: SubscribeRateConfig) -> Self {
        Self { config }
    }

    /// Decision at an explicit instant, for tests and hosts with their own
    /// clock.
    pub fn filter_at(&self, stanza: &Stanza, session: Option<&Session>, now: Instant) -> bool {
        if stanza.kind() != StanzaKind::Presence
            || stanza.stanza_type() != Some(StanzaType::Subscribe)
        {
            return true;
        }
        let Some(session) = session else {
            return true;
        };
        // Only requests sent by this session's own connection count; stanzas
        // routed through from elsewhere are someone else's traffic.
        if !session.is_authorized() || stanza.connection() != Some(session.connection_id()) {
            return true;
        }

        let counter = session.scratch_or_insert_with::<RateCounter, _>(ID, RateCounter::default);
        let allowed = counter.check_at(self.config.requests_per_minute, now);
        if !allowed {
            debug!(connection = %session.connection_id(), "subscription request rate exceeded");
        }
        allowed
    }
}

impl SpamFilter for SubscribeRateFilter {
    fn id(&self) -> &'static str {
        ID
    }

    fn filter(&self, stanza: &Stanza, session: Option<&Session>) -> bool {
        self.filter_at(stanza, session, Instant::now())
    }

    fn spam_probability(&self) -> f64 {
        0.4
    }
}
