//! spamgate — in-line spam filtering for a message-routing server.
//!
//! The host server hands every inbound stanza, together with its session
//! context, to a [`SpamProcessor`]. The processor walks an ordered chain of
//! [`SpamFilter`]s; the first rejection flags the stanza as spam, feeds the
//! detection to the reputation-tracking filters, and either drops the stanza
//! silently or answers it with a protocol error, per configuration.
//!
//! Built-in filters: a known-offender cache with probability accumulation
//! and time-bounded bans, a content dedup cache against repeated-body
//! floods, a sliding-window rate limiter for presence subscription requests,
//! and two stateless structural validity checks.
//!
//! ```
//! use std::sync::Arc;
//! use spamgate::{PipelineConfig, SpamProcessor, Stanza, VirtualHosts};
//!
//! let config = PipelineConfig::default();
//! let processor = SpamProcessor::new(&config, Arc::new(VirtualHosts::new(["example.com"])));
//!
//! let from = "alice@example.com".parse().unwrap();
//! let to = "bob@example.com".parse().unwrap();
//! let stanza = Stanza::message(from, to, "hello");
//! assert!(processor.process(&stanza, None).is_allowed());
//! ```

pub mod config;
pub mod error;
pub mod filter;
pub mod maintenance;
pub mod processor;
pub mod session;
pub mod stanza;
pub mod stats;
pub mod vhosts;

pub use config::{
    ExemptionRule, KnownSpammersConfig, PipelineConfig, SameBodyConfig, SubscribeRateConfig,
};
pub use error::{ConfigError, JidError, RepositoryError};
pub use filter::{
    KnownSpammersFilter, ResultsAwareSpamFilter, SameLongBodyFilter, SpamFilter, SpammerEntry,
    SubscribeRateFilter,
};
pub use maintenance::MaintenanceHandle;
pub use processor::{SpamProcessor, Verdict};
pub use session::{AccountRepository, MemoryAccountRepository, Session};
pub use stanza::{BareJid, ConnectionId, Jid, Stanza, StanzaKind, StanzaType};
pub use stats::StatsSink;
pub use vhosts::VirtualHosts;
