//! Pipeline configuration.
//!
//! Each filter gets its own strongly-typed config section; the chain itself
//! is an ordered list of filter-kind tags. Unknown tags are reported by the
//! processor at build time and skipped, so a typo disables one filter rather
//! than the whole pipeline.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level configuration for the spam filter pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Answer rejected stanzas with a protocol error instead of dropping
    /// them silently (default: false).
    #[serde(default)]
    pub return_error: bool,
    /// Ordered filter chain, by filter id tag. The known-spammers filter is
    /// always moved to the front at build time regardless of position here.
    #[serde(default = "default_filter_tags")]
    pub filters: Vec<String>,
    /// Known-spammers (offender cache) configuration.
    #[serde(default)]
    pub known_spammers: KnownSpammersConfig,
    /// Repeated-body (content dedup) configuration.
    #[serde(default)]
    pub same_body: SameBodyConfig,
    /// Subscription-request rate limiter configuration.
    #[serde(default)]
    pub subscribe_rate: SubscribeRateConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            return_error: false,
            filters: default_filter_tags(),
            known_spammers: KnownSpammersConfig::default(),
            same_body: SameBodyConfig::default(),
            subscribe_rate: SubscribeRateConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }
}

fn default_filter_tags() -> Vec<String> {
    vec![
        "known-spammers".to_string(),
        "message-same-long-body".to_string(),
        "muc-message-ensure-to-full-jid".to_string(),
        "message-error-ensure-error-child".to_string(),
    ]
}

/// Offender cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct KnownSpammersConfig {
    /// How long a detected sender stays banned after its last detection
    /// (default: 900 = 15 minutes).
    #[serde(default = "default_ban_time_secs")]
    pub ban_time_secs: u64,
    /// How long an idle offender record is retained (default: 604800 = 7 days).
    #[serde(default = "default_cache_time_secs")]
    pub cache_time_secs: u64,
    /// Log the offender list at info level instead of debug (default: false).
    #[serde(default)]
    pub print_spammers: bool,
    /// How often the offender list is logged (default: 86400 = 24 hours).
    #[serde(default = "default_print_frequency_secs")]
    pub print_spammers_frequency_secs: u64,
    /// Disable accounts whose accumulated probability crosses the threshold
    /// (default: true).
    #[serde(default = "default_true")]
    pub disable_account: bool,
    /// Accumulated probability at which an account is disabled (default: 1.0).
    #[serde(default = "default_disable_probability")]
    pub disable_account_probability: f64,
    /// Score increment added by an external abuse report (default: 0.2).
    #[serde(default = "default_external_report_increment")]
    pub external_report_increment: f64,
    /// Whether this cache's own rejections also accumulate probability,
    /// refreshing bans on every blocked attempt (default: true).
    #[serde(default = "default_true")]
    pub count_own_rejections: bool,
}

impl Default for KnownSpammersConfig {
    fn default() -> Self {
        Self {
            ban_time_secs: default_ban_time_secs(),
            cache_time_secs: default_cache_time_secs(),
            print_spammers: false,
            print_spammers_frequency_secs: default_print_frequency_secs(),
            disable_account: true,
            disable_account_probability: default_disable_probability(),
            external_report_increment: default_external_report_increment(),
            count_own_rejections: true,
        }
    }
}

impl KnownSpammersConfig {
    pub fn ban_time(&self) -> Duration {
        Duration::from_secs(self.ban_time_secs)
    }

    pub fn cache_time(&self) -> Duration {
        Duration::from_secs(self.cache_time_secs)
    }

    pub fn print_frequency(&self) -> Duration {
        Duration::from_secs(self.print_spammers_frequency_secs)
    }
}

/// Content dedup configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SameBodyConfig {
    /// Bodies at or below this length are never counted (default: 100).
    #[serde(default = "default_min_body_size")]
    pub min_body_size: usize,
    /// Fingerprint count above which an async cleanup pass is triggered
    /// (default: 10000).
    #[serde(default = "default_cache_size_limit")]
    pub cache_size_limit: usize,
    /// Occurrences of one body allowed before it is rejected (default: 20).
    #[serde(default = "default_repeat_limit")]
    pub repeat_limit: u32,
    /// Structural rules exempting a body from fingerprinting.
    #[serde(default = "default_exemptions")]
    pub exemptions: Vec<ExemptionRule>,
}

impl Default for SameBodyConfig {
    fn default() -> Self {
        Self {
            min_body_size: default_min_body_size(),
            cache_size_limit: default_cache_size_limit(),
            repeat_limit: default_repeat_limit(),
            exemptions: default_exemptions(),
        }
    }
}

/// A structural exemption: bodies matching it carry non-representative
/// content (encrypted payloads, negotiation markers) and bypass hashing.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "rule", rename_all = "kebab-case")]
pub enum ExemptionRule {
    /// Body begins with a recognized plaintext marker.
    Prefix { value: String },
    /// Body is wrapped in a recognized envelope.
    Envelope { header: String, footer: String },
}

impl ExemptionRule {
    pub fn matches(&self, body: &str) -> bool {
        match self {
            ExemptionRule::Prefix { value } => body.starts_with(value.as_str()),
            ExemptionRule::Envelope { header, footer } => {
                body.starts_with(header.as_str()) && body.trim_end().ends_with(footer.as_str())
            }
        }
    }
}

fn default_exemptions() -> Vec<ExemptionRule> {
    vec![
        // OTR plaintext negotiation / encrypted payload marker
        ExemptionRule::Prefix {
            value: "?OTR".to_string(),
        },
        // OpenPGP ASCII armor
        ExemptionRule::Envelope {
            header: "-----BEGIN PGP MESSAGE-----".to_string(),
            footer: "-----END PGP MESSAGE-----".to_string(),
        },
    ]
}

/// Subscription-request rate limiter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeRateConfig {
    /// Subscription requests allowed per sliding minute (default: 5).
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: usize,
}

impl Default for SubscribeRateConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_ban_time_secs() -> u64 {
    15 * 60
}

fn default_cache_time_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_print_frequency_secs() -> u64 {
    24 * 60 * 60
}

fn default_disable_probability() -> f64 {
    1.0
}

fn default_external_report_increment() -> f64 {
    0.2
}

fn default_min_body_size() -> usize {
    100
}

fn default_cache_size_limit() -> usize {
    10_000
}

fn default_repeat_limit() -> u32 {
    20
}

fn default_requests_per_minute() -> usize {
    5
}
