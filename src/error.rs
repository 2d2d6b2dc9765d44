//! Error types for the filter pipeline.
//!
//! Errors here never cross back to the caller of
//! [`SpamProcessor::process`](crate::processor::SpamProcessor::process):
//! configuration problems drop the failing filter from the chain, runtime
//! filter faults fail open, and side-effect faults are logged where they
//! happen. These types exist for the seams where a collaborator can report
//! failure (account repository, config loading, jid parsing).

use thiserror::Error;

/// Failure reported by the host's account repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("account storage unavailable")]
    Unavailable,

    #[error("account storage failure: {0}")]
    Backend(String),
}

/// Configuration loading/parsing failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A string that does not form a valid jid.
#[derive(Debug, Error)]
#[error("invalid jid: {0:?}")]
pub struct JidError(String);

impl JidError {
    pub(crate) fn new(input: &str) -> Self {
        Self(input.to_string())
    }
}
