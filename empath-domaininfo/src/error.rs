//! Error type for the domain-info store.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainInfoError {
    #[error("failed to read domain-info record for {domain}: {source}")]
    Read {
        domain: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to persist domain-info record for {domain}: {source}")]
    Write {
        domain: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt domain-info record for {domain}: {reason}")]
    Corrupt { domain: String, reason: String },
}
