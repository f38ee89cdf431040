//! Delivery queue and processor for handling outbound mail from the spool
//!
//! This module provides functionality to:
//! - Track messages pending delivery
//! - Resolve MX servers and manage delivery attempts with retry/backoff
//! - Send messages via SMTP, enforcing per-domain TLS and security policy
//! - Generate DSNs for messages that give up permanently

#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod circuit_breaker;
pub mod courier;
pub mod dns;
pub mod domain_config;
pub mod dsn;
pub mod error;
pub mod policy;
pub mod processor;
pub mod queue;
pub mod rate_limiter;
pub mod service;
mod smtp_transaction;
pub mod types;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use courier::{LocalMdaConfig, LocalMdaCourier, PipeCourier};
pub use dns::{DnsConfig, DnsError, DnsResolver, HickoryDnsResolver, MailServer};
pub use domain_config::{DomainConfig, DomainConfigRegistry};
pub use dsn::{DsnConfig, generate_dsn, should_generate_dsn};
pub use empath_common::{DeliveryAttempt, DeliveryStatus};
pub use error::{DeliveryError, PermanentError, SystemError, TemporaryError};
pub use policy::{DomainPolicyResolver, RetryPolicy};
pub use processor::DeliveryProcessor;
pub use queue::DeliveryQueue;
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use service::DeliveryQueryService;
pub use types::{DeliveryInfo, SmtpTimeouts};

#[cfg(any(test, feature = "test-support"))]
pub use dns::MockDnsResolver;

#[cfg(any(test, feature = "test-support"))]
mod mock_dns {
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::dns::{DnsError, DnsResolver, MailServer};

    /// Canned DNS resolver for integration tests: returns whatever
    /// `resolve_mail_servers` closure the caller installs, without touching
    /// the network.
    #[derive(Default)]
    pub struct MockDnsResolver {
        servers: Mutex<std::collections::HashMap<String, Arc<Vec<MailServer>>>>,
    }

    impl std::fmt::Debug for MockDnsResolver {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockDnsResolver").finish_non_exhaustive()
        }
    }

    impl MockDnsResolver {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, domain: impl Into<String>, servers: Vec<MailServer>) {
            self.servers.lock().insert(domain.into(), Arc::new(servers));
        }
    }

    #[async_trait]
    impl DnsResolver for MockDnsResolver {
        async fn resolve_mail_servers(
            &self,
            domain: &str,
        ) -> Result<Arc<Vec<MailServer>>, DnsError> {
            self.servers
                .lock()
                .get(domain)
                .cloned()
                .ok_or_else(|| DnsError::NoMailServers(domain.to_string()))
        }

        async fn validate_domain(&self, domain: &str) -> Result<(), DnsError> {
            if self.servers.lock().contains_key(domain) {
                Ok(())
            } else {
                Err(DnsError::DomainNotFound(domain.to_string()))
            }
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use mock_dns::MockDnsResolver as _;
#[cfg(any(test, feature = "test-support"))]
pub use mock_dns::MockDnsResolver;
