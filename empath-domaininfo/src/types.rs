//! Ordered security level and the per-domain record that tracks it.

use serde::{Deserialize, Serialize};

/// Transport security quality, ordered low to high (§3).
///
/// Declaration order is derive-significant: `PartialOrd`/`Ord` compare
/// variants in the order they're written, so `Plain < TlsInsecure <
/// TlsClient < TlsSecure` falls directly out of this list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SecurityLevel {
    /// No TLS.
    Plain,
    /// TLS negotiated, but the peer certificate wasn't validated.
    TlsInsecure,
    /// TLS negotiated with a certificate valid for the peer's client identity.
    TlsClient,
    /// TLS negotiated with full certificate validation against the domain.
    TlsSecure,
}

impl Default for SecurityLevel {
    fn default() -> Self {
        Self::Plain
    }
}

/// Which side of a connection a security level applies to; domains track
/// one independent level per direction (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// The persisted per-domain record: highest level ever observed in each
/// direction.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DomainRecord {
    pub incoming: SecurityLevel,
    pub outgoing: SecurityLevel,
}

impl DomainRecord {
    pub(crate) const fn level(&self, direction: Direction) -> SecurityLevel {
        match direction {
            Direction::Incoming => self.incoming,
            Direction::Outgoing => self.outgoing,
        }
    }

    pub(crate) fn set_level(&mut self, direction: Direction, level: SecurityLevel) {
        match direction {
            Direction::Incoming => self.incoming = level,
            Direction::Outgoing => self.outgoing = level,
        }
    }
}
