//! Parsed shapes for alias file entries.

use serde::{Deserialize, Serialize};

/// One resolved right-hand side of an alias entry.
///
/// `email` entries recurse during resolution; `pipe` and `forward` are
/// terminal (§4.C).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RightHandSide {
    /// Plain `local@domain` forward. Recursed on during resolution.
    Email(String),
    /// `| command arg1 arg2 ...` — delivered by invoking the command.
    Pipe(String),
    /// `addr via host1/host2` — forward through an explicit relay list.
    Forward { address: String, via: Vec<String> },
}

impl RightHandSide {
    /// The address this entry ultimately targets, for display/logging.
    #[must_use]
    pub fn address(&self) -> &str {
        match self {
            Self::Email(addr) | Self::Forward { address: addr, .. } => addr,
            Self::Pipe(cmd) => cmd,
        }
    }

    /// Whether this entry is a terminal recipient (not recursed further).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Email(_))
    }
}

/// A fully resolved recipient returned by [`crate::resolver::AliasResolver::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolvedRecipient {
    /// Final email address; queue attempts local or remote delivery.
    Email(String),
    /// Pipe alias; queue invokes the command directly.
    Pipe(String),
    /// Forward through explicit relay hosts.
    Forward { address: String, via: Vec<String> },
}

impl From<RightHandSide> for ResolvedRecipient {
    fn from(rhs: RightHandSide) -> Self {
        match rhs {
            RightHandSide::Email(addr) => Self::Email(addr),
            RightHandSide::Pipe(cmd) => Self::Pipe(cmd),
            RightHandSide::Forward { address, via } => Self::Forward { address, via },
        }
    }
}

/// One `key: rhs1, rhs2, ...` line, already split into local part + domain.
#[derive(Debug, Clone)]
pub(crate) struct AliasKey {
    pub local: String,
    pub domain: String,
}

impl AliasKey {
    pub(crate) fn normalized(&self) -> String {
        format!("{}@{}", self.local, self.domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_terminal_matches_spec() {
        assert!(!RightHandSide::Email("a@b".into()).is_terminal());
        assert!(RightHandSide::Pipe("/bin/true".into()).is_terminal());
        assert!(
            RightHandSide::Forward {
                address: "a@b".into(),
                via: vec!["relay".into()]
            }
            .is_terminal()
        );
    }
}
