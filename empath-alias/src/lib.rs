//! Alias file parsing and recipient resolution (§4.C).
//!
//! Mirrors `empath-spool`'s crate layout: a small re-exported surface, a
//! `thiserror` error enum, and the parsed entry shapes kept separate from
//! the concurrent resolver that owns them.

pub mod config;
pub mod error;
mod parser;
pub mod resolver;
pub mod types;

pub use config::{AliasConfig, DomainAliasFile};
pub use error::AliasError;
pub use resolver::{AliasResolver, AliasResolverConfig, NoUsers, UserExists};
pub use types::{ResolvedRecipient, RightHandSide};
