//! Deserializable configuration for building an [`AliasResolver`] from a
//! controller config file, mirroring how `empath-spool::Controller` builds
//! its backing store from configuration.

use std::path::PathBuf;

use serde::Deserialize;

use crate::{error::AliasError, resolver::{AliasResolver, AliasResolverConfig, NoUsers}};

/// One domain's alias file, as configured.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainAliasFile {
    pub domain: String,
    pub path: PathBuf,
}

/// Top-level alias configuration: the resolver tunables plus the set of
/// per-domain alias files to load at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AliasConfig {
    #[serde(default)]
    pub resolver: AliasResolverConfig,
    #[serde(alias = "domain", default)]
    pub domains: Vec<DomainAliasFile>,
}

impl AliasConfig {
    /// Build an [`AliasResolver`] and load every configured domain's alias
    /// file into it.
    ///
    /// # Errors
    /// Returns the first [`AliasError`] encountered loading a domain's file.
    pub async fn build(&self) -> Result<AliasResolver, AliasError> {
        let resolver = AliasResolver::new(self.resolver.clone(), NoUsers);

        for entry in &self.domains {
            resolver.add_aliases_file(&entry.domain, &entry.path).await?;
        }

        Ok(resolver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_a_resolver_from_configured_domains() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aliases");
        tokio::fs::write(&path, "to: testuser\n").await.unwrap();

        let config = AliasConfig {
            resolver: AliasResolverConfig::default(),
            domains: vec![DomainAliasFile {
                domain: "localhost".to_string(),
                path,
            }],
        };

        let resolver = config.build().await.unwrap();
        assert!(resolver.exists("to@localhost"));
    }
}
