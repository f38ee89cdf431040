//! Deserializable configuration for building a [`DomainInfoStore`] from a
//! controller config file.

use std::path::PathBuf;

use serde::Deserialize;

use crate::{error::DomainInfoError, store::DomainInfoStore};

#[derive(Debug, Clone, Deserialize)]
pub struct DomainInfoConfig {
    #[serde(default = "default_path")]
    pub path: PathBuf,
}

impl Default for DomainInfoConfig {
    fn default() -> Self {
        Self { path: default_path() }
    }
}

fn default_path() -> PathBuf {
    PathBuf::from("/var/lib/empath/domaininfo")
}

impl DomainInfoConfig {
    /// Build a [`DomainInfoStore`] and load its persisted records from disk.
    ///
    /// # Errors
    /// Returns [`DomainInfoError::Read`] if the store directory exists but
    /// its records can't be enumerated.
    pub async fn build(&self) -> Result<DomainInfoStore, DomainInfoError> {
        let store = DomainInfoStore::new(self.path.clone());
        store.load().await?;
        Ok(store)
    }
}
