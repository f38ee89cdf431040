//! Durable, file-backed domain-info store (§4.D).
//!
//! Each domain's record is written as a single RON file at
//! `<path>/s:<domain>`, using the same same-directory temp-file-then-rename
//! discipline as `empath-spool::backends::file` (component A), so a reader
//! never observes a partially written record. `empath-spool::BackingStore`
//! itself isn't reused directly: its `write`/`read` are typed to the SMTP
//! session `Context`, not a generic record, so this store carries its own
//! minimal atomic-write helper grounded on the same pattern.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use empath_common::Domain;

use crate::{
    error::DomainInfoError,
    types::{Direction, DomainRecord, SecurityLevel},
};

const RECORD_PREFIX: &str = "s:";
const RECORD_MODE: u32 = 0o660;

/// Per-domain highest-observed-security-level memory, persisted to disk.
///
/// This is the downgrade shield (§3, §8 "Monotonic security"): a stored
/// level never decreases, and persistence happens *before* a raise is
/// reported as allowed, so a crash between the two can never silently lose
/// a promotion.
#[derive(Debug, Clone)]
pub struct DomainInfoStore {
    path: PathBuf,
    cache: std::sync::Arc<DashMap<String, DomainRecord>>,
}

impl DomainInfoStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cache: std::sync::Arc::new(DashMap::new()),
        }
    }

    /// Load every persisted domain-info record from disk into the cache.
    ///
    /// # Errors
    /// Returns [`DomainInfoError::Read`] if the directory exists but can't
    /// be enumerated.
    pub async fn load(&self) -> Result<(), DomainInfoError> {
        tokio::fs::create_dir_all(&self.path)
            .await
            .map_err(|source| DomainInfoError::Read { domain: self.path.display().to_string(), source })?;

        let mut dir = match tokio::fs::read_dir(&self.path).await {
            Ok(dir) => dir,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(DomainInfoError::Read { domain: self.path.display().to_string(), source });
            }
        };

        while let Ok(Some(entry)) = dir.next_entry().await {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Some(domain) = name.strip_prefix(RECORD_PREFIX) else {
                continue;
            };

            match self.read_record(domain).await {
                Ok(Some(record)) => {
                    self.cache.insert(domain.to_string(), record);
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(domain, error = %err, "skipping corrupt domain-info record"),
            }
        }

        Ok(())
    }

    /// Check and (if needed) raise the recorded `incoming` level for
    /// `domain`. Returns `false` (deny) if `level` is below the recorded
    /// level.
    ///
    /// # Errors
    /// Returns [`DomainInfoError::Write`] if a raise can't be persisted.
    pub async fn incoming_sec_level(&self, domain: &Domain, level: SecurityLevel) -> Result<bool, DomainInfoError> {
        self.check(domain, Direction::Incoming, level).await
    }

    /// Symmetric to [`Self::incoming_sec_level`] for the outbound direction.
    ///
    /// # Errors
    /// Returns [`DomainInfoError::Write`] if a raise can't be persisted.
    pub async fn outgoing_sec_level(&self, domain: &Domain, level: SecurityLevel) -> Result<bool, DomainInfoError> {
        self.check(domain, Direction::Outgoing, level).await
    }

    async fn check(&self, domain: &Domain, direction: Direction, level: SecurityLevel) -> Result<bool, DomainInfoError> {
        let key = domain.as_str().to_ascii_lowercase();
        let recorded = self.cache.get(&key).map(|r| r.level(direction)).unwrap_or_default();

        if level < recorded {
            return Ok(false);
        }

        if level > recorded {
            let mut record = self.cache.get(&key).map(|r| *r).unwrap_or_default();
            record.set_level(direction, level);

            // Persist before the raise is visible to other readers, so a
            // crash here can't leave an allow decision unbacked on disk.
            self.persist(&key, &record).await?;
            self.cache.insert(key, record);
        }

        Ok(true)
    }

    async fn read_record(&self, domain: &str) -> Result<Option<DomainRecord>, DomainInfoError> {
        let path = self.record_path(domain);

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(DomainInfoError::Read { domain: domain.to_string(), source }),
        };

        ron::from_str(&text)
            .map(Some)
            .map_err(|err| DomainInfoError::Corrupt { domain: domain.to_string(), reason: err.to_string() })
    }

    async fn persist(&self, domain: &str, record: &DomainRecord) -> Result<(), DomainInfoError> {
        let text = ron::ser::to_string_pretty(record, ron::ser::PrettyConfig::default())
            .map_err(|err| DomainInfoError::Corrupt { domain: domain.to_string(), reason: err.to_string() })?;

        atomic_write(&self.record_path(domain), text.as_bytes(), RECORD_MODE)
            .await
            .map_err(|source| DomainInfoError::Write { domain: domain.to_string(), source })
    }

    fn record_path(&self, domain: &str) -> PathBuf {
        self.path.join(format!("{RECORD_PREFIX}{}", percent_escape(domain)))
    }
}

fn percent_escape(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c.to_string()
            } else {
                format!("%{:02X}", c as u32)
            }
        })
        .collect()
}

async fn atomic_write(path: &Path, bytes: &[u8], mode: u32) -> std::io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "record path has no parent"))?;
    tokio::fs::create_dir_all(dir).await?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "record path has no name"))?;
    let tmp_path = dir.join(format!(".{file_name}.{}", ulid::Ulid::new()));

    let result = write_and_rename(&tmp_path, path, bytes, mode).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }
    result
}

async fn write_and_rename(tmp_path: &Path, final_path: &Path, bytes: &[u8], mode: u32) -> std::io::Result<()> {
    tokio::fs::write(tmp_path, bytes).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(tmp_path, std::fs::Permissions::from_mode(mode)).await?;

        if let Ok(existing) = tokio::fs::metadata(final_path).await {
            use std::os::unix::fs::MetadataExt;
            let (uid, gid) = (existing.uid(), existing.gid());
            let tmp_owned = tmp_path.to_path_buf();
            tokio::task::spawn_blocking(move || std::os::unix::fs::chown(&tmp_owned, Some(uid), Some(gid)))
                .await
                .map_err(std::io::Error::other)??;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
    }

    tokio::fs::rename(tmp_path, final_path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn raise_then_deny_downgrade() {
        let dir = tempfile::tempdir().unwrap();
        let store = DomainInfoStore::new(dir.path().to_path_buf());
        let domain = Domain::new("example.com");

        assert!(store.incoming_sec_level(&domain, SecurityLevel::TlsSecure).await.unwrap());
        assert!(!store.incoming_sec_level(&domain, SecurityLevel::TlsInsecure).await.unwrap());
        assert!(store.incoming_sec_level(&domain, SecurityLevel::TlsSecure).await.unwrap());
    }

    #[tokio::test]
    async fn incoming_and_outgoing_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = DomainInfoStore::new(dir.path().to_path_buf());
        let domain = Domain::new("example.com");

        assert!(store.incoming_sec_level(&domain, SecurityLevel::TlsSecure).await.unwrap());
        // Outgoing still defaults to Plain and accepts Plain.
        assert!(store.outgoing_sec_level(&domain, SecurityLevel::Plain).await.unwrap());
        assert!(!store.incoming_sec_level(&domain, SecurityLevel::Plain).await.unwrap());
    }

    #[tokio::test]
    async fn raise_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let domain = Domain::new("example.com");

        {
            let store = DomainInfoStore::new(dir.path().to_path_buf());
            assert!(store.incoming_sec_level(&domain, SecurityLevel::TlsClient).await.unwrap());
        }

        let store = DomainInfoStore::new(dir.path().to_path_buf());
        store.load().await.unwrap();
        assert!(!store.incoming_sec_level(&domain, SecurityLevel::Plain).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_domain_defaults_to_plain() {
        let dir = tempfile::tempdir().unwrap();
        let store = DomainInfoStore::new(dir.path().to_path_buf());
        let domain = Domain::new("unseen.example");

        assert!(store.incoming_sec_level(&domain, SecurityLevel::Plain).await.unwrap());
    }
}
