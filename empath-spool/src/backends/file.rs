//! File-backed [`BackingStore`]: durable, human-readable message persistence.
//!
//! Each message is written as a single RON record at
//! `<path>/m:<percent-escaped-id>`, using a same-directory temp-file-then-
//! rename so that a reader never observes a partially written record.

use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use empath_common::context::Context;
use serde::{Deserialize, Serialize};

use crate::{SerializationError, SpoolError, ValidationError, r#trait::BackingStore, types::SpooledMessageId};

const RECORD_PREFIX: &str = "m:";
const RECORD_MODE: u32 = 0o660;

#[cfg(unix)]
const SYSTEM_DIRECTORIES: &[&str] = &[
    "/etc", "/bin", "/sbin", "/usr", "/boot", "/sys", "/proc", "/dev",
];

#[cfg(windows)]
const SYSTEM_DIRECTORIES: &[&str] = &[
    "c:\\windows",
    "c:\\program files (x86)",
    "c:\\program files",
    "c:\\programdata",
];

/// Durable, file-backed [`BackingStore`].
///
/// Messages are persisted under a single configured directory; see module
/// docs for the on-disk layout.
#[derive(Debug, Clone, Serialize)]
#[serde(try_from = "RawFileBackingStore")]
pub struct FileBackingStore {
    path: PathBuf,
}

/// Wire shape for deserialization; re-validated through [`validate_path`] so
/// configuration loaded from disk gets the same checks as
/// [`FileBackingStoreBuilder`].
#[derive(Deserialize)]
struct RawFileBackingStore {
    path: PathBuf,
}

impl TryFrom<RawFileBackingStore> for FileBackingStore {
    type Error = ValidationError;

    fn try_from(raw: RawFileBackingStore) -> Result<Self, Self::Error> {
        validate_path(&raw.path)?;
        Ok(Self { path: raw.path })
    }
}

impl Default for FileBackingStore {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/spool/empath/queue"),
        }
    }
}

impl FileBackingStore {
    /// Start building a [`FileBackingStore`].
    #[must_use]
    pub fn builder() -> FileBackingStoreBuilder {
        FileBackingStoreBuilder::default()
    }

    /// The directory this store reads and writes messages in.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the spool directory if it doesn't already exist.
    ///
    /// # Errors
    /// Returns [`SpoolError::Io`] if the directory cannot be created.
    pub fn ensure_dir(&self) -> crate::Result<()> {
        std::fs::create_dir_all(&self.path)?;
        Ok(())
    }

    fn record_path(&self, id: &SpooledMessageId) -> PathBuf {
        self.path
            .join(format!("{RECORD_PREFIX}{}", percent_escape(&id.to_string())))
    }

    async fn persist(&self, id: &SpooledMessageId, context: &Context) -> crate::Result<()> {
        let text = ron::ser::to_string_pretty(context, ron::ser::PrettyConfig::default())
            .map_err(|err| SerializationError::InvalidFormat(err.to_string()))?;
        atomic_write(&self.record_path(id), text.as_bytes(), RECORD_MODE).await?;
        Ok(())
    }
}

/// Builder for [`FileBackingStore`], validating the spool path up front.
#[derive(Debug, Default)]
pub struct FileBackingStoreBuilder {
    path: Option<PathBuf>,
}

impl FileBackingStoreBuilder {
    /// Set the directory messages will be persisted in.
    #[must_use]
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    /// Validate and construct the [`FileBackingStore`].
    ///
    /// # Errors
    /// Returns [`SpoolError::Validation`] if no path was given, the path is
    /// relative, contains a `..` component, or names a well-known system
    /// directory.
    pub fn build(self) -> crate::Result<FileBackingStore> {
        let path = self.path.ok_or_else(|| {
            ValidationError::InvalidConfiguration("no spool path configured".to_string())
        })?;
        validate_path(&path)?;
        Ok(FileBackingStore { path })
    }
}

fn validate_path(path: &Path) -> Result<(), ValidationError> {
    let display = path.display().to_string();

    if path
        .components()
        .any(|c| c == std::path::Component::ParentDir)
    {
        return Err(ValidationError::InvalidConfiguration(format!(
            "spool path cannot contain '..': {display}"
        )));
    }

    if !path.is_absolute() {
        return Err(ValidationError::InvalidConfiguration(format!(
            "spool path must be absolute: {display}"
        )));
    }

    let lower = display.to_ascii_lowercase();
    if SYSTEM_DIRECTORIES
        .iter()
        .any(|dir| lower.starts_with(dir))
    {
        return Err(ValidationError::InvalidConfiguration(format!(
            "spool path must not be inside a system directory: {display}"
        )));
    }

    Ok(())
}

/// Write `bytes` to a same-directory temp file, then rename over `path`.
///
/// If `path` already exists, the new file inherits its owner. The temp file
/// is removed if anything fails before the rename.
async fn atomic_write(path: &Path, bytes: &[u8], mode: u32) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "record path has no parent"))?;
    tokio::fs::create_dir_all(dir).await?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "record path has no name"))?;
    let tmp_path = dir.join(format!(".{file_name}.{}", ulid::Ulid::new()));

    let result = write_and_rename(&tmp_path, path, bytes, mode).await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }

    result
}

async fn write_and_rename(
    tmp_path: &Path,
    final_path: &Path,
    bytes: &[u8],
    mode: u32,
) -> io::Result<()> {
    tokio::fs::write(tmp_path, bytes).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(tmp_path, std::fs::Permissions::from_mode(mode)).await?;

        if let Ok(existing) = tokio::fs::metadata(final_path).await {
            use std::os::unix::fs::MetadataExt;
            let (uid, gid) = (existing.uid(), existing.gid());
            let tmp_owned = tmp_path.to_path_buf();
            tokio::task::spawn_blocking(move || {
                std::os::unix::fs::chown(&tmp_owned, Some(uid), Some(gid))
            })
            .await
            .map_err(io::Error::other)??;
        }
    }

    #[cfg(not(unix))]
    {
        let _ = mode;
    }

    tokio::fs::rename(tmp_path, final_path).await
}

fn percent_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn percent_unescape(escaped: &str) -> Option<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = escaped.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[async_trait]
impl BackingStore for FileBackingStore {
    async fn write(&self, context: &mut Context) -> crate::Result<SpooledMessageId> {
        let id = SpooledMessageId::generate();
        context.tracking_id = Some(id.to_string());
        self.persist(&id, context).await?;
        Ok(id)
    }

    async fn list(&self) -> crate::Result<Vec<SpooledMessageId>> {
        let mut dir = match tokio::fs::read_dir(&self.path).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(escaped) = name.strip_prefix(RECORD_PREFIX) else {
                continue;
            };
            let Some(raw) = percent_unescape(escaped) else {
                continue;
            };
            if let Ok(ulid) = ulid::Ulid::from_string(&raw) {
                ids.push(SpooledMessageId::new(ulid));
            }
        }
        ids.sort();

        Ok(ids)
    }

    async fn read(&self, id: &SpooledMessageId) -> crate::Result<Context> {
        let path = self.record_path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(SpoolError::NotFound(id.clone()));
            }
            Err(err) => return Err(err.into()),
        };

        ron::de::from_bytes(&bytes)
            .map_err(|err| SerializationError::InvalidFormat(err.to_string()).into())
    }

    async fn update(&self, id: &SpooledMessageId, context: &Context) -> crate::Result<()> {
        if tokio::fs::metadata(self.record_path(id)).await.is_err() {
            return Err(SpoolError::NotFound(id.clone()));
        }
        self.persist(id, context).await
    }

    async fn delete(&self, id: &SpooledMessageId) -> crate::Result<()> {
        tokio::fs::remove_file(self.record_path(id))
            .await
            .map_err(|err| {
                if err.kind() == io::ErrorKind::NotFound {
                    SpoolError::NotFound(id.clone())
                } else {
                    err.into()
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ahash::AHashMap;
    use empath_common::envelope::Envelope;
    use tempfile::tempdir;

    use super::*;

    fn test_context(data: &str) -> Context {
        Context {
            envelope: Envelope::default(),
            data: Some(Arc::from(data.as_bytes())),
            id: "test.example.com".to_string(),
            extended: false,
            metadata: AHashMap::new(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn round_trips_a_message() {
        let dir = tempdir().expect("tempdir");
        let store = FileBackingStore::builder()
            .path(dir.path().to_path_buf())
            .build()
            .expect("build");

        let mut ctx = test_context("hello, world");
        let id = store.write(&mut ctx).await.expect("write");

        let ids = store.list().await.expect("list");
        assert_eq!(ids, vec![id.clone()]);

        let read_back = store.read(&id).await.expect("read");
        assert_eq!(read_back.data.as_deref(), ctx.data.as_deref());
        assert_eq!(read_back.tracking_id, Some(id.to_string()));

        store.delete(&id).await.expect("delete");
        assert!(store.list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn read_of_missing_message_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = FileBackingStore::builder()
            .path(dir.path().to_path_buf())
            .build()
            .expect("build");

        let missing = SpooledMessageId::generate();
        let err = store.read(&missing).await.unwrap_err();
        assert!(matches!(err, SpoolError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_of_missing_message_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = FileBackingStore::builder()
            .path(dir.path().to_path_buf())
            .build()
            .expect("build");

        let missing = SpooledMessageId::generate();
        let ctx = test_context("won't be written");
        let err = store.update(&missing, &ctx).await.unwrap_err();
        assert!(matches!(err, SpoolError::NotFound(_)));
    }

    #[tokio::test]
    async fn no_leftover_temp_files_after_write() {
        let dir = tempdir().expect("tempdir");
        let store = FileBackingStore::builder()
            .path(dir.path().to_path_buf())
            .build()
            .expect("build");

        let mut ctx = test_context("payload");
        store.write(&mut ctx).await.expect("write");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty(), "temp file left behind: {leftovers:?}");
    }

    #[test]
    fn rejects_relative_paths() {
        let err = FileBackingStore::builder()
            .path(PathBuf::from("relative/path"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("must be absolute"));
    }
}
