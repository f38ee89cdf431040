//! Lifecycle wrapper around a [`BackingStore`]: directory setup for
//! file-backed stores, and a `serve` loop that runs until shutdown.

use empath_common::{Signal, internal};
use empath_tracing::traced;
use tokio::sync::broadcast::Receiver;

use crate::{
    backends::{FileBackingStore, MemoryBackingStore, TestBackingStore},
    r#trait::BackingStore,
};

/// Owns a concrete [`BackingStore`] implementation for the lifetime of the
/// process. File-backed stores additionally get `init`/`serve` to create
/// their directory up front and watch for shutdown.
#[derive(Debug, Clone)]
pub struct Spool<S: BackingStore> {
    store: S,
}

impl<S: BackingStore> Spool<S> {
    /// Wrap an already-constructed backing store.
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    /// Borrow the underlying store.
    pub const fn store(&self) -> &S {
        &self.store
    }
}

impl Spool<FileBackingStore> {
    /// Create the spool directory if it doesn't exist yet.
    ///
    /// # Errors
    /// Returns [`SpoolError::Io`](crate::SpoolError::Io) if the directory
    /// cannot be created.
    pub fn init(&mut self) -> crate::Result<()> {
        self.store.ensure_dir()
    }

    /// Run until a shutdown signal arrives.
    ///
    /// A file-backed spool has no background work of its own today (the
    /// delivery queue does its own periodic scanning), so this just parks on
    /// the shutdown channel, logging reloads rather than acting on them.
    ///
    /// # Errors
    /// Returns [`SpoolError::Internal`](crate::SpoolError::Internal) if the
    /// shutdown channel is closed unexpectedly.
    #[traced(instrument(level = tracing::Level::TRACE, skip(self, shutdown)), timing(precision = "s"))]
    pub async fn serve(&self, mut shutdown: Receiver<Signal>) -> crate::Result<()> {
        internal!("File spool serving from {}", self.store.path().display());

        loop {
            match shutdown.recv().await {
                Ok(Signal::Shutdown | Signal::Finalised) => break,
                Ok(Signal::Reload) => {
                    internal!("File spool ignoring reload signal (nothing to reload)");
                }
                Err(err) => {
                    return Err(crate::SpoolError::Internal(format!(
                        "spool shutdown channel closed: {err}"
                    )));
                }
            }
        }

        Ok(())
    }
}

/// A [`Spool`] backed by durable, file-based storage.
pub type FileSpool = Spool<FileBackingStore>;

/// A [`Spool`] backed by transient, in-memory storage.
pub type MemorySpool = Spool<MemoryBackingStore>;

/// A [`Spool`] backed by the test double that exposes wait helpers.
pub type TestSpool = Spool<TestBackingStore>;
