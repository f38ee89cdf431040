//! The storage abstraction every spool backend implements.

use async_trait::async_trait;
use empath_common::context::Context;

use crate::types::SpooledMessageId;

/// A place messages can be durably written, listed, read back, updated in
/// place, and removed.
///
/// Implementors are expected to assign the [`SpooledMessageId`] themselves on
/// `write` (stamping it into `context.tracking_id`) rather than accept one
/// from the caller, so that the ID generation strategy (currently ULID) stays
/// an implementation detail of the backend.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Persist `context`, assigning it a fresh [`SpooledMessageId`].
    ///
    /// # Errors
    /// Returns [`SpoolError`](crate::error::SpoolError) if the write fails,
    /// or if the backend is at capacity.
    async fn write(&self, context: &mut Context) -> crate::Result<SpooledMessageId>;

    /// List every message currently held, oldest first.
    ///
    /// # Errors
    /// Returns [`SpoolError`](crate::error::SpoolError) if the backend
    /// cannot be enumerated.
    async fn list(&self) -> crate::Result<Vec<SpooledMessageId>>;

    /// Read a previously written message back.
    ///
    /// # Errors
    /// Returns [`SpoolError::NotFound`](crate::error::SpoolError::NotFound)
    /// if no message with this ID exists.
    async fn read(&self, id: &SpooledMessageId) -> crate::Result<Context>;

    /// Overwrite an existing message in place (e.g. to record a delivery
    /// attempt or updated metadata).
    ///
    /// # Errors
    /// Returns [`SpoolError::NotFound`](crate::error::SpoolError::NotFound)
    /// if no message with this ID exists.
    async fn update(&self, id: &SpooledMessageId, context: &Context) -> crate::Result<()>;

    /// Remove a message from the store.
    ///
    /// # Errors
    /// Returns [`SpoolError::NotFound`](crate::error::SpoolError::NotFound)
    /// if no message with this ID exists.
    async fn delete(&self, id: &SpooledMessageId) -> crate::Result<()>;
}
