//! Delivery queue management

pub mod cleanup;
pub mod retry;

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;
use empath_common::{DeliveryStatus, QueueAdmission, QueueFull};
use empath_spool::SpooledMessageId;

use crate::{dns::MailServer, types::DeliveryInfo};

/// Default cap on live queue entries (§4.F, §5, §7) — the sole admission
/// control gating how many messages the queue will hold at once.
pub const DEFAULT_MAX_QUEUE_ITEMS: usize = 200;

/// Manages the delivery queue for outbound messages.
///
/// Backed by a lock-free concurrent map so the processor's scan, process, and
/// delivery stages can touch the queue from multiple tasks without a global
/// lock serialising them.
#[derive(Debug, Clone)]
pub struct DeliveryQueue {
    /// Map of message IDs to delivery information
    pub(crate) queue: Arc<DashMap<SpooledMessageId, DeliveryInfo>>,
    /// Maximum number of entries this queue will hold (§4.F, §5, §7).
    max_queue_items: usize,
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryQueue {
    /// Create a new empty delivery queue with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_QUEUE_ITEMS)
    }

    /// Create a new empty delivery queue holding at most `max_queue_items`.
    #[must_use]
    pub fn with_capacity(max_queue_items: usize) -> Self {
        Self {
            queue: Arc::new(DashMap::new()),
            max_queue_items,
        }
    }

    /// Add a message to the delivery queue.
    ///
    /// # Errors
    /// Returns [`QueueFull`] if the queue already holds `max_queue_items`
    /// entries; the caller is responsible for surfacing this as a 451 at the
    /// SMTP enqueue site (§4.G).
    pub fn enqueue(
        &self,
        message_id: SpooledMessageId,
        recipient_domain: String,
    ) -> Result<(), QueueFull> {
        self.check_admission()?;
        self.queue.insert(
            message_id.clone(),
            DeliveryInfo::new(message_id, recipient_domain),
        );
        Ok(())
    }

    /// Insert an already-constructed [`DeliveryInfo`] (e.g. one restored from
    /// persisted delivery state on a spool scan).
    pub fn insert(&self, message_id: SpooledMessageId, info: DeliveryInfo) {
        self.queue.insert(message_id, info);
    }

    /// Get delivery info for a message
    #[must_use]
    pub fn get(&self, message_id: &SpooledMessageId) -> Option<DeliveryInfo> {
        self.queue.get(message_id).map(|entry| entry.value().clone())
    }

    /// Number of messages currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Update the status of a message
    pub fn update_status(&self, message_id: &SpooledMessageId, status: DeliveryStatus) {
        if let Some(mut info) = self.queue.get_mut(message_id) {
            info.status = status;
        }
    }

    /// Record a delivery attempt
    pub fn record_attempt(&self, message_id: &SpooledMessageId, attempt: empath_common::DeliveryAttempt) {
        if let Some(mut info) = self.queue.get_mut(message_id) {
            info.record_attempt(attempt);
        }
    }

    /// Set the resolved mail servers for a message
    pub fn set_mail_servers(&self, message_id: &SpooledMessageId, servers: Arc<Vec<MailServer>>) {
        if let Some(mut info) = self.queue.get_mut(message_id) {
            info.mail_servers = servers;
            info.current_server_index = 0;
        }
    }

    /// Try the next MX server for a message.
    ///
    /// Returns `true` if there is another server to try, `false` if all exhausted.
    pub fn try_next_server(&self, message_id: &SpooledMessageId) -> bool {
        self.queue
            .get_mut(message_id)
            .is_some_and(|mut info| info.try_next_server())
    }

    /// Remove a message from the queue
    pub fn remove(&self, message_id: &SpooledMessageId) -> Option<DeliveryInfo> {
        self.queue.remove(message_id).map(|(_, info)| info)
    }

    /// Set the next retry timestamp for a message
    pub fn set_next_retry_at(&self, message_id: &SpooledMessageId, next_retry_at: SystemTime) {
        let secs = next_retry_at
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        if let Some(mut info) = self.queue.get_mut(message_id) {
            info.next_retry_at = Some(secs);
        }
    }

    /// Reset the server index to 0 for a message (for new retry cycle)
    pub fn reset_server_index(&self, message_id: &SpooledMessageId) {
        if let Some(mut info) = self.queue.get_mut(message_id) {
            info.reset_server_index();
        }
    }

    /// Get all pending messages
    #[must_use]
    pub fn pending_messages(&self) -> Vec<DeliveryInfo> {
        self.queue
            .iter()
            .filter(|entry| entry.value().status == DeliveryStatus::Pending)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Get all messages with their current status
    #[must_use]
    pub fn all_messages(&self) -> Vec<DeliveryInfo> {
        self.queue.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl QueueAdmission for DeliveryQueue {
    fn check_admission(&self) -> Result<(), QueueFull> {
        if self.queue.len() >= self.max_queue_items {
            Err(QueueFull)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_and_fetch_roundtrips() {
        let queue = DeliveryQueue::new();
        let id = SpooledMessageId::generate();
        queue.enqueue(id.clone(), "example.com".into()).unwrap();

        let info = queue.get(&id).expect("message queued");
        assert_eq!(info.status, DeliveryStatus::Pending);
        assert_eq!(&*info.recipient_domain, "example.com");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn update_status_and_remove() {
        let queue = DeliveryQueue::new();
        let id = SpooledMessageId::generate();
        queue.enqueue(id.clone(), "example.com".into()).unwrap();

        queue.update_status(&id, DeliveryStatus::Completed);
        assert_eq!(queue.get(&id).unwrap().status, DeliveryStatus::Completed);

        let removed = queue.remove(&id);
        assert!(removed.is_some());
        assert!(queue.get(&id).is_none());
    }

    #[test]
    fn enqueue_rejects_once_full() {
        let queue = DeliveryQueue::with_capacity(2);
        queue
            .enqueue(SpooledMessageId::generate(), "example.com".into())
            .unwrap();
        queue
            .enqueue(SpooledMessageId::generate(), "example.com".into())
            .unwrap();

        let result = queue.enqueue(SpooledMessageId::generate(), "example.com".into());
        assert!(result.is_err());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn check_admission_reflects_capacity() {
        let queue = DeliveryQueue::with_capacity(1);
        assert!(queue.check_admission().is_ok());
        queue
            .enqueue(SpooledMessageId::generate(), "example.com".into())
            .unwrap();
        assert!(queue.check_admission().is_err());
    }

    #[test]
    fn try_next_server_exhausts_the_list() {
        let queue = DeliveryQueue::new();
        let id = SpooledMessageId::generate();
        queue.enqueue(id.clone(), "example.com".into()).unwrap();
        queue.set_mail_servers(
            &id,
            Arc::new(vec![
                MailServer { host: "a.example.com".into(), priority: 10, port: 25 },
                MailServer { host: "b.example.com".into(), priority: 20, port: 25 },
            ]),
        );

        assert!(queue.try_next_server(&id));
        assert!(!queue.try_next_server(&id));
    }
}
