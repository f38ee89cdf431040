//! Types shared between the delivery queue and the rest of the system:
//! the per-message delivery state machine and the attempt history attached
//! to a spooled [`Context`](crate::context::Context).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Where a message sits in the delivery lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Queued, not yet attempted (or ready to be retried immediately).
    Pending,
    /// An SMTP transaction to a mail server is in flight.
    InProgress,
    /// Delivered and removed from the spool.
    Completed,
    /// Waiting out the fixed retry schedule before the next attempt.
    Retry { attempts: u32, last_error: String },
    /// Exhausted retries or hit a permanent SMTP rejection.
    Failed(String),
    /// Exceeded its configured time-to-live before being delivered.
    Expired,
}

/// Returned by [`QueueAdmission::check_admission`] when the delivery queue
/// is at `max_queue_items` and cannot take another message (§4.F, §5, §7).
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("queue full")]
pub struct QueueFull;

/// Seam the SMTP front door uses to ask the delivery queue whether it has
/// room for one more message, without `empath-smtp` depending on
/// `empath-delivery` directly (the dependency already runs the other way).
/// This check is the sole admission control in front of the queue: nothing
/// else caps how many messages it will hold.
pub trait QueueAdmission: Send + Sync {
    /// Returns `Err(QueueFull)` if the queue is already at capacity.
    fn check_admission(&self) -> Result<(), QueueFull>;
}

/// A single delivery attempt against one mail server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Unix timestamp of the attempt.
    pub timestamp: u64,
    /// Error message, if the attempt did not succeed.
    pub error: Option<String>,
    /// The mail server that was contacted.
    pub server: String,
}

/// Snapshot of a message's delivery state, persisted alongside its
/// [`Context`](crate::context::Context) so the queue survives a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryContext {
    pub message_id: String,
    pub domain: Arc<str>,
    pub server: Option<String>,
    pub error: Option<String>,
    pub attempts: Option<u32>,
    pub status: DeliveryStatus,
    pub attempt_history: Vec<DeliveryAttempt>,
    pub queued_at: u64,
    pub next_retry_at: Option<u64>,
    pub current_server_index: usize,
}
