//! Per-connection/per-message business context.
//!
//! `Context` carries everything the SMTP session and the delivery pipeline
//! need to agree on for a single message: the envelope, the raw data once
//! read, identifying metadata, and a free-form bag used by extensions (the
//! post-DATA hook, audit logging, control-plane introspection).

use std::{borrow::Cow, sync::Arc};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::{delivery::DeliveryContext, envelope::Envelope, status::Status};

/// Business context for a single message moving through the system.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Context {
    /// Opaque identifier for this message (assigned on spool, see `empath-spool`).
    pub id: String,
    /// The `MAIL FROM`/`RCPT TO` envelope.
    pub envelope: Envelope,
    /// The raw RFC 5322 payload, once fully read.
    pub data: Option<Arc<[u8]>>,
    /// Whether the originating session negotiated EHLO (extended SMTP).
    pub extended: bool,
    /// Free-form metadata set by extensions (post-DATA hook output,
    /// authenticated identity, trace annotations, …).
    pub metadata: AHashMap<String, String>,
    /// Correlation id used to stitch a trace together across components.
    pub tracking_id: Option<String>,
    /// Delivery queue state, set once this message has been handed to
    /// `empath-delivery` and persisted back on every status change.
    pub delivery: Option<DeliveryContext>,
    /// The server's greeting banner/hostname, used by validators to build
    /// the EHLO/HELO/connect responses.
    #[serde(skip)]
    pub banner: Arc<str>,
    /// Maximum accepted message size in bytes, mirrored from the SIZE
    /// extension's configured limit. Zero means unlimited.
    #[serde(default)]
    pub max_message_size: usize,
    /// The response a validator/handler staged for the session to send,
    /// cleared once rendered. Transient dialog state, not persisted.
    #[serde(skip)]
    pub response: Option<(Status, Cow<'static, str>)>,
    /// Extensions the session advertises in its EHLO reply, rendered from
    /// the listener's configured `Extension`s. Empty on a plain HELO session.
    #[serde(skip)]
    pub capabilities: Vec<Capability>,
}

/// A single EHLO capability keyword line (e.g. `STARTTLS`, `SIZE 1000000`),
/// already rendered to the text the client expects after the `250-`/`250 `
/// prefix.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Capability(pub String);

impl std::fmt::Display for Capability {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.write_str(&self.0)
    }
}

impl From<String> for Capability {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Context {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn message(&self) -> String {
        self.data.as_deref().map_or_else(String::new, |data| {
            std::str::from_utf8(data).map_or_else(|_| format!("{data:#?}"), str::to_string)
        })
    }

    #[must_use]
    pub fn sender(&self) -> String {
        self.envelope
            .sender()
            .map(std::string::ToString::to_string)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn recipients(&self) -> Vec<String> {
        self.envelope
            .recipients()
            .map(|addrs| addrs.iter().map(std::string::ToString::to_string).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.metadata.contains_key(key)
    }
}
