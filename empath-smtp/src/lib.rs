#![feature(bstr, result_option_map_or_default)]

pub mod auth;
pub mod client;
pub mod command;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod fsm;
pub mod hook;
pub mod session;
pub mod session_state;
pub mod state;
pub mod transaction_handler;

// Re-export commonly used types
use std::{borrow::Cow, collections::HashMap, net::SocketAddr, sync::Arc};

pub use command::MailParameters;
use empath_common::{
    Signal,
    error::{ProtocolError, SessionError},
    traits::protocol::{Protocol, SessionHandler},
};
use empath_tracing::traced;
use serde::Deserialize;
// Re-export the type-safe state machine from the state module
pub use state::State;
use tokio::net::TcpStream;

use crate::{
    extensions::Extension,
    hook::PostDataHook,
    session::{Session, SessionConfig},
};

const MAX_MESSAGE_SIZE: usize = 100;

/// SMTP server-side timeout configuration
///
/// These timeouts prevent resource exhaustion from slow or malicious clients
/// and follow RFC 5321 Section 4.5.3.2 recommendations.
#[derive(Clone, Debug, Deserialize)]
pub struct SmtpServerTimeouts {
    /// Timeout for regular SMTP commands (EHLO, MAIL FROM, RCPT TO, etc.)
    ///
    /// RFC 5321 recommends: 5 minutes
    /// Default: 300 seconds (5 minutes)
    #[serde(default = "default_command_timeout")]
    pub command_secs: u64,

    /// Timeout for DATA command response
    ///
    /// RFC 5321 recommends: 2 minutes
    /// Default: 120 seconds (2 minutes)
    #[serde(default = "default_data_init_timeout")]
    pub data_init_secs: u64,

    /// Timeout between data chunks while receiving message body
    ///
    /// RFC 5321 recommends: 3 minutes
    /// Default: 180 seconds (3 minutes)
    #[serde(default = "default_data_block_timeout")]
    pub data_block_secs: u64,

    /// Timeout for processing after final dot terminator
    ///
    /// RFC 5321 recommends: 10 minutes
    /// Default: 600 seconds (10 minutes)
    #[serde(default = "default_data_termination_timeout")]
    pub data_termination_secs: u64,

    /// Maximum total session duration
    ///
    /// Prevents sessions from living indefinitely.
    /// Default: 1800 seconds (30 minutes)
    #[serde(default = "default_connection_timeout")]
    pub connection_secs: u64,
}

impl Default for SmtpServerTimeouts {
    fn default() -> Self {
        Self {
            command_secs: default_command_timeout(),
            data_init_secs: default_data_init_timeout(),
            data_block_secs: default_data_block_timeout(),
            data_termination_secs: default_data_termination_timeout(),
            connection_secs: default_connection_timeout(),
        }
    }
}

const fn default_command_timeout() -> u64 {
    300 // 5 minutes per RFC 5321
}

const fn default_data_init_timeout() -> u64 {
    120 // 2 minutes per RFC 5321
}

const fn default_data_block_timeout() -> u64 {
    180 // 3 minutes per RFC 5321
}

const fn default_data_termination_timeout() -> u64 {
    600 // 10 minutes per RFC 5321
}

const fn default_connection_timeout() -> u64 {
    1800 // 30 minutes
}

#[derive(Default, Deserialize)]
pub struct Smtp;

#[derive(Clone, Default, Deserialize)]
pub struct SmtpArgs {
    #[serde(default)]
    extensions: Vec<Extension>,
    #[serde(skip)]
    spool: Option<Arc<dyn empath_spool::BackingStore>>,
    #[serde(default)]
    pub timeouts: SmtpServerTimeouts,
    #[serde(skip)]
    alias: Option<Arc<empath_alias::AliasResolver>>,
    #[serde(skip)]
    domain_info: Option<Arc<empath_domaininfo::DomainInfoStore>>,
    #[serde(skip)]
    authenticator: Option<Arc<dyn auth::Authenticator>>,
    /// Seam onto the delivery queue's admission control, consulted before a
    /// message is spooled so a full queue is rejected with 451 rather than
    /// growing the spool unbounded (§4.F, §5, §7).
    #[serde(skip)]
    queue: Option<Arc<dyn empath_common::QueueAdmission>>,
    /// Whether this listener is submission-only: `MAIL FROM` requires a
    /// prior successful AUTH (§4.G, §6). Set `true` for a port 587-style
    /// listener, `false` for a relay-facing port 25 listener.
    #[serde(default)]
    submission_mode: bool,
    #[serde(skip)]
    post_data_hook: Option<Arc<PostDataHook>>,
}

impl core::fmt::Debug for SmtpArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpArgs")
            .field("extensions", &self.extensions)
            .field("spool", &self.spool.is_some())
            .field("timeouts", &self.timeouts)
            .field("alias", &self.alias)
            .field("domain_info", &self.domain_info)
            .field("authenticator", &self.authenticator.is_some())
            .field("queue", &self.queue.is_some())
            .field("submission_mode", &self.submission_mode)
            .field("post_data_hook", &self.post_data_hook.is_some())
            .finish()
    }
}

impl SmtpArgs {
    /// Create a new `SmtpArgs` builder
    #[must_use]
    pub fn builder() -> Self {
        Self::default()
    }

    /// Set the SMTP extensions supported by this server
    #[must_use]
    pub fn with_extensions(mut self, extensions: Vec<Extension>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Set the spool controller for this SMTP server
    #[must_use]
    pub fn with_spool(mut self, spool: Arc<dyn empath_spool::BackingStore>) -> Self {
        self.spool = Some(spool);
        self
    }

    /// Set the timeout configuration for this SMTP server
    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: SmtpServerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set the alias resolver used to validate local recipients
    #[must_use]
    pub fn with_alias(mut self, alias: Arc<empath_alias::AliasResolver>) -> Self {
        self.alias = Some(alias);
        self
    }

    /// Set the domain security-posture store used for downgrade checks
    #[must_use]
    pub fn with_domain_info(mut self, domain_info: Arc<empath_domaininfo::DomainInfoStore>) -> Self {
        self.domain_info = Some(domain_info);
        self
    }

    /// Set the password database seam used to verify AUTH PLAIN/LOGIN
    /// credentials (§4.G, §6)
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn auth::Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Set the delivery queue admission-control seam consulted before
    /// spooling a message (§4.F, §5, §7)
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn empath_common::QueueAdmission>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Marks this listener as submission-only (§4.G, §6). Use for a port
    /// 587-style listener; leave unset for a relay-facing port 25 listener.
    #[must_use]
    pub const fn with_submission_mode(mut self, submission_mode: bool) -> Self {
        self.submission_mode = submission_mode;
        self
    }

    /// Sets the optional post-DATA filtering hook (§4.G, §6).
    #[must_use]
    pub fn with_post_data_hook(mut self, post_data_hook: Arc<PostDataHook>) -> Self {
        self.post_data_hook = Some(post_data_hook);
        self
    }
}

impl Protocol for Smtp {
    type Session = Session<TcpStream>;
    type Args = SmtpArgs;

    fn ty() -> &'static str {
        "SMTP"
    }

    #[traced(instrument(level = tracing::Level::TRACE, skip(self, stream, init_context, args)), timing(precision = "ms"))]
    fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        init_context: HashMap<String, String>,
        args: Self::Args,
    ) -> Self::Session {
        Session::create(
            stream,
            peer,
            SessionConfig::builder()
                .with_extensions(args.extensions)
                .with_spool(args.spool)
                .with_timeouts(args.timeouts)
                .with_alias(args.alias)
                .with_domain_info(args.domain_info)
                .with_authenticator(args.authenticator)
                .with_queue(args.queue)
                .with_submission_mode(args.submission_mode)
                .with_post_data_hook(args.post_data_hook)
                .with_init_context(
                    init_context
                        .into_iter()
                        .map(|(k, v)| (Cow::Owned(k), v))
                        .collect(),
                )
                .build(),
        )
    }

    #[traced(instrument(skip(self, args)), timing(precision = "ns"))]
    fn validate(&mut self, args: &mut Self::Args) -> Result<(), ProtocolError> {
        if let Some(Extension::Starttls(tls)) = args
            .extensions
            .iter()
            .find(|arg| matches!(arg, Extension::Starttls(_)))
        {
            if !tls.certificate.try_exists()? {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!(
                        "Unable to find TLS Certificate {}",
                        tls.certificate.display()
                    ),
                )
                .into());
            }

            if !tls.key.try_exists()? {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("Unable to find TLS Key {}", tls.key.display()),
                )
                .into());
            }
        }

        if !args
            .extensions
            .iter()
            .any(|ext| matches!(ext, Extension::Size(_)))
        {
            args.extensions.push(Extension::Size(MAX_MESSAGE_SIZE));
        }

        if args.authenticator.is_some()
            && !args.extensions.iter().any(|ext| matches!(ext, Extension::Auth))
        {
            args.extensions.push(Extension::Auth);
        }

        Ok(())
    }
}

impl SessionHandler for Session<TcpStream> {
    async fn run(
        self,
        signal: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        Self::run(self, signal).await
    }
}
