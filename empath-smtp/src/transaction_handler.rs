//! Business logic handler for SMTP sessions.
//!
//! This module provides the `BusinessHandler` trait that separates business
//! logic (validation, spooling, module dispatch) from protocol state management
//! (FSM) and I/O orchestration.

use std::{borrow::Cow, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use empath_alias::AliasResolver;
use empath_common::{Domain, QueueAdmission, context::Context, status::Status, tracing};
use empath_domaininfo::{DomainInfoStore, SecurityLevel};
use empath_ffi::modules;
use empath_spool::BackingStore;

use crate::{
    State,
    auth::{AuthOutcome, Authenticator},
    hook::{HookOutcome, PostDataHook},
};

/// Maximum number of `Received:` headers a message may already carry before
/// it's treated as a mail loop (§4.G, §8).
const MAX_RECEIVED_HEADERS: usize = 50;

/// SMTP transaction handler for business logic.
///
/// This trait separates business concerns (validation, spooling, auditing)
/// from protocol concerns (state transitions) and I/O concerns (send/receive).
///
/// # Design Rationale
///
/// By separating business logic into a trait, we achieve:
/// - **Testability**: Business logic can be tested without I/O or networking
/// - **Flexibility**: Different implementations for production vs testing
/// - **Single Responsibility**: Each layer has a clear, focused purpose
/// - **Dependency Injection**: Easily swap implementations
///
/// # Responsibilities
///
/// The transaction handler is responsible for:
/// - Module-based validation dispatch
/// - Message spooling
/// - Response generation (success/failure messages)
/// - Audit logging
/// - Event notification
///
/// # Lifecycle
///
/// The handler is called after FSM state transitions:
/// 1. FSM transitions to new state (pure protocol logic)
/// 2. `SmtpTransactionHandler` validates the transition (business rules)
/// 3. `SmtpTransactionHandler` performs work (spooling, auditing, etc.)
/// 4. `Response` is generated and sent to client
#[async_trait]
pub trait SmtpTransactionHandler: Send + Sync {
    /// Validate a Connect event (new connection established)
    ///
    /// Called when a new client connects, before sending the greeting.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Business context for validation and response
    ///
    /// # Returns
    ///
    /// `true` if the connection should be accepted, `false` to reject
    async fn validate_connect(&mut self, ctx: &mut Context) -> bool;

    /// Validate an EHLO/HELO command
    ///
    /// Called after the client sends EHLO or HELO.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Business context for validation and response
    ///
    /// # Returns
    ///
    /// `true` if the EHLO/HELO should be accepted, `false` to reject
    async fn validate_ehlo(&mut self, ctx: &mut Context) -> bool;

    /// Validate a MAIL FROM command
    ///
    /// Called after the client sends MAIL FROM.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Business context for validation and response
    ///
    /// # Returns
    ///
    /// `true` if the MAIL FROM should be accepted, `false` to reject
    async fn validate_mail_from(&mut self, ctx: &mut Context) -> bool;

    /// Validate an RCPT TO command
    ///
    /// Called after the client sends RCPT TO.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Business context for validation and response
    ///
    /// # Returns
    ///
    /// `true` if the RCPT TO should be accepted, `false` to reject
    async fn validate_rcpt_to(&mut self, ctx: &mut Context) -> bool;

    /// Validate and process a complete message (after DATA)
    ///
    /// Called after the client sends the complete message (after ".").
    /// This method both validates the message and performs the spooling
    /// work if validation passes.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Business context for validation, spooling, and response
    ///
    /// # Returns
    ///
    /// `true` if the message was accepted and spooled, `false` if rejected
    async fn handle_message(&mut self, ctx: &mut Context) -> bool;

    /// Verify the credentials collected during an `AUTH PLAIN`/`AUTH LOGIN`
    /// dialog (§4.G).
    ///
    /// Called once the FSM has a complete `(user, domain, password)` triple
    /// staged in `ctx`'s metadata. Sets `auth_as` and a `235`/`535`/`454`
    /// response, and always clears the transient credential keys, whether
    /// or not authentication succeeded.
    ///
    /// # Returns
    ///
    /// `true` if the credentials were accepted, `false` otherwise
    async fn validate_auth(&mut self, ctx: &mut Context) -> bool;
}

/// Default SMTP transaction handler that uses the module system for validation.
///
/// This implementation delegates all validation to the FFI module system,
/// which allows external plugins to implement business rules.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use empath_smtp::transaction_handler::DefaultSmtpTransactionHandler;
/// use empath_spool::BackingStore;
///
/// # fn example(spool: Arc<dyn BackingStore>, peer: std::net::SocketAddr) {
/// let handler = DefaultSmtpTransactionHandler::new(Some(spool), peer, None, None, None);
/// // Use handler with session orchestrator
/// # }
/// ```
pub struct DefaultSmtpTransactionHandler {
    /// Optional spool for message persistence
    spool: Option<Arc<dyn BackingStore>>,
    /// Client peer address for audit logging
    peer: SocketAddr,
    /// Local-delivery alias map, used to reject RCPT TO for unknown local
    /// users the way chasquid does (§4.C, §4.G).
    alias: Option<Arc<AliasResolver>>,
    /// Per-domain security-posture store, used to refuse an incoming
    /// downgrade relative to what this peer has previously shown us (§4.D).
    domain_info: Option<Arc<DomainInfoStore>>,
    /// Password database seam for `AUTH PLAIN`/`AUTH LOGIN` (§4.G, §6). When
    /// absent, AUTH is effectively disabled: every attempt is reported as
    /// invalid credentials.
    authenticator: Option<Arc<dyn Authenticator>>,
    /// Delivery queue admission control (§4.F, §5, §7). Consulted right
    /// before a message is spooled; when absent, the queue is assumed
    /// unbounded and every message is accepted.
    queue: Option<Arc<dyn empath_common::QueueAdmission>>,
    /// This server's own identity, used in the `Received:` header and the
    /// `by` clause of its EHLO/HELO greeting context (§4.G).
    hostname: String,
    /// Whether this listener is a submission port: `MAIL FROM` requires a
    /// prior successful AUTH (§4.G, §8 scenario 2).
    submission_mode: bool,
    /// Optional post-DATA filtering hook (§4.G, §6).
    post_data_hook: Option<Arc<PostDataHook>>,
}

impl DefaultSmtpTransactionHandler {
    /// Creates a new default SMTP transaction handler.
    ///
    /// # Arguments
    ///
    /// * `spool` - Optional message spool for persistence
    /// * `peer` - Client peer address for audit logging
    /// * `alias` - Optional alias resolver for local-recipient checks
    /// * `domain_info` - Optional security-posture store for downgrade checks
    /// * `authenticator` - Optional password database seam for AUTH
    #[must_use]
    pub const fn new(
        spool: Option<Arc<dyn BackingStore>>,
        peer: SocketAddr,
        alias: Option<Arc<AliasResolver>>,
        domain_info: Option<Arc<DomainInfoStore>>,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Self {
        Self {
            spool,
            peer,
            alias,
            domain_info,
            authenticator,
            queue: None,
            hostname: String::new(),
            submission_mode: false,
            post_data_hook: None,
        }
    }

    /// Sets the hostname advertised in the `Received:` header (§4.G). Falls
    /// back to `"localhost"` at header-construction time if never set.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Marks this handler as serving a submission-only listener, requiring
    /// authentication before `MAIL FROM` is accepted (§4.G, §6).
    #[must_use]
    pub const fn with_submission_mode(mut self, submission_mode: bool) -> Self {
        self.submission_mode = submission_mode;
        self
    }

    /// Sets the optional post-DATA filtering hook (§4.G, §6).
    #[must_use]
    pub fn with_post_data_hook(mut self, hook: Option<Arc<PostDataHook>>) -> Self {
        self.post_data_hook = hook;
        self
    }

    /// Sets the delivery queue admission-control seam (§4.F, §5, §7).
    #[must_use]
    pub fn with_queue(mut self, queue: Option<Arc<dyn empath_common::QueueAdmission>>) -> Self {
        self.queue = queue;
        self
    }

    /// The security level this connection has shown so far, derived from
    /// the `tls` metadata flag set when STARTTLS completes (§3).
    ///
    /// This session never validates the peer's client certificate, so a
    /// negotiated TLS connection is reported as `TlsInsecure` rather than
    /// `TlsClient`/`TlsSecure` — those levels are reserved for the outbound
    /// courier, which does perform certificate validation.
    fn current_level(ctx: &Context) -> SecurityLevel {
        if ctx.get("tls") == Some("true") {
            SecurityLevel::TlsInsecure
        } else {
            SecurityLevel::Plain
        }
    }

    /// Counts `Received:` header lines at the start of `data`, stopping at
    /// the first blank line (end of headers). Folded continuation lines
    /// never start with `Received:`, so this is a single linear scan rather
    /// than a full header parse (§4.G, §8).
    fn count_received_headers(data: &[u8]) -> usize {
        let mut count = 0;

        for line in data.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);

            if line.is_empty() {
                break;
            }

            if line.len() >= 9 && line[..9].eq_ignore_ascii_case(b"Received:") {
                count += 1;
            }
        }

        count
    }

    /// Builds the `Received:` trace header this server prepends to every
    /// accepted message (§4.G). Authenticated clients have their peer
    /// address hidden; everything else shows the literal peer IP.
    fn build_received_header(&self, ctx: &Context) -> String {
        let ehlo_domain = if ctx.id().is_empty() {
            Cow::Borrowed("unknown")
        } else {
            Cow::Borrowed(ctx.id())
        };

        let from_clause = ctx.get("auth_as").map_or_else(
            || format!("from {ehlo_domain} ([{}])", self.peer.ip()),
            |auth_as| format!("from {ehlo_domain} (authenticated as {auth_as})"),
        );

        let with_clause = if ctx.get("tls") == Some("true") {
            "ESMTPSA"
        } else if ctx.extended {
            "ESMTP"
        } else {
            "SMTP"
        };

        let hostname = if self.hostname.is_empty() {
            "localhost"
        } else {
            self.hostname.as_str()
        };

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::hash::Hash::hash(ctx.data.as_deref().unwrap_or(&[]), &mut hasher);
        std::hash::Hash::hash(&self.peer.to_string(), &mut hasher);
        let id = std::hash::Hasher::finish(&hasher);

        format!(
            "Received: {from_clause}\r\n\tby {hostname} with {with_clause} id {id:016x};\r\n\t{}\r\n",
            chrono::Utc::now().to_rfc2822()
        )
    }

    /// Assembles the environment the post-DATA hook is invoked with (§4.G).
    fn hook_env(&self, ctx: &Context) -> Vec<(&'static str, String)> {
        vec![
            ("REMOTE_ADDR", self.peer.ip().to_string()),
            ("EHLO_DOMAIN", ctx.id().to_string()),
            ("EHLO_DOMAIN_RAW", ctx.id().to_string()),
            ("MAIL_FROM", ctx.sender()),
            ("RCPT_TO", ctx.recipients().join(",")),
            ("AUTH_AS", ctx.get("auth_as").unwrap_or_default().to_string()),
            (
                "ON_TLS",
                if ctx.get("tls") == Some("true") { "1" } else { "0" }.to_string(),
            ),
            (
                "FROM_LOCAL_DOMAIN",
                if self.alias.as_ref().is_some_and(|alias| {
                    ctx.sender()
                        .rsplit_once('@')
                        .is_some_and(|(_, domain)| alias.is_local(domain))
                }) {
                    "1"
                } else {
                    "0"
                }
                .to_string(),
            ),
            // SPF evaluation is an external collaborator out of scope for
            // this server (§1); always reported as unknown.
            ("SPF_PASS", String::new()),
        ]
    }

    /// Spool a message after validation passes.
    ///
    /// This is an internal helper that handles:
    /// - Writing the message to the spool
    /// - Setting success/failure responses
    /// - Clearing transaction metadata
    /// - Audit logging
    /// - Event dispatching
    ///
    /// # Arguments
    ///
    /// * `ctx` - Business context containing the message data
    async fn spool_message(&self, ctx: &mut Context) {
        if let Some(queue) = &self.queue
            && let Err(empath_common::QueueFull) = queue.check_admission()
        {
            tracing::warn!("Delivery queue full, rejecting message with 451");
            ctx.response = Some((
                Status::ActionUnavailable,
                Cow::Borrowed("queue full, please try again later"),
            ));
            return;
        }

        let tracking_id = if let Some(spool) = &self.spool
            && ctx.data.is_some()
        {
            match spool.write(ctx).await {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::error!("Failed to spool message: {e}");
                    ctx.response = Some((
                        Status::ActionUnavailable,
                        Cow::Borrowed("Please try again later"),
                    ));
                    return;
                }
            }
        } else {
            None
        };

        // Clear transaction state after successful acceptance
        ctx.metadata.remove("declared_size");

        // Set success response with tracking ID
        ctx.response = Some((
            Status::Ok,
            tracking_id.as_ref().map_or_else(
                || Cow::Borrowed("Ok: queued"),
                |id| Cow::Owned(format!("Ok: queued as {id}")),
            ),
        ));

        // Audit log: Message received and spooled
        if let Some(id) = &tracking_id {
            let sender = ctx.sender();
            let recipients = ctx.recipients();
            let size = ctx.data.as_ref().map_or(0, |d| d.len());
            let from_ip = self.peer.to_string();

            empath_common::audit::log_message_received(
                &id.to_string(),
                &sender,
                &recipients,
                size,
                &from_ip,
            );
        }

        // Dispatch message received event
        modules::dispatch(modules::Event::Event(modules::Ev::SmtpMessageReceived), ctx);
    }
}

#[async_trait]
impl SmtpTransactionHandler for DefaultSmtpTransactionHandler {
    async fn validate_connect(&mut self, ctx: &mut Context) -> bool {
        // Dispatch connection opened event first
        modules::dispatch(modules::Event::Event(modules::Ev::ConnectionOpened), ctx);

        // Then validate
        modules::dispatch(
            modules::Event::Validate(modules::validate::Event::Connect),
            ctx,
        )
    }

    async fn validate_ehlo(&mut self, ctx: &mut Context) -> bool {
        modules::dispatch(
            modules::Event::Validate(modules::validate::Event::Ehlo),
            ctx,
        )
    }

    async fn validate_mail_from(&mut self, ctx: &mut Context) -> bool {
        if self.submission_mode && !ctx.contains("auth_as") {
            ctx.response = Some((
                Status::Error,
                Cow::Borrowed("Authentication required"),
            ));
            return false;
        }

        if !modules::dispatch(
            modules::Event::Validate(modules::validate::Event::MailFrom),
            ctx,
        ) {
            return false;
        }

        if let Some(store) = &self.domain_info {
            let peer_domain = ctx.id().trim();
            if !peer_domain.is_empty() {
                let level = Self::current_level(ctx);
                match store.incoming_sec_level(&Domain::new(peer_domain), level).await {
                    Ok(true) => {}
                    Ok(false) => {
                        ctx.response = Some((
                            Status::Error,
                            Cow::Borrowed("Security level has decreased, please try again"),
                        ));
                        return false;
                    }
                    Err(e) => {
                        tracing::error!("Failed to check incoming security posture: {e}");
                        ctx.response = Some((
                            Status::ActionUnavailable,
                            Cow::Borrowed("Please try again later"),
                        ));
                        return false;
                    }
                }
            }
        }

        true
    }

    async fn validate_rcpt_to(&mut self, ctx: &mut Context) -> bool {
        if !modules::dispatch(
            modules::Event::Validate(modules::validate::Event::RcptTo),
            ctx,
        ) {
            return false;
        }

        if let Some(alias) = &self.alias {
            for recipient in ctx.recipients() {
                let Some((_, domain)) = recipient.rsplit_once('@') else {
                    continue;
                };

                if alias.is_local(domain) {
                    if !alias.exists(&recipient) {
                        ctx.response = Some((
                            Status::Error,
                            Cow::Owned(format!("Unknown user {recipient}")),
                        ));
                        return false;
                    }
                } else if !ctx.contains("auth_as") {
                    ctx.response = Some((
                        Status::InvalidCommandSequence,
                        Cow::Borrowed("Relay access denied"),
                    ));
                    return false;
                }
            }
        }

        true
    }

    async fn handle_message(&mut self, ctx: &mut Context) -> bool {
        if let Some(data) = ctx.data.as_deref()
            && Self::count_received_headers(data) > MAX_RECEIVED_HEADERS
        {
            ctx.response = Some((
                Status::TransactionFailed,
                Cow::Borrowed("Too many hops, this message is looping"),
            ));
            return false;
        }

        let received_header = self.build_received_header(ctx);

        if let Some(hook) = self.post_data_hook.clone() {
            let env = self.hook_env(ctx);
            let body = ctx.data.as_deref().unwrap_or(&[]);
            let mut framed = Vec::with_capacity(received_header.len() + body.len());
            framed.extend_from_slice(received_header.as_bytes());
            framed.extend_from_slice(body);

            match hook.run(&framed, &env).await {
                HookOutcome::Accept(prepend) => {
                    let mut assembled = prepend.unwrap_or_default();
                    assembled.extend_from_slice(&framed);
                    ctx.data = Some(Arc::from(assembled));
                }
                HookOutcome::RejectPermanent(reason) => {
                    ctx.response = Some((Status::Error, Cow::Owned(reason)));
                    return false;
                }
                HookOutcome::RejectTemporary(reason) => {
                    ctx.response = Some((Status::ActionUnavailable, Cow::Owned(reason)));
                    return false;
                }
            }
        } else {
            let mut assembled = Vec::with_capacity(received_header.len()
                + ctx.data.as_deref().map_or(0, <[u8]>::len));
            assembled.extend_from_slice(received_header.as_bytes());
            assembled.extend_from_slice(ctx.data.as_deref().unwrap_or(&[]));
            ctx.data = Some(Arc::from(assembled));
        }

        // Dispatch validation
        let valid = modules::dispatch(
            modules::Event::Validate(modules::validate::Event::Data),
            ctx,
        );

        // If validation passed, do the work (spooling)
        if valid {
            // Check if any module set a rejection response
            // Positive responses are < 400 (2xx and 3xx codes)
            let should_spool = ctx
                .response
                .as_ref()
                .is_none_or(|(status, _)| !status.is_temporary() && !status.is_permanent());

            if should_spool {
                self.spool_message(ctx).await;
            }
        }

        valid
    }

    async fn validate_auth(&mut self, ctx: &mut Context) -> bool {
        let user = ctx.get("auth_user").map(str::to_string);
        let domain = ctx.get("auth_domain").map(str::to_string);
        let password = ctx.get("auth_password").map(str::to_string);

        ctx.metadata.remove("auth_user");
        ctx.metadata.remove("auth_domain");
        ctx.metadata.remove("auth_password");

        let (Some(user), Some(domain), Some(password)) = (user, domain, password) else {
            ctx.response = Some((
                Status::AuthCredentialsInvalid,
                Cow::Borrowed("Authentication failed"),
            ));
            return false;
        };

        let Some(authenticator) = &self.authenticator else {
            ctx.response = Some((
                Status::AuthCredentialsInvalid,
                Cow::Borrowed("Authentication failed"),
            ));
            return false;
        };

        match authenticator.authenticate(&user, &domain, &password) {
            AuthOutcome::Accepted => {
                ctx.set("auth_as", format!("{user}@{domain}"));
                ctx.response = Some((
                    Status::AuthSuccessful,
                    Cow::Borrowed("Authentication successful"),
                ));
                true
            }
            AuthOutcome::InvalidCredentials => {
                ctx.response = Some((
                    Status::AuthCredentialsInvalid,
                    Cow::Borrowed("Authentication credentials invalid"),
                ));
                false
            }
            AuthOutcome::BackendError => {
                ctx.response = Some((
                    Status::AuthTemporaryFailure,
                    Cow::Borrowed("Temporary authentication failure"),
                ));
                false
            }
        }
    }
}

/// Helper function to determine if state requires validation.
///
/// This is used by the session orchestrator to decide whether to call
/// the business handler after an FSM transition.
///
/// # Arguments
///
/// * `state` - The current protocol state
///
/// # Returns
///
/// `true` if the state requires business logic validation
#[must_use]
pub const fn requires_validation(state: &State) -> bool {
    matches!(
        state,
        State::Connect(_)
            | State::Ehlo(_)
            | State::Helo(_)
            | State::MailFrom(_)
            | State::RcptTo(_)
            | State::PostDot(_)
            | State::Auth(_)
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::MailParameters;

    #[test]
    fn test_default_handler_creation() {
        let handler = DefaultSmtpTransactionHandler::new(
            None,
            "127.0.0.1:1234".parse().unwrap(),
            None,
            None,
            None,
        );
        assert!(handler.spool.is_none());
        assert_eq!(handler.peer.to_string(), "127.0.0.1:1234");
    }

    #[test]
    fn test_default_handler_with_spool() {
        use empath_spool::MemoryBackingStore;

        let spool = Arc::new(MemoryBackingStore::default());
        let handler = DefaultSmtpTransactionHandler::new(
            Some(spool),
            "127.0.0.1:1234".parse().unwrap(),
            None,
            None,
            None,
        );
        assert!(handler.spool.is_some());
    }

    #[test]
    fn test_requires_validation() {
        use crate::state::*;

        // States that require validation
        assert!(requires_validation(&State::Connect(Connect)));
        assert!(requires_validation(&State::Ehlo(Ehlo {
            id: "test".to_string()
        })));
        assert!(requires_validation(&State::Helo(Helo {
            id: "test".to_string()
        })));
        assert!(requires_validation(&State::MailFrom(MailFrom {
            sender: None,
            params: MailParameters::default()
        })));
        assert!(requires_validation(&State::Auth(Auth)));

        // States that don't require validation
        assert!(!requires_validation(&State::Data(Data)));
        assert!(!requires_validation(&State::Quit(Quit)));
        assert!(!requires_validation(&State::Invalid(Invalid {
            reason: String::new()
        })));
    }

    #[tokio::test]
    async fn rcpt_to_rejects_unknown_local_user() {
        use empath_alias::{AliasResolver, AliasResolverConfig, NoUsers};
        use empath_common::envelope::Envelope;

        let alias = Arc::new(AliasResolver::new(AliasResolverConfig::default(), NoUsers));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aliases");
        tokio::fs::write(&path, "known: known@localhost\n")
            .await
            .unwrap();
        alias.add_aliases_file("localhost", &path).await.unwrap();

        let mut handler = DefaultSmtpTransactionHandler::new(
            None,
            "127.0.0.1:1234".parse().unwrap(),
            Some(alias),
            None,
            None,
        );

        let mut ctx = Context {
            envelope: Envelope::default(),
            ..Default::default()
        };
        ctx.envelope.recipients_mut().replace(
            mailparse::addrparse("nobody@localhost").unwrap().into(),
        );

        assert!(!handler.validate_rcpt_to(&mut ctx).await);
        assert_eq!(ctx.response.as_ref().map(|(status, _)| *status), Some(Status::Error));
    }

    #[tokio::test]
    async fn rcpt_to_rejects_relay_to_non_local_domain_without_auth() {
        use empath_alias::{AliasResolver, AliasResolverConfig, NoUsers};
        use empath_common::envelope::Envelope;

        let alias = Arc::new(AliasResolver::new(AliasResolverConfig::default(), NoUsers));

        let mut handler = DefaultSmtpTransactionHandler::new(
            None,
            "127.0.0.1:1234".parse().unwrap(),
            Some(alias),
            None,
            None,
        );

        let mut ctx = Context {
            envelope: Envelope::default(),
            ..Default::default()
        };
        ctx.envelope.recipients_mut().replace(
            mailparse::addrparse("someone@remote.example").unwrap().into(),
        );

        assert!(!handler.validate_rcpt_to(&mut ctx).await);
        assert_eq!(
            ctx.response.as_ref().map(|(status, _)| *status),
            Some(Status::InvalidCommandSequence)
        );
    }

    #[tokio::test]
    async fn rcpt_to_accepts_non_local_domain_when_authenticated() {
        use empath_alias::{AliasResolver, AliasResolverConfig, NoUsers};
        use empath_common::envelope::Envelope;

        let alias = Arc::new(AliasResolver::new(AliasResolverConfig::default(), NoUsers));

        let mut handler = DefaultSmtpTransactionHandler::new(
            None,
            "127.0.0.1:1234".parse().unwrap(),
            Some(alias),
            None,
            None,
        );

        let mut ctx = Context {
            envelope: Envelope::default(),
            ..Default::default()
        };
        ctx.set("auth_as", "someone@localhost");
        ctx.envelope.recipients_mut().replace(
            mailparse::addrparse("someone@remote.example").unwrap().into(),
        );

        assert!(handler.validate_rcpt_to(&mut ctx).await);
    }

    #[tokio::test]
    async fn mail_from_rejects_a_security_downgrade() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(empath_domaininfo::DomainInfoStore::new(dir.path().to_path_buf()));
        store
            .incoming_sec_level(&Domain::new("client.example"), SecurityLevel::TlsInsecure)
            .await
            .unwrap();

        let mut handler = DefaultSmtpTransactionHandler::new(
            None,
            "127.0.0.1:1234".parse().unwrap(),
            None,
            Some(store),
            None,
        );

        let mut ctx = Context {
            id: "client.example".to_string(),
            ..Default::default()
        };

        assert!(!handler.validate_mail_from(&mut ctx).await);
        assert_eq!(ctx.response.as_ref().map(|(status, _)| *status), Some(Status::Error));
    }

    struct AcceptPassword(&'static str);

    impl Authenticator for AcceptPassword {
        fn authenticate(&self, _user: &str, _domain: &str, password: &str) -> AuthOutcome {
            if password == self.0 {
                AuthOutcome::Accepted
            } else {
                AuthOutcome::InvalidCredentials
            }
        }
    }

    #[tokio::test]
    async fn validate_auth_accepts_correct_password() {
        let mut handler = DefaultSmtpTransactionHandler::new(
            None,
            "127.0.0.1:1234".parse().unwrap(),
            None,
            None,
            Some(Arc::new(AcceptPassword("hunter2"))),
        );

        let mut ctx = Context::default();
        ctx.set("auth_user", "testuser");
        ctx.set("auth_domain", "localhost");
        ctx.set("auth_password", "hunter2");

        assert!(handler.validate_auth(&mut ctx).await);
        assert_eq!(ctx.get("auth_as"), Some("testuser@localhost"));
        assert_eq!(
            ctx.response.as_ref().map(|(status, _)| *status),
            Some(Status::AuthSuccessful)
        );
        assert!(!ctx.contains("auth_password"));
    }

    #[tokio::test]
    async fn validate_auth_rejects_wrong_password() {
        let mut handler = DefaultSmtpTransactionHandler::new(
            None,
            "127.0.0.1:1234".parse().unwrap(),
            None,
            None,
            Some(Arc::new(AcceptPassword("hunter2"))),
        );

        let mut ctx = Context::default();
        ctx.set("auth_user", "testuser");
        ctx.set("auth_domain", "localhost");
        ctx.set("auth_password", "wrong");

        assert!(!handler.validate_auth(&mut ctx).await);
        assert_eq!(
            ctx.response.as_ref().map(|(status, _)| *status),
            Some(Status::AuthCredentialsInvalid)
        );
        assert!(!ctx.contains("auth_as"));
    }

    #[tokio::test]
    async fn validate_auth_without_authenticator_rejects() {
        let mut handler = DefaultSmtpTransactionHandler::new(
            None,
            "127.0.0.1:1234".parse().unwrap(),
            None,
            None,
            None,
        );

        let mut ctx = Context::default();
        ctx.set("auth_user", "testuser");
        ctx.set("auth_domain", "localhost");
        ctx.set("auth_password", "whatever");

        assert!(!handler.validate_auth(&mut ctx).await);
        assert_eq!(
            ctx.response.as_ref().map(|(status, _)| *status),
            Some(Status::AuthCredentialsInvalid)
        );
    }

    #[tokio::test]
    async fn submission_mode_rejects_mail_from_without_auth() {
        let mut handler = DefaultSmtpTransactionHandler::new(
            None,
            "127.0.0.1:1234".parse().unwrap(),
            None,
            None,
            None,
        )
        .with_submission_mode(true);

        let mut ctx = Context::default();

        assert!(!handler.validate_mail_from(&mut ctx).await);
        assert_eq!(
            ctx.response.as_ref().map(|(status, _)| *status),
            Some(Status::Error)
        );
    }

    #[tokio::test]
    async fn submission_mode_accepts_mail_from_when_authenticated() {
        let mut handler = DefaultSmtpTransactionHandler::new(
            None,
            "127.0.0.1:1234".parse().unwrap(),
            None,
            None,
            None,
        )
        .with_submission_mode(true);

        let mut ctx = Context::default();
        ctx.set("auth_as", "someone@localhost");

        assert!(handler.validate_mail_from(&mut ctx).await);
    }

    #[test]
    fn count_received_headers_stops_at_blank_line() {
        let data = b"Received: one\r\nReceived: two\r\n\r\nReceived: not a header\r\n";
        assert_eq!(
            DefaultSmtpTransactionHandler::count_received_headers(data),
            2
        );
    }

    #[tokio::test]
    async fn handle_message_rejects_a_mail_loop() {
        let mut handler = DefaultSmtpTransactionHandler::new(
            None,
            "127.0.0.1:1234".parse().unwrap(),
            None,
            None,
            None,
        );

        let mut data = Vec::new();
        for _ in 0..=MAX_RECEIVED_HEADERS {
            data.extend_from_slice(b"Received: from x by y; date\r\n");
        }
        data.extend_from_slice(b"\r\nbody\r\n");

        let mut ctx = Context {
            data: Some(Arc::from(data)),
            ..Default::default()
        };

        assert!(!handler.handle_message(&mut ctx).await);
        assert_eq!(
            ctx.response.as_ref().map(|(status, _)| *status),
            Some(Status::TransactionFailed)
        );
    }

    #[tokio::test]
    async fn handle_message_prepends_a_received_header() {
        use empath_spool::MemoryBackingStore;

        let spool = Arc::new(MemoryBackingStore::default());
        let mut handler = DefaultSmtpTransactionHandler::new(
            Some(spool),
            "127.0.0.1:1234".parse().unwrap(),
            None,
            None,
            None,
        )
        .with_hostname("mx.example.com");

        let mut ctx = Context {
            data: Some(Arc::from(b"Subject: hi\r\n\r\nbody\r\n".to_vec())),
            ..Default::default()
        };

        assert!(handler.handle_message(&mut ctx).await);
        let data = ctx.data.as_deref().unwrap();
        assert!(data.starts_with(b"Received: "));
        assert!(
            data.windows(b"by mx.example.com".len())
                .any(|w| w == b"by mx.example.com")
        );
    }
}
