use core::fmt::{self, Display, Formatter};

use empath_common::{address::Address, context::Context};
use serde::{Deserialize, Serialize};

use crate::{
    auth,
    command::{AuthMechanism, Command, HeloVariant},
};

/// Sealed trait to prevent external state implementations
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for valid SMTP states
pub trait SmtpState: sealed::Sealed + core::fmt::Debug {}

// ============================================================================
// State Definitions
// ============================================================================

/// Initial connection state - client just connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect;

/// After successful EHLO command (extended SMTP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ehlo {
    pub id: String,
}

/// After successful HELO command (basic SMTP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Helo {
    pub id: String,
}

/// HELP command was issued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Help {
    pub from_ehlo: bool,
}

/// After successful STARTTLS negotiation (only from EHLO/HELO, not mid-transaction)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTls;

/// After MAIL FROM command (beginning of mail transaction)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailFrom {
    pub sender: Option<Address>,
    pub params: super::MailParameters,
}

/// After RCPT TO command (at least one recipient)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RcptTo {
    pub sender: Option<Address>,
    pub params: super::MailParameters,
}

/// After DATA command (ready to receive message body)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data;

/// Reading message data (after DATA command, before end-of-data marker)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading;

/// After end-of-data marker (.\r\n), message complete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostDot;

/// Which leg of the `AUTH LOGIN`/`AUTH PLAIN` dialog is being waited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthStage {
    /// `AUTH PLAIN` with no initial response; waiting for the base64
    /// `authzid\0authcid\0passwd` line.
    AwaitingPlainResponse,
    /// `AUTH LOGIN`; waiting for the base64-encoded username.
    AwaitingUsername,
    /// `AUTH LOGIN`; waiting for the base64-encoded password.
    AwaitingPassword,
}

/// Mid-dialog AUTH state: a `334` continuation prompt has been sent and the
/// next line from the client is raw SASL data, not an SMTP command (§4.G).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContinuation {
    pub mechanism: AuthMechanism,
    pub stage: AuthStage,
    /// The decoded username, once known (set after `AwaitingUsername`).
    pub user: Option<String>,
}

/// Credentials have been decoded and are waiting on an async check against
/// the (external) password database; see `auth_user`/`auth_domain`/
/// `auth_password` in the business [`Context`]'s metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth;

/// Client issued QUIT command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quit;

/// Invalid command or sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalid {
    pub reason: String,
}

/// Connection rejected by validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject;

/// Connection closing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Close;

// ============================================================================
// Sealed Trait Implementations
// ============================================================================

impl sealed::Sealed for Connect {}
impl sealed::Sealed for Ehlo {}
impl sealed::Sealed for Helo {}
impl sealed::Sealed for Help {}
impl sealed::Sealed for StartTls {}
impl sealed::Sealed for MailFrom {}
impl sealed::Sealed for RcptTo {}
impl sealed::Sealed for Data {}
impl sealed::Sealed for Reading {}
impl sealed::Sealed for PostDot {}
impl sealed::Sealed for AuthContinuation {}
impl sealed::Sealed for Auth {}
impl sealed::Sealed for Quit {}
impl sealed::Sealed for Invalid {}
impl sealed::Sealed for Reject {}
impl sealed::Sealed for Close {}

impl SmtpState for Connect {}
impl SmtpState for Ehlo {}
impl SmtpState for Helo {}
impl SmtpState for Help {}
impl SmtpState for StartTls {}
impl SmtpState for MailFrom {}
impl SmtpState for RcptTo {}
impl SmtpState for Data {}
impl SmtpState for Reading {}
impl SmtpState for PostDot {}
impl SmtpState for AuthContinuation {}
impl SmtpState for Auth {}
impl SmtpState for Quit {}
impl SmtpState for Invalid {}
impl SmtpState for Reject {}
impl SmtpState for Close {}

// ============================================================================
// State Enum for Dynamic Dispatch
// ============================================================================

/// Type-safe state enum that wraps all possible states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    Connect(Connect),
    Ehlo(Ehlo),
    Helo(Helo),
    Help(Help),
    StartTls(StartTls),
    MailFrom(MailFrom),
    RcptTo(RcptTo),
    Data(Data),
    Reading(Reading),
    PostDot(PostDot),
    AuthContinuation(AuthContinuation),
    Auth(Auth),
    Quit(Quit),
    Invalid(Invalid),
    Reject(Reject),
    Close(Close),
}

impl Default for State {
    fn default() -> Self {
        Self::Connect(Connect)
    }
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Reading(_) | Self::PostDot(_) => "",
            Self::Connect(_) => "Connect",
            Self::Close(_) => "Close",
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
            Self::Help(_) => "HELP",
            Self::StartTls(_) => "STARTTLS",
            Self::MailFrom(_) => "MAIL",
            Self::RcptTo(_) => "RCPT",
            Self::Data(_) => "DATA",
            Self::AuthContinuation(_) => "",
            Self::Auth(_) => "AUTH",
            Self::Quit(_) => "QUIT",
            Self::Invalid(_) => "INVALID",
            Self::Reject(_) => "Rejected",
        })
    }
}

// ============================================================================
// Type-Safe Transition Methods
// ============================================================================

impl State {
    /// Transition from current state based on received command
    ///
    /// This method enforces valid state transitions at runtime while using
    /// type-safe state structs internally
    #[must_use]
    pub fn transition(self, command: Command, ctx: &mut Context) -> Self {
        match (self, command) {
            // Connect state transitions
            (Self::Connect(_), Command::Helo(HeloVariant::Ehlo(id))) => {
                ctx.id.clone_from(&id);
                ctx.extended = true;
                Self::Ehlo(Ehlo { id })
            }
            (Self::Connect(_), Command::Helo(HeloVariant::Helo(id))) => {
                ctx.id.clone_from(&id);
                Self::Helo(Helo { id })
            }

            // EHLO/HELO transitions (can do STARTTLS or HELP)
            (Self::Ehlo(_) | Self::Helo(_), Command::StartTLS) if ctx.extended => {
                Self::StartTls(StartTls)
            }
            (Self::Ehlo(_), Command::Help) => Self::Help(Help { from_ehlo: true }),
            (Self::Helo(_), Command::Help) => Self::Help(Help { from_ehlo: false }),

            // Begin mail transaction (only from authenticated/ready states, NOT from MailFrom/RcptTo/Data)
            (
                Self::Ehlo(_)
                | Self::Helo(_)
                | Self::StartTls(_)
                | Self::Help(_)
                | Self::PostDot(_)
                | Self::Auth(_),
                Command::MailFrom(sender, params),
            ) => {
                ctx.envelope.sender_mut().clone_from(&sender);
                // Store all MAIL FROM parameters in envelope for module access
                *ctx.envelope.mail_params_mut() = Some(params.clone().into());
                Self::MailFrom(MailFrom { sender, params })
            }

            // Cannot do STARTTLS after mail transaction has started
            (Self::MailFrom(_) | Self::RcptTo(_) | Self::Data(_), Command::StartTLS) => {
                Self::Invalid(Invalid {
                    reason: "STARTTLS not allowed during mail transaction".to_string(),
                })
            }

            // Recipient collection (can add multiple recipients)
            (Self::MailFrom(state), Command::RcptTo(recipients)) => {
                if let Some(rcpts) = ctx.envelope.recipients_mut() {
                    rcpts.extend_from_slice(&recipients[..]);
                } else {
                    *ctx.envelope.recipients_mut() = Some(recipients);
                }
                Self::RcptTo(RcptTo {
                    sender: state.sender,
                    params: state.params,
                })
            }
            (Self::RcptTo(state), Command::RcptTo(recipients)) => {
                if let Some(rcpts) = ctx.envelope.recipients_mut() {
                    rcpts.extend_from_slice(&recipients[..]);
                } else {
                    *ctx.envelope.recipients_mut() = Some(recipients);
                }
                Self::RcptTo(state) // Stay in RcptTo, accumulating recipients
            }

            // DATA command (must have at least one recipient)
            (Self::RcptTo(_), Command::Data) => Self::Data(Data),

            // After DATA response, client sends message body
            (Self::Data(_), _) => Self::Reading(Reading),

            // RSET clears transaction state and returns to ready state (EHLO or HELO).
            // Connection-level facts (TLS posture, authenticated identity) are not
            // transaction state and survive a RSET.
            (_, Command::Rset) => {
                ctx.metadata.retain(|key, _| {
                    matches!(key.as_str(), "tls" | "protocol" | "cipher" | "auth_as")
                });
                *ctx.envelope.sender_mut() = None;
                *ctx.envelope.recipients_mut() = None;
                *ctx.envelope.mail_params_mut() = None;
                if ctx.extended {
                    Self::Ehlo(Ehlo { id: ctx.id.clone() })
                } else {
                    Self::Helo(Helo { id: ctx.id.clone() })
                }
            }

            // QUIT from any state
            (_, Command::Quit) => Self::Quit(Quit),

            // HTTP method as the first token defeats cross-protocol smuggling (§4.G, §8).
            (_, Command::HttpMethodDetected) => {
                ctx.response = Some((
                    empath_common::status::Status::CommandNotImplemented,
                    std::borrow::Cow::Borrowed("Command not implemented"),
                ));
                Self::Reject(Reject)
            }

            // AUTH (§4.G): requires TLS, and only once per connection. PLAIN may
            // carry its credentials as an initial response; otherwise (and for
            // LOGIN, always) the dialog continues via AuthContinuation.
            (
                Self::Ehlo(_) | Self::Helo(_) | Self::Auth(_),
                Command::Auth(mechanism, initial_response),
            ) => {
                if ctx.contains("auth_as") {
                    Self::Invalid(Invalid {
                        reason: "Already authenticated".to_string(),
                    })
                } else if ctx.get("tls") != Some("true") {
                    Self::Invalid(Invalid {
                        reason: "Must negotiate TLS before AUTH".to_string(),
                    })
                } else {
                    match (mechanism, initial_response) {
                        (AuthMechanism::Plain, Some(response)) => {
                            Self::complete_auth_plain(&response, ctx)
                        }
                        (AuthMechanism::Plain, None) => Self::AuthContinuation(AuthContinuation {
                            mechanism,
                            stage: AuthStage::AwaitingPlainResponse,
                            user: None,
                        }),
                        (AuthMechanism::Login, _) => Self::AuthContinuation(AuthContinuation {
                            mechanism,
                            stage: AuthStage::AwaitingUsername,
                            user: None,
                        }),
                    }
                }
            }

            // Mid-dialog AUTH PLAIN/LOGIN continuation line.
            (Self::AuthContinuation(cont), Command::AuthResponse(line)) => match cont.stage {
                AuthStage::AwaitingPlainResponse => Self::complete_auth_plain(&line, ctx),
                AuthStage::AwaitingUsername => match auth::decode_base64(&line) {
                    Ok(user) => Self::AuthContinuation(AuthContinuation {
                        mechanism: cont.mechanism,
                        stage: AuthStage::AwaitingPassword,
                        user: Some(user),
                    }),
                    Err(_) => Self::Invalid(Invalid {
                        reason: "Invalid base64 response".to_string(),
                    }),
                },
                AuthStage::AwaitingPassword => match auth::decode_base64(&line) {
                    Ok(password) => {
                        let authcid = cont.user.clone().unwrap_or_default();
                        let (user, domain) = authcid.rsplit_once('@').map_or_else(
                            || (authcid.clone(), ctx.id.clone()),
                            |(u, d)| (u.to_string(), d.to_string()),
                        );
                        ctx.set("auth_user", user);
                        ctx.set("auth_domain", domain);
                        ctx.set("auth_password", password);
                        Self::Auth(Auth)
                    }
                    Err(_) => Self::Invalid(Invalid {
                        reason: "Invalid base64 response".to_string(),
                    }),
                },
            },

            // Invalid transitions
            (Self::Invalid(state), _) => Self::Invalid(state),
            (state, _) => Self::Invalid(Invalid {
                reason: format!("Invalid command sequence from {state}"),
            }),
        }
    }

    /// Decode an `AUTH PLAIN` payload and stash the credentials in the
    /// business context for `validate_auth` to check, or fail the dialog.
    fn complete_auth_plain(b64: &str, ctx: &mut Context) -> Self {
        match auth::decode_plain(b64, &ctx.id) {
            Ok((user, domain, password)) => {
                ctx.set("auth_user", user);
                ctx.set("auth_domain", domain);
                ctx.set("auth_password", password);
                Self::Auth(Auth)
            }
            Err(_) => Self::Invalid(Invalid {
                reason: "Invalid AUTH PLAIN response".to_string(),
            }),
        }
    }

    /// Check if this state represents an error condition
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Invalid(_) | Self::Reject(_))
    }

    /// Check if this state should close the connection
    #[must_use]
    pub const fn should_close(&self) -> bool {
        matches!(self, Self::Quit(_) | Self::Close(_) | Self::Reject(_))
    }

    /// Check if we're in a mail transaction (between MAIL FROM and `PostDot`)
    #[must_use]
    pub const fn in_transaction(&self) -> bool {
        matches!(
            self,
            Self::MailFrom(_) | Self::RcptTo(_) | Self::Data(_) | Self::Reading(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
