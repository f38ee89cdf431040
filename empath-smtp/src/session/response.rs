use core::bstr;

use empath_common::{context, status::Status, tracing};
use empath_tracing::traced;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    State,
    session::{Event, Response, Session},
    state,
};

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    /// Format and return the response to send to the client
    ///
    /// This is a pure formatter - all validation and work happens in `emit()`.
    /// Just formats the response based on state and what `emit()` set in the context.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, ret), timing(precision = "ns"))]
    pub(super) async fn response(&mut self, validate_context: &mut context::Context) -> Response {
        if self.context.sent {
            return (None, Event::ConnectionKeepAlive);
        }

        // Emit events, do validation and work first
        self.emit(validate_context).await;

        // If emit() set a response in the context, use it
        // Only close connection for Reject state, not all permanent errors
        if let Some((status, ref message)) = validate_context.response {
            // Record error metrics for 4xx and 5xx responses
            if empath_metrics::is_enabled()
                && (status.is_temporary() || status.is_permanent())
            {
                empath_metrics::metrics().smtp.record_error(status.into());
            }

            let event = if matches!(self.context.state, State::Reject(_)) && status.is_permanent() {
                Event::ConnectionClose
            } else {
                Event::ConnectionKeepAlive
            };

            if matches!(self.context.state, State::Ehlo(_)) && !validate_context.capabilities.is_empty() {
                return (
                    Some(Self::ehlo_lines(status, message, &validate_context.capabilities)),
                    event,
                );
            }

            return (Some(vec![format!("{status} {message}")]), event);
        }

        // Otherwise, provide default responses for states not handled by emit()
        self.default_response(validate_context)
    }

    /// Provide default responses for states not handled by `emit()`
    fn default_response(&mut self, validate_context: &context::Context) -> Response {
        match &self.context.state {
            State::Helo(_) => (
                Some(vec![format!(
                    "{} {} says hello to {}",
                    Status::Ok,
                    self.banner,
                    bstr::ByteStr::new(&self.context.message)
                )]),
                Event::ConnectionKeepAlive,
            ),
            State::StartTls(_) => self.starttls_response(),
            State::Data(_) => self.data_response(validate_context),
            State::AuthContinuation(cont) => (
                Some(vec![format!("{} {}", Status::AuthContinue, Self::auth_prompt(cont))]),
                Event::ConnectionKeepAlive,
            ),
            State::Quit(_) => (
                Some(vec![format!("{} Bye", Status::GoodBye)]),
                Event::ConnectionClose,
            ),
            State::Invalid(_) => (
                Some(vec![format!(
                    "{} {}",
                    Status::InvalidCommandSequence,
                    self.context.state
                )]),
                Event::ConnectionClose,
            ),
            State::Reject(_) => {
                // Reject should have response set by emit(), but provide fallback
                (
                    Some(vec![format!("{} Unavailable", Status::Unavailable)]),
                    Event::ConnectionClose,
                )
            }
            // States handled by emit() (Connect, Ehlo, MailFrom, RcptTo, PostDot) should have set a response
            // States like Reading, Close, and others that don't need responses
            _ => (None, Event::ConnectionKeepAlive),
        }
    }

    /// Render a greeting line plus one `250-`/`250 ` line per advertised
    /// capability, per RFC 5321 §4.1.1.1's multiline reply format.
    fn ehlo_lines(
        status: Status,
        greeting: &str,
        capabilities: &[context::Capability],
    ) -> Vec<String> {
        let mut lines = Vec::with_capacity(capabilities.len() + 1);
        lines.push(format!("{status}-{greeting}"));
        let last = capabilities.len() - 1;
        for (i, capability) in capabilities.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            lines.push(format!("{status}{sep}{capability}"));
        }
        lines
    }

    /// The base64 `334` continuation prompt for the current leg of an AUTH
    /// LOGIN/PLAIN dialog. AUTH PLAIN's prompt is empty per RFC 4954.
    fn auth_prompt(cont: &state::AuthContinuation) -> String {
        match cont.stage {
            state::AuthStage::AwaitingPlainResponse => String::new(),
            state::AuthStage::AwaitingUsername => crate::auth::encode_prompt("Username:"),
            state::AuthStage::AwaitingPassword => crate::auth::encode_prompt("Password:"),
        }
    }

    /// Generate response for STARTTLS command
    fn starttls_response(&self) -> Response {
        if self.tls_context.is_some() {
            (
                Some(vec![format!("{} Ready to begin TLS", Status::ServiceReady)]),
                Event::ConnectionKeepAlive,
            )
        } else {
            (
                Some(vec![format!("{} TLS not available", Status::Error)]),
                Event::ConnectionClose,
            )
        }
    }

    /// Generate response for DATA command and transition to Reading state
    fn data_response(&mut self, validate_context: &context::Context) -> Response {
        self.context.state = State::Reading(state::Reading);

        // Pre-allocate message buffer based on SIZE parameter if declared
        if let Some(params) = validate_context.envelope.mail_params()
            && let Some(Some(size_str)) = params.get("SIZE")
            && let Ok(declared_size) = size_str.parse::<usize>()
        {
            // Reserve capacity to avoid reallocations during message receipt
            self.context.message.reserve(declared_size);
        }

        (
            Some(vec![format!(
                "{} End data with <CR><LF>.<CR><LF>",
                Status::StartMailInput
            )]),
            Event::ConnectionKeepAlive,
        )
    }
}

#[cfg(test)]
mod tests {
    use empath_common::{context::Capability, status::Status};
    use tokio::net::TcpStream;

    use super::Session;

    type S = Session<TcpStream>;

    #[test]
    fn ehlo_lines_renders_greeting_and_one_line_per_capability() {
        let capabilities = vec![
            Capability("STARTTLS".to_string()),
            Capability("SIZE 1000000".to_string()),
            Capability("AUTH PLAIN LOGIN".to_string()),
        ];

        let lines = S::ehlo_lines(Status::Ok, "mail.example.com says hello", &capabilities);

        assert_eq!(
            lines,
            vec![
                "250-mail.example.com says hello".to_string(),
                "250-STARTTLS".to_string(),
                "250-SIZE 1000000".to_string(),
                "250 AUTH PLAIN LOGIN".to_string(),
            ]
        );
    }

    #[test]
    fn ehlo_lines_with_single_capability_marks_it_as_last() {
        let capabilities = vec![Capability("HELP".to_string())];

        let lines = S::ehlo_lines(Status::Ok, "hi", &capabilities);

        assert_eq!(lines, vec!["250-hi".to_string(), "250 HELP".to_string()]);
    }
}
