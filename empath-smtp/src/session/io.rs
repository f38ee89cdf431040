use std::borrow::Cow;

use empath_common::{context, error::SessionError, internal, status::Status, tracing};
use empath_tracing::traced;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{State, command::Command, state};

use super::{Context, Session};

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    /// Receive and process data from the client
    ///
    /// Returns `Ok(true)` if the connection should be closed, `Ok(false)` to continue.
    ///
    /// # Errors
    /// Returns `SessionError` if there's a protocol error or I/O failure.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, ret), timing)]
    pub(super) async fn receive(
        &mut self,
        validate_context: &mut context::Context,
    ) -> Result<bool, SessionError> {
        let mut received_data = [0; 4096];

        match self.connection.receive(&mut received_data).await {
            // Consider any errors received here to be fatal
            Err(err) => {
                internal!("Error: {err}");
                Err(SessionError::Protocol(err.to_string()))
            }
            Ok(0) => {
                // Reading 0 bytes means the other side has closed the
                // connection or is done writing, then so are we.
                Ok(true)
            }
            Ok(bytes_read) => {
                let received = &received_data[..bytes_read];

                if matches!(self.context.state, State::Reading(_)) {
                    self.handle_data_reception(received, validate_context);
                } else {
                    self.handle_command_reception(received, validate_context);
                }

                Ok(false)
            }
        }
    }

    /// Handle reception of message data (during DATA state)
    fn handle_data_reception(
        &mut self,
        received: &[u8],
        validate_context: &mut context::Context,
    ) {
        // A prior chunk already triggered rejection (oversize or bad
        // framing) and we haven't seen the terminator yet. Keep consuming
        // and discarding bytes -- never treat them as commands -- until the
        // terminator line appears, then fall back to command mode. This is
        // the anti-smuggling defense: without it, the tail of a rejected
        // DATA payload could be reinterpreted as SMTP commands.
        if self.discarding_data {
            if Self::scan_for_terminator(&mut self.discard_tail, received) {
                self.finish_discarding(validate_context);
            }
            return;
        }

        if Self::scan_for_bare_newline(&mut self.pending_cr, received) {
            validate_context.response = Some((
                Status::ParameterSyntaxError,
                Cow::Borrowed("Line contains a bare CR or LF octet"),
            ));
            self.begin_discarding(received, validate_context);
            return;
        }

        // Check if adding received data would exceed limit (BEFORE extending buffer)
        // This prevents the buffer overflow vulnerability where an attacker could
        // consume up to max_message_size + 4095 bytes before being rejected
        // Use checked_add to prevent integer overflow on 32-bit systems
        if self.max_message_size > 0 {
            let total_size = self.context.message.len().saturating_add(received.len());

            if total_size > self.max_message_size {
                validate_context.response = Some((
                    Status::ExceededStorage,
                    Cow::Owned(format!(
                        "Actual message size {total_size} bytes exceeds maximum allowed size {} bytes",
                        self.max_message_size
                    )),
                ));

                // Keep consuming until the terminator instead of resetting
                // state immediately -- see the `discarding_data` comment
                // above for why.
                self.begin_discarding(received, validate_context);
                return;
            }
        }

        self.context.message.extend(received);

        if self.context.message.ends_with(b"\r\n.\r\n") {
            // Move the message buffer to avoid double cloning
            let message = std::mem::take(&mut self.context.message);
            let unstuffed = Self::remove_dot_stuffing(&message);

            self.context = Context {
                state: State::PostDot(state::PostDot),
                message: message.clone(),
                sent: false,
            };

            validate_context.data = Some(unstuffed.into());
        }
    }

    /// Abort the in-flight transaction (as RSET does) and start discarding
    /// incoming DATA bytes instead of buffering or parsing them, scanning
    /// `received` itself in case the terminator is already present in the
    /// same chunk that triggered rejection.
    fn begin_discarding(&mut self, received: &[u8], validate_context: &mut context::Context) {
        *validate_context.envelope.sender_mut() = None;
        *validate_context.envelope.recipients_mut() = None;
        *validate_context.envelope.mail_params_mut() = None;

        self.context.message = Vec::new();
        self.discarding_data = true;
        self.discard_tail.clear();
        self.pending_cr = false;

        if Self::scan_for_terminator(&mut self.discard_tail, received) {
            self.finish_discarding(validate_context);
        }
    }

    /// Return to command mode, keeping whatever response was already
    /// staged by the caller that triggered discarding.
    fn finish_discarding(&mut self, validate_context: &mut context::Context) {
        self.discarding_data = false;
        self.discard_tail.clear();

        self.context = Context {
            state: if validate_context.extended {
                State::Ehlo(state::Ehlo {
                    id: validate_context.id.clone(),
                })
            } else {
                State::Helo(state::Helo {
                    id: validate_context.id.clone(),
                })
            },
            message: Vec::new(),
            sent: false,
        };
    }

    /// Scans `chunk` for the `\r\n.\r\n` end-of-data terminator, carrying the
    /// last few bytes of the previous chunk in `tail` so the terminator is
    /// still recognised if it straddles a `receive()` boundary.
    fn scan_for_terminator(tail: &mut Vec<u8>, chunk: &[u8]) -> bool {
        const TERMINATOR: &[u8] = b"\r\n.\r\n";

        tail.extend_from_slice(chunk);
        let found = tail.windows(TERMINATOR.len()).any(|w| w == TERMINATOR);

        let keep = tail.len().min(TERMINATOR.len() - 1);
        let start = tail.len() - keep;
        tail.drain(..start);

        found
    }

    /// Scans `chunk` for a lone CR or LF octet, i.e. one not part of a
    /// `\r\n` pair. `pending_cr` carries a trailing unresolved CR across
    /// chunk boundaries. Returns `true` if a violation was found.
    fn scan_for_bare_newline(pending_cr: &mut bool, chunk: &[u8]) -> bool {
        let mut i = 0;

        if *pending_cr {
            *pending_cr = false;
            match chunk.first() {
                Some(b'\n') => i = 1,
                Some(_) | None => return true,
            }
        }

        while i < chunk.len() {
            match chunk[i] {
                b'\r' => {
                    if i + 1 == chunk.len() {
                        *pending_cr = true;
                        i += 1;
                    } else if chunk[i + 1] == b'\n' {
                        i += 2;
                    } else {
                        return true;
                    }
                }
                b'\n' => return true,
                _ => i += 1,
            }
        }

        false
    }

    /// Undoes dot-stuffing and strips the end-of-data terminator from a
    /// buffered DATA payload (the raw bytes accumulated between the `DATA`
    /// command and the terminator line, terminator included).
    fn remove_dot_stuffing(buffer: &[u8]) -> Vec<u8> {
        let content = buffer.strip_suffix(b".\r\n").unwrap_or(buffer);

        let mut out = Vec::with_capacity(content.len());
        let mut start = 0;
        let mut i = 0;

        while i + 1 < content.len() {
            if content[i] == b'\r' && content[i + 1] == b'\n' {
                Self::push_unstuffed_line(&mut out, &content[start..i + 2]);
                i += 2;
                start = i;
            } else {
                i += 1;
            }
        }

        if start < content.len() {
            Self::push_unstuffed_line(&mut out, &content[start..]);
        }

        out
    }

    fn push_unstuffed_line(out: &mut Vec<u8>, line: &[u8]) {
        if line.first() == Some(&b'.') {
            out.extend_from_slice(&line[1..]);
        } else {
            out.extend_from_slice(line);
        }
    }

    /// Handle reception of SMTP commands
    fn handle_command_reception(
        &mut self,
        received: &[u8],
        validate_context: &mut context::Context,
    ) {
        use empath_common::incoming;

        // A line received while `AuthContinuation` is active is a raw SASL
        // response, not an SMTP command; parsing it with `Command::try_from`
        // would reject valid base64 that happens to look like a keyword.
        let command = if matches!(self.context.state, State::AuthContinuation(_)) {
            std::str::from_utf8(received).map_or_else(
                |_| Command::Invalid("Unable to interpret command".to_string()),
                |line| Command::AuthResponse(line.trim().to_string()),
            )
        } else {
            Command::try_from(received).unwrap_or_else(|e| e)
        };
        let message = command.inner().as_bytes().to_vec();

        incoming!("{command}");

        self.context = Context {
            state: self
                .context
                .state
                .clone()
                .transition(command, validate_context),
            message,
            sent: false,
        };

        if matches!(self.context.state, State::Reading(_)) {
            // Fresh DATA transaction: clear any leftover framing-scan state
            // from a previous message.
            self.discarding_data = false;
            self.discard_tail.clear();
            self.pending_cr = false;
        }

        tracing::debug!("Transitioned to {:#?}", self.context);
    }
}
