//! AUTH PLAIN/LOGIN credential verification (§4.G).
//!
//! The password database itself (§6) is an external collaborator; this
//! module only owns the SASL framing (decoding `PLAIN`/`LOGIN` payloads) and
//! the seam the decoded `(user, domain, password)` triple is checked
//! against, mirroring how [`empath_alias::UserExists`] seams the alias
//! resolver to the same external database.

use base64::Engine;

/// Outcome of an authentication attempt against the (external) password
/// database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Credentials were valid.
    Accepted,
    /// The backend was reachable and the credentials were rejected.
    InvalidCredentials,
    /// The backend could not be consulted (e.g. I/O error); this is a
    /// transient condition distinct from a credential mismatch.
    BackendError,
}

/// Queried to verify AUTH PLAIN/LOGIN credentials. The actual password
/// database (§6) is an external collaborator; this trait is its seam into
/// the session.
pub trait Authenticator: Send + Sync {
    /// Verify `password` for `user@domain`.
    fn authenticate(&self, user: &str, domain: &str, password: &str) -> AuthOutcome;
}

/// An `Authenticator` that rejects every credential, for configurations
/// that don't wire up a user database (or in tests).
#[derive(Debug, Default)]
pub struct NoAuth;

impl Authenticator for NoAuth {
    fn authenticate(&self, _user: &str, _domain: &str, _password: &str) -> AuthOutcome {
        AuthOutcome::InvalidCredentials
    }
}

/// Errors produced while decoding a SASL response line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SaslError {
    #[error("invalid base64 encoding")]
    InvalidBase64,
    #[error("malformed PLAIN payload")]
    MalformedPlain,
    #[error("invalid UTF-8 in SASL response")]
    InvalidUtf8,
}

/// Decode a `base64`-encoded SASL response line (used for both the AUTH
/// PLAIN initial-response and the AUTH LOGIN username/password
/// continuation lines).
pub fn decode_base64(line: &str) -> Result<String, SaslError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(line.trim())
        .map_err(|_| SaslError::InvalidBase64)?;
    String::from_utf8(bytes).map_err(|_| SaslError::InvalidUtf8)
}

/// Decode a SASL `PLAIN` payload (RFC 4616): `authzid\0authcid\0passwd`.
///
/// The `authzid` is ignored. `authcid` is split into `(user, domain)` on
/// the first `@`; when the authcid has no domain part, `default_domain` is
/// used (the EHLO/HELO domain of the current session).
pub fn decode_plain(
    b64: &str,
    default_domain: &str,
) -> Result<(String, String, String), SaslError> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(b64.trim())
        .map_err(|_| SaslError::InvalidBase64)?;

    let mut parts = decoded.splitn(3, |&b| b == 0);
    let _authzid = parts.next().ok_or(SaslError::MalformedPlain)?;
    let authcid = parts.next().ok_or(SaslError::MalformedPlain)?;
    let passwd = parts.next().ok_or(SaslError::MalformedPlain)?;

    let authcid = std::str::from_utf8(authcid).map_err(|_| SaslError::InvalidUtf8)?;
    let passwd = std::str::from_utf8(passwd).map_err(|_| SaslError::InvalidUtf8)?;

    Ok(split_user_domain(authcid, default_domain, passwd))
}

/// Split an authentication identity of the form `user` or `user@domain`
/// into `(user, domain, password)`, defaulting the domain when absent.
fn split_user_domain(authcid: &str, default_domain: &str, passwd: &str) -> (String, String, String) {
    authcid.rsplit_once('@').map_or_else(
        || {
            (
                authcid.to_string(),
                default_domain.to_string(),
                passwd.to_string(),
            )
        },
        |(user, domain)| (user.to_string(), domain.to_string(), passwd.to_string()),
    )
}

/// Produce the base64 `334` prompt text for the AUTH LOGIN dialog.
#[must_use]
pub fn encode_prompt(prompt: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(prompt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_payload(authzid: &str, authcid: &str, passwd: &str) -> String {
        let mut raw = Vec::new();
        raw.extend_from_slice(authzid.as_bytes());
        raw.push(0);
        raw.extend_from_slice(authcid.as_bytes());
        raw.push(0);
        raw.extend_from_slice(passwd.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(raw)
    }

    #[test]
    fn decodes_plain_with_domain() {
        let b64 = plain_payload("", "testuser@localhost", "testpasswd");
        let (user, domain, pass) = decode_plain(&b64, "fallback").unwrap();
        assert_eq!(user, "testuser");
        assert_eq!(domain, "localhost");
        assert_eq!(pass, "testpasswd");
    }

    #[test]
    fn decodes_plain_without_domain_uses_default() {
        let b64 = plain_payload("", "testuser", "testpasswd");
        let (user, domain, pass) = decode_plain(&b64, "example.com").unwrap();
        assert_eq!(user, "testuser");
        assert_eq!(domain, "example.com");
        assert_eq!(pass, "testpasswd");
    }

    #[test]
    fn rejects_malformed_plain() {
        let b64 = base64::engine::general_purpose::STANDARD.encode(b"justoneseg");
        assert_eq!(decode_plain(&b64, "x").unwrap_err(), SaslError::MalformedPlain);
    }

    #[test]
    fn rejects_invalid_base64() {
        assert_eq!(
            decode_plain("not valid base64!!", "x").unwrap_err(),
            SaslError::InvalidBase64
        );
        assert_eq!(decode_base64("not valid base64!!").unwrap_err(), SaslError::InvalidBase64);
    }

    #[test]
    fn login_username_roundtrips() {
        let encoded = encode_prompt("someuser");
        assert_eq!(decode_base64(&encoded).unwrap(), "someuser");
    }

    #[test]
    fn no_auth_always_rejects() {
        assert_eq!(
            NoAuth.authenticate("anyone", "anywhere", "anything"),
            AuthOutcome::InvalidCredentials
        );
    }
}
