//! Local delivery couriers.
//!
//! The remote SMTP path is handled by [`crate::smtp_transaction::SmtpTransaction`].
//! These two couriers cover the other two delivery mechanisms from §4.E:
//! handing a message to a local MDA binary, and running a `| command` pipe
//! alias target. Both invoke a subprocess, pipe the message to its stdin,
//! and classify the exit status: zero is success, non-zero is a permanent
//! failure, and a timeout is temporary. Grounded on the same
//! spawn-with-timeout shape as `empath_alias::resolver::AliasResolver::run_hook`.

use std::{path::PathBuf, process::Stdio, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, process::Command};

use crate::error::{DeliveryError, PermanentError, SystemError, TemporaryError};

const PIPE_TIMEOUT: Duration = Duration::from_secs(30);

fn default_mda_timeout_secs() -> u64 {
    60
}

/// Configuration for the local MDA courier.
///
/// Delivery to a domain this server is authoritative for is handed off to
/// this binary rather than attempted over SMTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalMdaConfig {
    /// Path to the MDA binary (e.g. `/usr/bin/procmail`, `/usr/bin/maildrop`).
    pub command: PathBuf,

    /// Arguments passed to `command`, with `%from%`, `%from_user%`,
    /// `%from_domain%`, `%to%`, `%to_user%`, `%to_domain%` substituted per
    /// delivery.
    #[serde(default)]
    pub args: Vec<String>,

    /// Seconds to wait for the MDA to exit before treating the attempt as a
    /// temporary failure.
    #[serde(default = "default_mda_timeout_secs")]
    pub timeout_secs: u64,
}

impl LocalMdaConfig {
    fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Delivers a message to a local mailbox by invoking a configured MDA binary.
#[derive(Debug, Clone)]
pub struct LocalMdaCourier {
    config: LocalMdaConfig,
}

impl LocalMdaCourier {
    #[must_use]
    pub const fn new(config: LocalMdaConfig) -> Self {
        Self { config }
    }

    /// Deliver `data`, addressed from `from` to `to`, to the configured MDA.
    ///
    /// # Errors
    /// Returns [`PermanentError::CourierFailed`] for a non-zero exit, or a
    /// [`TemporaryError`] if the MDA times out or cannot be spawned.
    pub async fn deliver(&self, from: &str, to: &str, data: &[u8]) -> Result<(), DeliveryError> {
        let args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|arg| substitute(arg, from, to))
            .collect();

        run_piped(
            self.config.command.to_string_lossy().as_ref(),
            &args,
            data,
            self.config.timeout(),
        )
        .await
    }
}

/// Delivers a message by invoking a `| command` alias target directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipeCourier;

impl PipeCourier {
    /// Run `command` through a shell, piping `data` to its stdin.
    ///
    /// # Errors
    /// Returns [`PermanentError::CourierFailed`] for a non-zero exit, or a
    /// [`TemporaryError`] if the command times out or cannot be spawned.
    pub async fn deliver(&self, command: &str, data: &[u8]) -> Result<(), DeliveryError> {
        run_piped(
            "/bin/sh",
            &["-c".to_string(), command.to_string()],
            data,
            PIPE_TIMEOUT,
        )
        .await
    }
}

/// Substitute the `%from%`/`%to%` family of argument placeholders.
fn substitute(template: &str, from: &str, to: &str) -> String {
    let (from_user, from_domain) = split(from);
    let (to_user, to_domain) = split(to);

    template
        .replace("%from_user%", from_user)
        .replace("%from_domain%", from_domain)
        .replace("%from%", from)
        .replace("%to_user%", to_user)
        .replace("%to_domain%", to_domain)
        .replace("%to%", to)
}

fn split(addr: &str) -> (&str, &str) {
    addr.split_once('@').unwrap_or((addr, ""))
}

async fn run_piped(
    program: &str,
    args: &[String],
    data: &[u8],
    timeout: Duration,
) -> Result<(), DeliveryError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(SystemError::Io)?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| SystemError::Internal(format!("failed to open stdin for {program}")))?;

    let payload = data.to_vec();
    let write_handle = tokio::spawn(async move {
        let _ = stdin.write_all(&payload).await;
        drop(stdin);
    });

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| TemporaryError::Timeout(format!("{program} timed out after {timeout:?}")))?
        .map_err(SystemError::Io)?;

    let _ = write_handle.await;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(PermanentError::CourierFailed(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        ))
        .into())
    }
}
