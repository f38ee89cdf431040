//! Post-DATA filtering hook (§4.G, §6).
//!
//! An optional executable invoked once a message has been fully read,
//! before it is spooled. It receives the message bytes on stdin and its
//! exit code decides the outcome: 0 accepts (and its stdout, if it looks
//! like a header block, is prepended to the message); 20 rejects
//! permanently using its last stdout line as the client-visible reason;
//! anything else is a transient failure. Grounded on the same
//! spawn-with-timeout shape as `empath_delivery::courier::run_piped` /
//! `empath_alias::resolver::AliasResolver::run_hook`.

use std::{path::PathBuf, process::Stdio, time::Duration};

use empath_common::tracing;
use tokio::{io::AsyncWriteExt, process::Command};

/// Deadline for the whole hook invocation (§5).
pub(crate) const HOOK_TIMEOUT: Duration = Duration::from_secs(60);
const REJECT_EXIT_CODE: i32 = 20;

/// An optional post-DATA hook executable.
#[derive(Debug, Clone)]
pub struct PostDataHook {
    path: PathBuf,
}

/// Outcome of running the post-DATA hook against a message.
#[derive(Debug)]
pub enum HookOutcome {
    /// Accept the message, optionally prepending the given header block.
    Accept(Option<Vec<u8>>),
    /// Permanent rejection (exit code 20); carries the client-visible reason.
    RejectPermanent(String),
    /// Transient failure (any other non-zero exit, timeout, or spawn error).
    RejectTemporary(String),
}

impl PostDataHook {
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Run the hook against `data`, piping it to stdin and collecting
    /// stdout/exit status within the 1 minute deadline (§5). A hook that
    /// doesn't exist on disk is treated as absent, matching the alias
    /// resolver's external hook (§4.C).
    pub async fn run(&self, data: &[u8], env: &[(&str, String)]) -> HookOutcome {
        if tokio::fs::metadata(&self.path).await.is_err() {
            return HookOutcome::Accept(None);
        }

        let mut command = Command::new(&self.path);
        command
            .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return HookOutcome::RejectTemporary(format!("failed to spawn hook: {e}")),
        };

        let Some(mut stdin) = child.stdin.take() else {
            return HookOutcome::RejectTemporary("failed to open hook stdin".to_string());
        };

        let payload = data.to_vec();
        let write_handle = tokio::spawn(async move {
            let _ = stdin.write_all(&payload).await;
            drop(stdin);
        });

        let output = match tokio::time::timeout(HOOK_TIMEOUT, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return HookOutcome::RejectTemporary(format!("hook I/O error: {e}")),
            Err(_) => return HookOutcome::RejectTemporary("post-data hook timed out".to_string()),
        };

        let _ = write_handle.await;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        match output.status.code() {
            Some(0) => {
                let prepend = looks_like_header_block(&stdout).then(|| normalize_headers(&stdout));
                HookOutcome::Accept(prepend)
            }
            Some(REJECT_EXIT_CODE) => {
                let reason = stdout
                    .lines()
                    .next_back()
                    .unwrap_or("message rejected by filter")
                    .to_string();
                HookOutcome::RejectPermanent(reason)
            }
            _ => {
                tracing::warn!("post-DATA hook exited with {:?}", output.status);
                HookOutcome::RejectTemporary("post-DATA hook failed".to_string())
            }
        }
    }
}

/// Re-wrap hook stdout to CRLF line endings with a trailing blank-line
/// terminator, so it can be spliced directly in front of the message body.
fn normalize_headers(stdout: &str) -> Vec<u8> {
    let mut normalized = stdout.replace("\r\n", "\n").replace('\n', "\r\n");
    if !normalized.ends_with("\r\n") {
        normalized.push_str("\r\n");
    }
    normalized.into_bytes()
}

/// Defensive check of hook stdout: discard it unless every non-empty line
/// looks like a header (`Name: value`) or a folded continuation (leading
/// whitespace), matching the "parsed defensively" hook contract (§9).
fn looks_like_header_block(stdout: &str) -> bool {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return false;
    }

    trimmed.lines().all(|line| {
        line.starts_with(' ')
            || line.starts_with('\t')
            || line.split_once(':').is_some_and(|(name, _)| {
                !name.is_empty() && name.chars().all(|c| c.is_ascii_graphic() && c != ':')
            })
    })
}
