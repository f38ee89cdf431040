//! The concurrent, reload-swappable alias map and resolution algorithm
//! (§4.C normalization pipeline, recursion, and external hook).

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};

use dashmap::DashMap;
use serde::Deserialize;
use tokio::process::Command;

use crate::{
    error::AliasError,
    parser,
    types::{ResolvedRecipient, RightHandSide},
};

const MAX_RECURSION_DEPTH: usize = 10;
const HOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Queried to answer "does this local user exist" for step 4 of the
/// normalization pipeline. The actual password database (§6) is an external
/// collaborator; this trait is its seam into the resolver.
pub trait UserExists: Send + Sync {
    /// Returns `true` if `local` is a known mailbox user in `domain`.
    fn user_exists(&self, local: &str, domain: &str) -> bool;
}

/// A `UserExists` that never reports a match, for configurations that don't
/// wire up a user database (or in tests).
#[derive(Debug, Default)]
pub struct NoUsers;

impl UserExists for NoUsers {
    fn user_exists(&self, _local: &str, _domain: &str) -> bool {
        false
    }
}

/// Tunables carried over from `chasquid.conf`-equivalent configuration
/// (§6: `suffix_separators`, `drop_characters`).
#[derive(Debug, Clone, Deserialize)]
pub struct AliasResolverConfig {
    #[serde(default = "default_suffix_separators")]
    pub suffix_separators: String,
    #[serde(default = "default_drop_characters")]
    pub drop_characters: String,
    /// Path to the optional external alias-resolve hook (§6).
    #[serde(default)]
    pub hook: Option<PathBuf>,
}

fn default_suffix_separators() -> String {
    "+".to_string()
}

fn default_drop_characters() -> String {
    ".".to_string()
}

impl Default for AliasResolverConfig {
    fn default() -> Self {
        Self {
            suffix_separators: default_suffix_separators(),
            drop_characters: default_drop_characters(),
            hook: None,
        }
    }
}

/// Parses and holds alias files, and resolves addresses against them.
///
/// The map is a [`DashMap`] keyed by the full normalized `local@domain`
/// address so that reload (`add_aliases_file` called again for the same
/// domain) can replace a domain's entries without taking a global lock.
pub struct AliasResolver<U: UserExists = NoUsers> {
    entries: DashMap<String, Vec<RightHandSide>>,
    local_domains: RwLock<HashSet<String>>,
    config: AliasResolverConfig,
    users: U,
}

impl<U: UserExists> core::fmt::Debug for AliasResolver<U> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AliasResolver")
            .field("entries", &self.entries.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<U: UserExists> AliasResolver<U> {
    #[must_use]
    pub fn new(config: AliasResolverConfig, users: U) -> Self {
        Self {
            entries: DashMap::new(),
            local_domains: RwLock::new(HashSet::new()),
            config,
            users,
        }
    }

    /// Parse `path` as an alias file for `domain` and merge its entries in.
    ///
    /// A non-existent file is not an error (the domain still becomes known
    /// as local, with an empty alias set). A parse error is.
    ///
    /// # Errors
    /// Returns [`AliasError::Io`] on a read failure other than "not found",
    /// or [`AliasError::Parse`] if the file's syntax is invalid.
    pub async fn add_aliases_file(&self, domain: &str, path: &Path) -> Result<(), AliasError> {
        let domain = normalize_domain(domain);

        self.local_domains
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(domain.clone());

        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(AliasError::Io {
                    path: path.display().to_string(),
                    source: err,
                });
            }
        };

        let parsed = parser::parse(&text, &domain, &path.display().to_string())?;

        // Replace this domain's prior entries before inserting the fresh
        // ones, so a reload doesn't leave stale keys from a shrunk file.
        self.entries
            .retain(|key, _| !key.ends_with(&format!("@{domain}")));

        for (local, rhs) in parsed {
            self.entries.insert(format!("{local}@{domain}"), rhs);
        }

        Ok(())
    }

    /// Returns `true` if `addr` maps to something deliverable.
    #[must_use]
    pub fn exists(&self, addr: &str) -> bool {
        let Some((local, domain)) = split_address(addr) else {
            return false;
        };

        if self.entries.contains_key(&format!("{local}@{domain}")) {
            return true;
        }

        for candidate in cleaned_candidates(&local, &self.config) {
            if self.entries.contains_key(&format!("{candidate}@{domain}")) {
                return true;
            }
        }

        if self.is_local(&domain) {
            return self.users.user_exists(&local, &domain)
                || self.entries.contains_key(&format!("*@{domain}"));
        }

        false
    }

    /// Resolve `addr` to its final list of recipients, recursing through
    /// `email`-typed aliases up to [`MAX_RECURSION_DEPTH`].
    ///
    /// # Errors
    /// Returns [`AliasError::RecursionLimit`] if resolution recurses past
    /// the bound, or the hook's error if the external resolver fails.
    pub async fn resolve(&self, addr: &str) -> Result<Vec<ResolvedRecipient>, AliasError> {
        self.resolve_depth(addr, 0).await
    }

    async fn resolve_depth(
        &self,
        addr: &str,
        depth: usize,
    ) -> Result<Vec<ResolvedRecipient>, AliasError> {
        if depth >= MAX_RECURSION_DEPTH {
            return Err(AliasError::RecursionLimit(addr.to_string()));
        }

        let Some(matches) = self.lookup(addr) else {
            return Ok(vec![ResolvedRecipient::Email(addr.to_string())]);
        };

        let mut hook_matches = self.run_hook(addr).await?;
        let mut all = matches;
        all.append(&mut hook_matches);

        let original_local = split_address(addr).map(|(local, _)| local);
        let mut resolved = Vec::with_capacity(all.len());

        for rhs in all {
            if rhs.is_terminal() {
                resolved.push(rhs.into());
                continue;
            }

            let RightHandSide::Email(target) = rhs else {
                unreachable!("terminal entries filtered above");
            };

            let target = substitute_wildcard_user(&target, original_local.as_deref());

            Box::pin(self.resolve_depth(&target, depth + 1))
                .await
                .map(|mut more| resolved.append(&mut more))?;
        }

        Ok(resolved)
    }

    /// Internal lookup step: the normalization pipeline (§4.C steps 1-5)
    /// minus the external hook, which is applied by the caller.
    fn lookup(&self, addr: &str) -> Option<Vec<RightHandSide>> {
        let (local, domain) = split_address(addr)?;

        if let Some(hit) = self.entries.get(&format!("{local}@{domain}")) {
            return Some(hit.clone());
        }

        for candidate in cleaned_candidates(&local, &self.config) {
            if let Some(hit) = self.entries.get(&format!("{candidate}@{domain}")) {
                return Some(hit.clone());
            }
        }

        if self.is_local(&domain) {
            if self.users.user_exists(&local, &domain) {
                return None;
            }
            if let Some(hit) = self.entries.get(&format!("*@{domain}")) {
                return Some(hit.clone());
            }
            // Open Question (§9): catch-all targets a remote domain whose
            // user doesn't exist there either — preserve original behaviour
            // and let the queue attempt (and fail) local delivery as-is.
            return None;
        }

        None
    }

    async fn run_hook(&self, addr: &str) -> Result<Vec<RightHandSide>, AliasError> {
        let Some(hook) = &self.config.hook else {
            return Ok(Vec::new());
        };

        if tokio::fs::metadata(hook).await.is_err() {
            return Ok(Vec::new());
        }

        let output = tokio::time::timeout(HOOK_TIMEOUT, Command::new(hook).arg(addr).output())
            .await
            .map_err(|_| AliasError::Hook(format!("{} timed out", hook.display())))?
            .map_err(|e| AliasError::Hook(e.to_string()))?;

        if !output.status.success() {
            return Err(AliasError::Hook(format!(
                "{} exited with {}",
                hook.display(),
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(Vec::new());
        }

        let domain = split_address(addr).map_or_else(String::new, |(_, d)| d);
        parser::parse_rhs(stdout, &domain, &hook.display().to_string(), 0)
    }

    /// Returns `true` if an alias file has been loaded for `domain`, i.e.
    /// this resolver considers it a locally-delivered domain rather than one
    /// to relay through unchanged.
    #[must_use]
    pub fn is_local(&self, domain: &str) -> bool {
        self.local_domains
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(domain)
    }
}

/// Case-fold the local part and IDNA-normalize the domain to its Unicode
/// (U-label) form, per §3.
fn split_address(addr: &str) -> Option<(String, String)> {
    let (local, domain) = addr.rsplit_once('@')?;
    Some((local.to_ascii_lowercase(), normalize_domain(domain)))
}

fn normalize_domain(domain: &str) -> String {
    let (unicode, result) = idna::domain_to_unicode(domain);
    if result.is_ok() {
        unicode.to_ascii_lowercase()
    } else {
        domain.to_ascii_lowercase()
    }
}

/// §4.C step 3: produce the drop-char/suffix-stripped retry candidates, in
/// priority order (suffix retained first, then suffix stripped), so that an
/// alias intentionally keyed with a literal suffix (`recu-zzz`) is found
/// before falling back to the bare prefix (`recu`).
fn cleaned_candidates(local: &str, config: &AliasResolverConfig) -> Vec<String> {
    if config.suffix_separators.is_empty() {
        return Vec::new();
    }

    let Some(sep_idx) = local.find(|c| config.suffix_separators.contains(c)) else {
        return Vec::new();
    };

    let (prefix, suffix) = local.split_at(sep_idx);
    let cleaned_prefix: String = prefix.chars().filter(|c| !config.drop_characters.contains(*c)).collect();

    if cleaned_prefix.is_empty() {
        return Vec::new();
    }

    let with_suffix = format!("{cleaned_prefix}{suffix}");
    let mut candidates = vec![with_suffix.clone()];
    if with_suffix != cleaned_prefix {
        candidates.push(cleaned_prefix);
    }
    candidates
}

/// A right-hand local part of `*` is replaced with the original user before
/// recursing, so `*: *@other` forwards every local user to `other`.
fn substitute_wildcard_user(target: &str, original_local: Option<&str>) -> String {
    let Some((local, domain)) = target.split_once('@') else {
        return target.to_string();
    };

    if local == "*" {
        if let Some(original) = original_local {
            return format!("{original}@{domain}");
        }
    }

    target.to_string()
}
