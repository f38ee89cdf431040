//! Parser for the alias file syntax documented in §4.C / §6.
//!
//! ```text
//! key: rhs1, rhs2, …         # addresses; empty domain = local
//! key: | command arg1 arg2    # pipe; terminal
//! key: addr via host1/host2   # forward through explicit relays
//! ```

use std::collections::HashMap;

use crate::{error::AliasError, types::RightHandSide};

/// Parse the text of a single alias file, defaulting bare (no `@`)
/// right-hand addresses to `domain`.
///
/// Later keys override earlier ones, matching the documented
/// "duplicate keys later in the file override earlier ones" rule.
pub(crate) fn parse(
    text: &str,
    domain: &str,
    path: &str,
) -> Result<HashMap<String, Vec<RightHandSide>>, AliasError> {
    let mut entries: HashMap<String, Vec<RightHandSide>> = HashMap::new();

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key_part, rhs_part)) = line.split_once(':') else {
            return Err(AliasError::Parse {
                path: path.to_string(),
                line: line_no,
                reason: format!("missing ':' separator in {raw_line:?}"),
            });
        };

        let key = parse_key(key_part, path, line_no)?;
        let rhs = parse_rhs(rhs_part.trim(), domain, path, line_no)?;

        entries.insert(key, rhs);
    }

    Ok(entries)
}

fn parse_key(raw: &str, path: &str, line: usize) -> Result<String, AliasError> {
    let key = raw.trim();

    if key.is_empty() {
        return Err(AliasError::Parse {
            path: path.to_string(),
            line,
            reason: "empty alias key".to_string(),
        });
    }

    if key.contains(['@', ',', ':']) || key.chars().any(char::is_whitespace) {
        return Err(AliasError::Parse {
            path: path.to_string(),
            line,
            reason: format!("invalid alias key {key:?}: must not contain '@', ',', ':' or whitespace"),
        });
    }

    Ok(key.to_ascii_lowercase())
}

/// Parse the right-hand side of an alias entry; see module docs for syntax.
///
/// # Errors
/// Returns [`AliasError::Parse`] on a malformed right-hand side.
pub(crate) fn parse_rhs(
    rhs: &str,
    domain: &str,
    path: &str,
    line: usize,
) -> Result<Vec<RightHandSide>, AliasError> {
    if rhs.is_empty() {
        return Err(AliasError::Parse {
            path: path.to_string(),
            line,
            reason: "empty right-hand side".to_string(),
        });
    }

    if let Some(command) = rhs.strip_prefix('|') {
        let command = command.trim();
        if command.is_empty() {
            return Err(AliasError::Parse {
                path: path.to_string(),
                line,
                reason: "empty pipe command".to_string(),
            });
        }
        return Ok(vec![RightHandSide::Pipe(command.to_string())]);
    }

    rhs.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| parse_rhs_entry(part, domain, path, line))
        .collect()
}

fn parse_rhs_entry(
    part: &str,
    domain: &str,
    path: &str,
    line: usize,
) -> Result<RightHandSide, AliasError> {
    if let Some((addr, via)) = split_via(part) {
        let hosts: Vec<String> = via.split('/').map(|h| h.trim().to_string()).filter(|h| !h.is_empty()).collect();
        if hosts.is_empty() {
            return Err(AliasError::Parse {
                path: path.to_string(),
                line,
                reason: format!("empty relay list in {part:?}"),
            });
        }
        return Ok(RightHandSide::Forward {
            address: qualify(addr, domain),
            via: hosts,
        });
    }

    Ok(RightHandSide::Email(qualify(part, domain)))
}

/// Split `"addr via host1/host2"` into `("addr", "host1/host2")`.
fn split_via(part: &str) -> Option<(&str, &str)> {
    let mut words = part.split_whitespace();
    let addr = words.next()?;
    let keyword = words.next()?;
    if keyword != "via" {
        return None;
    }
    let rest = part[part.find("via")? + 3..].trim();
    if rest.is_empty() { None } else { Some((addr, rest)) }
}

/// Right-hand addresses without `@` default to the file's domain.
fn qualify(addr: &str, domain: &str) -> String {
    if addr.contains('@') {
        addr.to_string()
    } else {
        format!("{addr}@{domain}")
    }
}
