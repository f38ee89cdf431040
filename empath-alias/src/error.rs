//! Error types for alias file parsing and resolution.

use thiserror::Error;

/// Errors that can occur while loading or resolving aliases.
#[derive(Debug, Error)]
pub enum AliasError {
    /// The alias file could not be read for a reason other than "missing".
    ///
    /// A missing file is explicitly *not* an error (see
    /// [`crate::resolver::AliasResolver::add_aliases_file`]); this variant
    /// only fires for permission/IO failures on a file that does exist.
    #[error("failed to read alias file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A line in the alias file didn't parse.
    #[error("{path}:{line}: {reason}")]
    Parse {
        path: String,
        line: usize,
        reason: String,
    },

    /// Resolution recursed past the bound without reaching a terminal entry.
    #[error("alias recursion limit exceeded resolving {0}")]
    RecursionLimit(String),

    /// The external resolver hook failed or timed out.
    #[error("alias resolver hook failed: {0}")]
    Hook(String),
}
