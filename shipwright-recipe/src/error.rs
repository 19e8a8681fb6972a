//! Error types for recipe parsing, splitting, and planning.

/// Alias for `Result<T, shipwright_recipe::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while reading, splitting, or planning a recipe.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The recipe source could not be reached or read.
    #[error("invalid source: {0}")]
    InvalidSource(String),

    /// A directive could not be parsed.
    #[error("parse error at line {line}: {message}")]
    Parse {
        /// 1-based line number of the offending directive.
        line: u32,
        /// Human-readable description of the problem.
        message: String,
    },

    /// An `ARG` directive was given with zero tokens.
    #[error("ARG directive at line {0} has no name")]
    ArgMissing(u32),

    /// Stage splitting found a structural violation.
    #[error("stage error: {0}")]
    Stage(String),

    /// Resource resolution failed.
    #[error("resolve error: {0}")]
    Resolve(#[from] ResolveError),

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from resolving ADD/COPY sources into resources.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ResolveError {
    /// The `source` token was empty.
    #[error("empty source in {0}")]
    EmptySource(String),

    /// The resolved path escaped the recipe's parent directory.
    #[error("source escapes recipe parent: {0}")]
    Traversal(String),

    /// No filesystem entry matched the glob pattern.
    #[error("source not found: {0}")]
    NotFound(String),

    /// An HTTP(S) source returned a non-success status.
    #[error("http error fetching {url}: status {status}")]
    HttpError {
        /// The URL that was requested.
        url: String,
        /// The HTTP status code returned.
        status: u16,
    },
}
