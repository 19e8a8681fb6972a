//! Top-level orchestrator error type.
//!
//! Every subsystem (C1–C13) surfaces its own error type; this enum is the
//! one the orchestrator's build/run drivers actually propagate, collecting
//! each kind named in spec §7.

/// Alias for `Result<T, shipwright::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the orchestrator.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration failed validation before any side effect ran.
    #[error("configuration: {0}")]
    Config(String),

    /// Filesystem, pipe, or socket I/O.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Recipe parsing, stage splitting, build-environment, resolution, or
    /// planning failure (C1–C4, C6).
    #[error(transparent)]
    Recipe(#[from] shipwright_recipe::Error),

    /// Dependency stage build or export failure (C5).
    #[error(transparent)]
    Dependency(#[from] shipwright_deps::Error),

    /// Bootstrap transport or protocol failure (C7).
    #[error("bootstrap rpc: {0}")]
    Rpc(String),

    /// A subprocess exited non-zero; carries the exit code and captured
    /// stderr.
    #[error("{program} exited with {code}: {stderr}")]
    Process {
        /// Program that was invoked.
        program: String,
        /// Process exit code, or -1 if killed by signal.
        code: i32,
        /// Captured stderr.
        stderr: String,
    },

    /// The hypervisor refused to start or crashed (C9/C11).
    #[error("vmm: {0}")]
    Vmm(String),

    /// A CNI plugin add/delete failed (C10).
    #[error("cni: {0}")]
    Cni(String),

    /// A bounded wait exceeded its deadline.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The bootstrap client signalled `abort`; the rootfs is invalid and no
    /// artifact is persisted.
    #[error("build aborted: {0}")]
    Aborted(String),
}

impl From<tokio_rustls::rustls::Error> for Error {
    fn from(e: tokio_rustls::rustls::Error) -> Self {
        Self::Rpc(e.to_string())
    }
}
