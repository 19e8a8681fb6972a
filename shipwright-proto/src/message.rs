//! Message types for the bootstrap server↔client RPC (spec §4.7/§4.8).
//!
//! The guest holds one TLS connection to the host for the whole build and
//! drives it request/response: it asks for the command list once, then
//! requests each resource it needs, streams log lines as it runs, and
//! finally reports `success` or `abort`. There is no host-initiated
//! message — every [`Response`] answers exactly one [`Request`].

use serde::{Deserialize, Serialize};

/// Wire protocol version. Bumped on every incompatible change.
pub const PROTOCOL_VERSION: u32 = 1;

/// Chunk size used when streaming a resource's bytes (1 MiB).
pub const RESOURCE_CHUNK_SIZE: usize = 1 << 20;

/// Default TCP port the bootstrap server listens on inside the build network.
pub const SERVER_PORT: u16 = 7620;

/// Guest → host request on the bootstrap connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Fetch the ordered command list. Sent once, at the start of the build.
    Commands,
    /// Request one resource (file or directory) by its source identifier.
    Resource {
        /// Identifier a [`Command::Transfer`] referenced.
        id: String,
    },
    /// Append stdout lines to the host's log sink.
    Stdout {
        /// Lines produced since the last `Stdout` request.
        lines: Vec<String>,
    },
    /// Append stderr lines to the host's log sink.
    Stderr {
        /// Lines produced since the last `Stderr` request.
        lines: Vec<String>,
    },
    /// Report that every command completed. Terminal.
    Success,
    /// Report that the build failed. Terminal.
    Abort {
        /// Human-readable failure description.
        error: String,
    },
}

/// Host → guest response on the bootstrap connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Answers [`Request::Commands`].
    Commands {
        /// The plan's commands, in the order [`crate::Command::Run`] and
        /// [`crate::Command::Transfer`] must be executed.
        commands: Vec<Command>,
    },
    /// One frame of a [`Request::Resource`] stream. A single request
    /// produces one [`ResourceFrame::Header`], zero or more
    /// [`ResourceFrame::Chunk`]s, then one [`ResourceFrame::Eof`] per file;
    /// a directory source repeats that triple once per child entry,
    /// depth-first.
    Resource(ResourceFrame),
    /// Answers `Stdout`, `Stderr`, `Success`, and `Abort` — a bare ack.
    Ack,
    /// The request was malformed or referenced something the server doesn't
    /// have (e.g. an unknown resource id).
    Error(ErrorInfo),
}

/// One executable step of the work plan, self-describing on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Run a shell command under the declared environment.
    Run {
        /// The command text, already environment-expanded by the planner.
        command: String,
        /// `KEY=VALUE` pairs to export before running `command`.
        env: Vec<String>,
        /// Shell invocation tokens, e.g. `["/bin/sh", "-c"]`.
        shell: Vec<String>,
        /// `uid:gid` to run as.
        user: String,
        /// Working directory, created if absent.
        workdir: String,
    },
    /// Materialize a resource (file or directory) at `target`.
    Transfer {
        /// Identifier to pass to [`Request::Resource`].
        resource_id: String,
        /// Destination path inside the guest.
        target: String,
        /// `uid:gid` to chown the materialized path to.
        user: String,
        /// Working directory a relative `target` is resolved against.
        workdir: String,
        /// Explicit chown override from `--chown=`, if given.
        chown: Option<String>,
        /// `true` for `ADD` (permits remote/archive sources), `false` for `COPY`.
        is_add: bool,
    },
}

/// One frame of a streamed resource transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResourceFrame {
    /// Announces a file about to be streamed, or one child of a directory
    /// source.
    Header {
        /// Identifier correlating this header with its chunks and EOF.
        id: String,
        /// Original resource source descriptor, for diagnostics.
        source: String,
        /// Path (relative to the transfer's target) this entry materializes at.
        target: String,
        /// Unix permission bits, if known.
        mode: Option<u32>,
        /// `true` if this entry is a directory marker with no chunks.
        is_dir: bool,
        /// `uid:gid` to apply once materialized.
        user: String,
        /// Working directory the entry's target is resolved against.
        workdir: String,
    },
    /// A chunk of the current entry's bytes.
    Chunk {
        /// Identifier matching the preceding [`ResourceFrame::Header`].
        id: String,
        /// Raw bytes, at most [`RESOURCE_CHUNK_SIZE`] long.
        bytes: Vec<u8>,
        /// SHA-256 of `bytes`, letting the client detect corruption per chunk.
        sha256: [u8; 32],
    },
    /// End of the current entry's byte stream.
    Eof {
        /// Identifier matching the preceding [`ResourceFrame::Header`].
        id: String,
        /// `true` if another `Header`/`Chunk*`/`Eof` triple follows on this
        /// same [`Request::Resource`] response (a directory source with
        /// more children); `false` ends the response.
        more: bool,
    },
}

/// Structured error with a machine-readable code and a human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable error classification.
    pub code: ErrorCode,
    /// Human-readable error description.
    pub message: String,
}

impl ErrorInfo {
    /// Creates a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates a not-found error (e.g. unknown resource id).
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Protocol version mismatch.
    VersionMismatch,
    /// Requested resource id is unknown to the server.
    NotFound,
    /// Request was malformed.
    InvalidRequest,
    /// Internal server error.
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_info_display_includes_code() {
        let err = ErrorInfo::not_found("no such resource: abc");
        assert!(err.to_string().contains("NotFound"));
        assert!(err.to_string().contains("abc"));
    }
}
