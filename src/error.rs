//! Error types for the gateway core.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Everything that can go wrong between gateway construction and the pull loop.
///
/// Construction-time path errors are fatal to the caller. Decode and dispatch
/// errors inside a running server are caught at the pull-loop boundary and
/// surfaced through tracing and the protocol state machine instead.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("another non-directory object exists at the path given: {0}")]
    PathConflict(PathBuf),

    #[error("permissions allow group or others to access: {0}")]
    PathPermission(PathBuf),

    #[error("failed to create folder at: {path}")]
    PathCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("varint ran out of bytes at offset {offset} of {len}")]
    Truncated { offset: usize, len: usize },

    #[error("bad message: {0}")]
    BadMessage(String),

    #[error("no handler for stream type: {0}")]
    StreamInitFailed(u8),

    #[error("invalid stream id: {0}")]
    UnknownStream(u64),
}
