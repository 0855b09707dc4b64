//! Gateway core: stream session records and the channel-pair base.
//!
//! A gateway owns one outbound and one inbound channel of a crosswise-wired
//! pair under a common base path: the client writes where the server reads
//! and vice versa, so each side names its "sender" and "receiver" path
//! consistently. [`client::Client`] drives outbound streams, [`server::Server`]
//! runs the receive/dispatch loop.

pub mod client;
pub mod server;

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::fsm::{Event, StateMachine};
use crate::transport::{self, Params, Publisher, Record, Subscriber};

// Wire event codes double as state-machine events.
pub const EV_START: Event = 1;
pub const EV_ONE: Event = 2;
pub const EV_NEXT: Event = 3;
pub const EV_END: Event = 4;
pub const EV_STOP: Event = 5;
pub const EV_FIX: Event = 6;
pub const EV_ERROR: Event = 7;

/// Set of states, usually the terminal states of one stream machine.
pub type StateSet = HashSet<u16>;

/// Register display names for the stream events on `fsm`.
pub fn set_stream_event_names<C>(fsm: &mut StateMachine<C>) {
    fsm.event_name(EV_START, "START STREAM");
    fsm.event_name(EV_ONE, "SINGLE MESSAGE");
    fsm.event_name(EV_NEXT, "NEXT STREAM");
    fsm.event_name(EV_END, "END STREAM");
    fsm.event_name(EV_STOP, "STOP STREAM");
    fsm.event_name(EV_FIX, "FIX STREAM");
    fsm.event_name(EV_ERROR, "ERROR");
}

// =============================================================================
// Session records
// =============================================================================

/// One wire unit of a stream, inbound or outbound.
#[derive(Debug, Clone, Default)]
pub struct StreamPart {
    /// Stream identity, assigned at the first packet.
    pub id: u64,
    /// Continuation sequence number; zero on first packets.
    pub seqno: u64,
    /// Payload bytes (reason text, for control events).
    pub buffer: Bytes,
    /// Absolute transport position of the framing record.
    pub position: u64,
    /// Decoded record length.
    pub total_bytes: u64,
    /// Protocol event byte.
    pub event: u8,
    /// Only meaningful when `event` is START or ONE; continuations do not
    /// carry it on the wire.
    pub stream_type: u8,
}

impl StreamPart {
    pub fn size(&self) -> u64 {
        self.buffer.len() as u64
    }
}

/// Per-stream cursor state, one instance per logical stream, owned by
/// whichever side created the stream.
///
/// The signed fields use `-1` for "not yet": `id` is assigned exactly once,
/// when the stream's first packet is transmitted or received.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub id: i64,
    pub sent_seqno: i64,
    pub received_seqno: i64,
    pub sent_pos: u64,
    pub received_pos: u64,
}

impl Default for StreamInfo {
    fn default() -> Self {
        Self {
            id: -1,
            sent_seqno: -1,
            received_seqno: -1,
            sent_pos: 0,
            received_pos: 0,
        }
    }
}

impl StreamInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Info for a stream whose identity is already known (the receive side).
    pub fn with_id(id: u64) -> Self {
        Self {
            id: id as i64,
            ..Self::default()
        }
    }
}

// =============================================================================
// Base path provisioning
// =============================================================================

/// Validate or create the directory backing a channel pair.
///
/// The directory must be accessible to its owner only; a conflicting
/// non-directory object or group/other permission bits fail construction.
fn provision_base_path(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(GatewayError::PathConflict(path.to_path_buf()));
            }
            if meta.permissions().mode() & 0o077 != 0 {
                return Err(GatewayError::PathPermission(path.to_path_buf()));
            }
            Ok(())
        }
        Err(_) => fs::DirBuilder::new()
            .mode(0o700)
            .create(path)
            .map_err(|source| GatewayError::PathCreateFailed {
                path: path.to_path_buf(),
                source,
            }),
    }
}

// =============================================================================
// Gateway base
// =============================================================================

/// Channel-pair base shared by both engines. Validates its backing storage
/// location exactly once, at construction.
pub struct Gateway {
    base_path: PathBuf,
    sender: Box<dyn Publisher>,
    receiver: Box<dyn Subscriber>,
}

impl Gateway {
    /// `sender_name` and `receiver_name` pick the two channels of the pair;
    /// client and server pass them crosswise.
    pub(crate) fn new(
        base_path: &Path,
        sender_name: &str,
        receiver_name: &str,
        params: &Params,
    ) -> Result<Self> {
        provision_base_path(base_path)?;
        let sender = transport::open_publisher(&base_path.join(sender_name), params);
        let receiver = transport::open_subscriber(&base_path.join(receiver_name), params);
        debug!(
            base_path = %base_path.display(),
            sender_name,
            receiver_name,
            "gateway attached to channel pair"
        );
        Ok(Self {
            base_path: base_path.to_path_buf(),
            sender: Box::new(sender),
            receiver: Box::new(receiver),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub(crate) fn send(&self, segments: &[Bytes]) -> Result<()> {
        self.sender.push(segments)
    }

    pub(crate) fn pull(
        &self,
        from: u64,
        f: &mut dyn FnMut(Record) -> bool,
        timeout: Duration,
    ) -> Result<u64> {
        self.receiver.pull(from, f, timeout)
    }

    /// Position the next outbound record will occupy.
    pub fn sender_position(&self) -> u64 {
        self.sender.position()
    }

    /// Current inbound read cursor.
    pub fn receiver_position(&self) -> u64 {
        self.receiver.position()
    }

    /// Skip all currently pending inbound records, so a freshly attached
    /// side does not replay history.
    pub fn seek_to_end(&self) -> u64 {
        self.receiver.seek_to_end()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_stream_info_defaults() {
        let info = StreamInfo::new();
        assert_eq!(info.id, -1);
        assert_eq!(info.sent_seqno, -1);
        assert_eq!(info.received_seqno, -1);
        assert_eq!(info.sent_pos, 0);

        let info = StreamInfo::with_id(42);
        assert_eq!(info.id, 42);
        assert_eq!(info.sent_seqno, -1);
    }

    #[test]
    fn test_provision_creates_private_directory() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("gw");
        provision_base_path(&base).unwrap();

        let mode = fs::symlink_metadata(&base).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        // second run validates instead of recreating
        provision_base_path(&base).unwrap();
    }

    #[test]
    fn test_provision_rejects_non_directory() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("occupied");
        fs::write(&base, b"not a directory").unwrap();

        let err = provision_base_path(&base).unwrap_err();
        assert!(matches!(err, GatewayError::PathConflict(_)));
    }

    #[test]
    fn test_provision_rejects_open_permissions() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("open");
        fs::create_dir(&base).unwrap();
        fs::set_permissions(&base, fs::Permissions::from_mode(0o755)).unwrap();

        let err = provision_base_path(&base).unwrap_err();
        assert!(matches!(err, GatewayError::PathPermission(_)));
    }

    #[test]
    fn test_gateway_pair_is_crosswise() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("gw");
        let params = Params::default();

        let client_side = Gateway::new(&base, "0", "1", &params).unwrap();
        let server_side = Gateway::new(&base, "1", "0", &params).unwrap();

        client_side.send(&[Bytes::from_static(b"ping")]).unwrap();
        assert_eq!(client_side.sender_position(), 4);

        let mut seen = Vec::new();
        server_side
            .pull(
                0,
                &mut |record| {
                    seen.push(record.data.clone());
                    true
                },
                Duration::from_millis(10),
            )
            .unwrap();
        assert_eq!(seen, vec![Bytes::from_static(b"ping")]);
    }
}
