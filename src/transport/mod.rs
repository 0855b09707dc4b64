//! Position-addressed publish/subscribe transport.
//!
//! A channel is a durable, append-only sequence of records. Every record
//! occupies an absolute, strictly increasing position; positions double as
//! durable identities, so a reader can resume from any position and a writer
//! can name "the position my next record will get" before pushing it.
//!
//! The gateway core only depends on the [`Publisher`]/[`Subscriber`] traits;
//! [`memory`] provides the in-process reference implementation. On-disk,
//! socket, or shared-memory channels belong behind the same seam.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod memory;

pub use memory::{open_publisher, open_subscriber};

/// One record delivered from a channel.
#[derive(Debug, Clone)]
pub struct Record {
    /// Absolute position of this record in its channel.
    pub position: u64,
    /// Record contents, segments already joined.
    pub data: Bytes,
}

impl Record {
    /// Position of the record that follows this one.
    pub fn next_position(&self) -> u64 {
        self.position + (self.data.len() as u64).max(1)
    }
}

/// Transport tuning knobs, passed through gateway construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Params {
    /// Capacity hint for a channel's record log.
    pub capacity_hint: usize,
    /// Upper bound of one blocking pull, in milliseconds.
    pub pull_timeout_ms: u64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            capacity_hint: 1024,
            pull_timeout_ms: 1000,
        }
    }
}

impl Params {
    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }
}

/// Writing end of a channel.
pub trait Publisher: Send {
    /// Append one record assembled from `segments`.
    fn push(&self, segments: &[Bytes]) -> Result<()>;

    /// Position the next record will occupy.
    fn position(&self) -> u64;
}

/// Reading end of a channel. Carries its own read cursor; `pull` addresses
/// the channel by explicit position and moves the cursor along.
pub trait Subscriber: Send {
    /// Deliver records at positions `>= from` in order, one at a time.
    ///
    /// Stops early when the callback returns `false`, otherwise keeps
    /// delivering (and waiting for) records until `timeout` elapses. Returns
    /// the next unread position.
    fn pull(
        &self,
        from: u64,
        f: &mut dyn FnMut(Record) -> bool,
        timeout: Duration,
    ) -> Result<u64>;

    /// Current read cursor.
    fn position(&self) -> u64;

    /// Skip everything currently pending; returns the new read position.
    fn seek_to_end(&self) -> u64;
}
