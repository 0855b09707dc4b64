//! In-process channel backed by an append-only record log.
//!
//! Channels live in a process-wide registry keyed by path, so a client
//! gateway and a server gateway constructed over the same base path are wired
//! to the same channel pair without either side owning it. Records persist in
//! the log for the life of the process; pulls are position-addressed replays,
//! not consuming reads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::error::Result;

use super::{Params, Publisher, Record, Subscriber};

// =============================================================================
// Channel core
// =============================================================================

struct Log {
    records: Vec<Record>,
    next_position: u64,
}

struct ChannelCore {
    log: Mutex<Log>,
    available: Condvar,
}

impl ChannelCore {
    fn new(params: &Params) -> Self {
        Self {
            log: Mutex::new(Log {
                records: Vec::with_capacity(params.capacity_hint),
                next_position: 0,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, segments: &[Bytes]) {
        let total = segments.iter().map(Bytes::len).sum();
        let mut data = BytesMut::with_capacity(total);
        for s in segments {
            data.extend_from_slice(s);
        }
        let data = data.freeze();

        let mut log = self.lock();
        let record = Record {
            position: log.next_position,
            data,
        };
        log.next_position = record.next_position();
        log.records.push(record);
        self.available.notify_all();
    }

    fn end_position(&self) -> u64 {
        self.lock().next_position
    }

    fn pull(&self, mut from: u64, f: &mut dyn FnMut(Record) -> bool, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut log = self.lock();
        loop {
            let start = log.records.partition_point(|r| r.position < from);
            if start < log.records.len() {
                // deliver outside the lock so the callback can push replies
                let pending: Vec<Record> = log.records[start..].to_vec();
                drop(log);
                for record in pending {
                    from = record.next_position();
                    if !f(record) {
                        return from;
                    }
                }
                log = self.lock();
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return from;
            }
            let (guard, _) = self
                .available
                .wait_timeout(log, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            log = guard;
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

fn registry() -> &'static Mutex<HashMap<PathBuf, Arc<ChannelCore>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Arc<ChannelCore>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn open_core(path: &Path, params: &Params) -> Arc<ChannelCore> {
    let mut channels = registry().lock().unwrap_or_else(|e| e.into_inner());
    channels
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(ChannelCore::new(params)))
        .clone()
}

// =============================================================================
// Channel ends
// =============================================================================

pub struct MemoryPublisher {
    core: Arc<ChannelCore>,
}

impl Publisher for MemoryPublisher {
    fn push(&self, segments: &[Bytes]) -> Result<()> {
        self.core.push(segments);
        Ok(())
    }

    fn position(&self) -> u64 {
        self.core.end_position()
    }
}

pub struct MemorySubscriber {
    core: Arc<ChannelCore>,
    cursor: AtomicU64,
}

impl Subscriber for MemorySubscriber {
    fn pull(&self, from: u64, f: &mut dyn FnMut(Record) -> bool, timeout: Duration) -> Result<u64> {
        let next = self.core.pull(from, f, timeout);
        self.cursor.store(next, Ordering::Release);
        Ok(next)
    }

    fn position(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    fn seek_to_end(&self) -> u64 {
        let end = self.core.end_position();
        self.cursor.store(end, Ordering::Release);
        end
    }
}

/// Open the writing end of the channel at `path`, creating the channel on
/// first open.
pub fn open_publisher(path: &Path, params: &Params) -> MemoryPublisher {
    MemoryPublisher {
        core: open_core(path, params),
    }
}

/// Open a reading end of the channel at `path`, creating the channel on
/// first open. The cursor starts at position zero.
pub fn open_subscriber(path: &Path, params: &Params) -> MemorySubscriber {
    MemorySubscriber {
        core: open_core(path, params),
        cursor: AtomicU64::new(0),
    }
}

// =============================================================================
// Tests
// =============================================================================
