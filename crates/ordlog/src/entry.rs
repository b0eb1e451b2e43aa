use bytes::Bytes;
use proto_nezha::{Digest, RequestBody};
use std::sync::atomic::{AtomicU32, Ordering};

/// Sentinel for "no earlier entry shares this op key".
pub const NO_PREV: u32 = 0;
/// Sentinel for "no later entry shares this op key (yet)".
pub const NO_NEXT: u32 = u32::MAX;

/// One ordered entry of a replica log.
///
/// Entries are shared as `Arc<LogEntry>` between the releasing writer and
/// the reply, index, and garbage-collection workers. All fields except the
/// per-key links are immutable after construction; the links are atomics
/// because a later append (or an unsynced-log unlink) patches its
/// neighbors in place.
#[derive(Debug)]
pub struct LogEntry {
    pub log_id: u32,
    pub body: RequestBody,
    /// Digest of this entry's `(deadline, reqKey)` position.
    pub my_hash: Digest,
    /// Accumulative digest of the log through this entry.
    pub chained: Digest,
    /// Accumulative digest of this entry's op-key chain through this entry.
    pub chained_by_key: Digest,
    /// Execution result. Empty until the entry has been executed (followers
    /// execute at promotion time and re-create the entry).
    pub result: Bytes,

    prev_by_key: AtomicU32,
    next_by_key: AtomicU32,
}

impl LogEntry {
    pub(crate) fn new(
        log_id: u32,
        body: RequestBody,
        my_hash: Digest,
        chained: Digest,
        chained_by_key: Digest,
        prev_by_key: u32,
        result: Bytes,
    ) -> Self {
        Self {
            log_id,
            body,
            my_hash,
            chained,
            chained_by_key,
            result,
            prev_by_key: AtomicU32::new(prev_by_key),
            next_by_key: AtomicU32::new(NO_NEXT),
        }
    }

    /// Log id of the previous entry sharing this op key, or [`NO_PREV`].
    pub fn prev_by_key(&self) -> u32 {
        self.prev_by_key.load(Ordering::Acquire)
    }

    /// Log id of the next entry sharing this op key, or [`NO_NEXT`].
    pub fn next_by_key(&self) -> u32 {
        self.next_by_key.load(Ordering::Acquire)
    }

    pub(crate) fn set_prev_by_key(&self, id: u32) {
        self.prev_by_key.store(id, Ordering::Release);
    }

    pub(crate) fn set_next_by_key(&self, id: u32) {
        self.next_by_key.store(id, Ordering::Release);
    }
}
