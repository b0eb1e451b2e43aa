//! Garbage collection.
//!
//! The collector never reclaims shared state unilaterally: for each shared
//! resource it publishes a `prepare` watermark, and the workers that read
//! the resource copy it into their `safe` counter once they are past any
//! use of the range. The collector only reclaims up to the least
//! acknowledged watermark. Entries above `committedLogId` are never
//! touched.

use crate::gate::Status;
use crate::replica::Inner;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

pub(crate) struct GcCounters {
    /// Unsynced log ids proposed for reclaim, acked per fast-reply shard.
    prepare_unsynced: AtomicU32,
    safe_unsynced: Vec<AtomicU32>,
    /// Late-buffer insertion ids, acked by index-sync application.
    prepare_late: AtomicU32,
    safe_late: AtomicU32,
    /// Crash-vector versions, acked per fast-reply shard (they sign every
    /// reply with the vector in use).
    prepare_cv: AtomicU32,
    safe_cv: Vec<AtomicU32>,
}

impl GcCounters {
    pub(crate) fn new(reply_shards: usize) -> Self {
        Self {
            prepare_unsynced: AtomicU32::new(0),
            safe_unsynced: (0..reply_shards).map(|_| AtomicU32::new(0)).collect(),
            prepare_late: AtomicU32::new(0),
            safe_late: AtomicU32::new(0),
            prepare_cv: AtomicU32::new(0),
            safe_cv: (0..reply_shards).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// A fast-reply shard acknowledges the current watermarks. Called every
    /// iteration, busy or idle.
    pub(crate) fn ack_reply_shard(&self, shard: usize) {
        self.safe_unsynced[shard].store(
            self.prepare_unsynced.load(Ordering::Acquire),
            Ordering::Release,
        );
        self.safe_cv[shard].store(self.prepare_cv.load(Ordering::Acquire), Ordering::Release);
    }

    /// Index-sync application acknowledges the late-buffer watermark.
    pub(crate) fn ack_late(&self) {
        self.safe_late
            .store(self.prepare_late.load(Ordering::Acquire), Ordering::Release);
    }

    /// Zero every watermark pair. Entering a new view resets the unsynced
    /// log, whose ids restart at 1; a stale acknowledged watermark must not
    /// reclaim fresh entries. Only valid while workers are quiesced.
    pub(crate) fn reset(&self) {
        self.prepare_unsynced.store(0, Ordering::Release);
        self.prepare_late.store(0, Ordering::Release);
        self.prepare_cv.store(0, Ordering::Release);
        self.safe_late.store(0, Ordering::Release);
        for safe in self.safe_unsynced.iter().chain(self.safe_cv.iter()) {
            safe.store(0, Ordering::Release);
        }
    }

    fn min_safe_unsynced(&self) -> u32 {
        self.safe_unsynced
            .iter()
            .map(|a| a.load(Ordering::Acquire))
            .min()
            .unwrap_or(0)
    }

    fn min_safe_cv(&self) -> u32 {
        self.safe_cv
            .iter()
            .map(|a| a.load(Ordering::Acquire))
            .min()
            .unwrap_or(0)
    }
}

/// One collector cycle: sleep out the reclaim interval (in slices, so a
/// status flip is observed promptly), then advance watermarks and reclaim
/// what has been acknowledged.
pub(crate) fn step(inner: &Inner) {
    let wake = Instant::now() + inner.config.reclaim_timeout;
    while Instant::now() < wake {
        if inner.gate.status() != Status::Normal {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    if inner.gate.status() != Status::Normal {
        return;
    }

    // The synced log stays resident: with no durable storage it is the
    // only source for back-fill and recovery transfers. Reclaim covers the
    // unsynced log, the late buffer, and old crash-vector versions.
    let committed = inner
        .committed_log_id
        .load(Ordering::Acquire)
        .min(inner.synced.max_log_id());

    // Unsynced log: propose the contiguous prefix whose requests are
    // already synced at or below the commit point (or were promoted away
    // entirely), then reclaim once every reply shard has acked.
    let range = inner.unsynced.live_range();
    let mut candidate = inner.gc.prepare_unsynced.load(Ordering::Acquire);
    if !range.is_empty() {
        for id in range.begin..=range.end {
            match inner.unsynced.get(id) {
                None => candidate = candidate.max(id),
                Some(entry) => match inner.synced.log_id_of_req(entry.body.req_key) {
                    Some(synced_id) if synced_id <= committed => {
                        candidate = candidate.max(id);
                    }
                    _ => break,
                },
            }
        }
    }
    if candidate > inner.gc.prepare_unsynced.load(Ordering::Acquire) {
        inner.gc.prepare_unsynced.store(candidate, Ordering::Release);
    }
    let acked = inner.gc.min_safe_unsynced();
    if acked > inner.unsynced.min_log_id() {
        inner.unsynced.reclaim_through(acked);
        inner.unsynced.advance_min(acked);
    }

    // Late buffer: propose everything inserted so far; index-sync
    // application acks when any future record can fall back to the
    // missed-request path instead.
    let late_target = inner.late.max_buffer_id();
    if late_target > inner.gc.prepare_late.load(Ordering::Acquire) {
        inner.gc.prepare_late.store(late_target, Ordering::Release);
    }
    let late_acked = inner.gc.safe_late.load(Ordering::Acquire);
    if late_acked > 0 {
        inner.late.reclaim_through(late_acked);
    }

    // Crash vectors: only the version in use tags new messages; older
    // versions go once every signing shard has moved past them.
    let current_cv = inner.crash_vectors.current_version();
    if current_cv > 1 {
        inner
            .gc
            .prepare_cv
            .store(current_cv - 1, Ordering::Release);
    }
    let cv_acked = inner
        .gc
        .min_safe_cv()
        .min(inner.gc.prepare_cv.load(Ordering::Acquire));
    if cv_acked > inner.crash_vectors.floor() {
        inner.crash_vectors.reclaim_through(cv_acked);
        tracing::trace!(through = cv_acked, "reclaimed crash-vector versions");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reclaim_waits_for_every_shard_to_ack() {
        let gc = GcCounters::new(2);
        gc.prepare_unsynced.store(7, Ordering::Release);
        gc.prepare_cv.store(3, Ordering::Release);

        assert_eq!(gc.min_safe_unsynced(), 0);
        gc.ack_reply_shard(0);
        assert_eq!(gc.min_safe_unsynced(), 0);
        gc.ack_reply_shard(1);
        assert_eq!(gc.min_safe_unsynced(), 7);
        assert_eq!(gc.min_safe_cv(), 3);
    }

    #[test]
    fn late_buffer_ack_follows_the_prepared_watermark() {
        let gc = GcCounters::new(1);
        gc.prepare_late.store(5, Ordering::Release);
        assert_eq!(gc.safe_late.load(Ordering::Acquire), 0);
        gc.ack_late();
        assert_eq!(gc.safe_late.load(Ordering::Acquire), 5);
    }
}
