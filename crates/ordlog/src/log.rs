use crate::{entry::LogEntry, Error, Result, NO_NEXT, NO_PREV};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use proto_nezha::{Digest, LogTail, OrderKey, RequestBody, UnsyncedRange};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// The appended tail: the order key of the last appended entry and the
// accumulative digest through it. Cached outside the entry map so appends
// and tail reads keep working after garbage collection reclaims the entry
// itself. The lock is only ever contended by the single writer and
// occasional tail readers.
struct Tip {
    key: OrderKey,
    chained: Digest,
}

/// One replica log: entries keyed by monotonically increasing log id
/// (starting at 1), an inverse `reqKey -> logId` index for O(1) duplicate
/// detection, and per-opKey watermarks for the commutativity chain.
///
/// A `Log` has exactly one appending writer at a time; concurrent readers
/// observe a published snapshot through `max_log_id` (stored last with
/// release ordering).
pub struct Log {
    entries: DashMap<u32, Arc<LogEntry>>,
    req2id: DashMap<u64, u32>,
    /// Highest appended log id; 0 while empty.
    max_id: AtomicU32,
    /// Ids at or below this are reclaimed (or were never appended).
    min_id: AtomicU32,
    /// Largest live log id per op key; 0 while none.
    by_key_max: Vec<AtomicU32>,
    /// Smallest live log id per op key; 0 while none.
    by_key_min: Vec<AtomicU32>,
    tip: Mutex<Tip>,
}

impl Log {
    pub fn new(key_num: u32) -> Self {
        Self {
            entries: DashMap::new(),
            req2id: DashMap::new(),
            max_id: AtomicU32::new(0),
            min_id: AtomicU32::new(0),
            by_key_max: (0..key_num).map(|_| AtomicU32::new(0)).collect(),
            by_key_min: (0..key_num).map(|_| AtomicU32::new(0)).collect(),
            tip: Mutex::new(Tip {
                key: (0, 0),
                chained: Digest::ZERO,
            }),
        }
    }

    pub fn key_num(&self) -> u32 {
        self.by_key_max.len() as u32
    }

    pub fn max_log_id(&self) -> u32 {
        self.max_id.load(Ordering::Acquire)
    }

    pub fn min_log_id(&self) -> u32 {
        self.min_id.load(Ordering::Acquire)
    }

    pub fn max_log_id_of_key(&self, op_key: u32) -> u32 {
        self.by_key_max[op_key as usize].load(Ordering::Acquire)
    }

    pub fn min_log_id_of_key(&self, op_key: u32) -> u32 {
        self.by_key_min[op_key as usize].load(Ordering::Acquire)
    }

    /// Order key of the last appended entry, `(0, 0)` while empty.
    pub fn last_order_key(&self) -> OrderKey {
        self.tip.lock().key
    }

    /// The log id range a follower still holds unsynced.
    pub fn live_range(&self) -> UnsyncedRange {
        UnsyncedRange {
            begin: self.min_log_id() + 1,
            end: self.max_log_id(),
        }
    }

    /// Tail descriptor: last log id and the accumulative digest through it.
    pub fn tail(&self) -> LogTail {
        // Lock before reading max_id so the pair is consistent with appends.
        let tip = self.tip.lock();
        LogTail {
            end: self.max_id.load(Ordering::Acquire),
            chained: tip.chained,
        }
    }

    pub fn get(&self, log_id: u32) -> Option<Arc<LogEntry>> {
        self.entries.get(&log_id).map(|e| e.value().clone())
    }

    pub fn get_by_req(&self, req_key: u64) -> Option<Arc<LogEntry>> {
        let id = *self.req2id.get(&req_key)?;
        self.get(id)
    }

    pub fn log_id_of_req(&self, req_key: u64) -> Option<u32> {
        self.req2id.get(&req_key).map(|id| *id)
    }

    pub fn contains_req(&self, req_key: u64) -> bool {
        self.req2id.contains_key(&req_key)
    }

    /// Live entries with ids in `from..=to`, ascending. Reclaimed or
    /// never-appended ids are skipped.
    pub fn collect_range(&self, from: u32, to: u32) -> Vec<Arc<LogEntry>> {
        (from..=to).filter_map(|id| self.get(id)).collect()
    }

    /// Append `body` at the next log id, extending the global and per-key
    /// hash chains. The caller is the log's single writer.
    pub fn append(&self, body: RequestBody, result: Bytes) -> Result<Arc<LogEntry>> {
        let key_num = self.key_num();
        if body.op_key >= key_num {
            return Err(Error::UnknownOpKey {
                op_key: body.op_key,
                key_num,
            });
        }
        if self.req2id.contains_key(&body.req_key) {
            return Err(Error::DuplicateRequest {
                req_key: body.req_key,
            });
        }

        let mut tip = self.tip.lock();
        if body.order_key() <= tip.key && self.max_id.load(Ordering::Acquire) > 0 {
            return Err(Error::OutOfOrder {
                deadline: body.deadline,
                req_key: body.req_key,
                tail_deadline: tip.key.0,
                tail_req_key: tip.key.1,
            });
        }

        let log_id = self.max_id.load(Ordering::Acquire) + 1;
        let op_key = body.op_key as usize;
        let my_hash = Digest::of_request(body.deadline, body.req_key);
        let chained = tip.chained.combined(&my_hash);

        // Link the op-key chain. A reclaimed predecessor restarts the
        // per-key digest; the per-key chain is an optimization hook, not
        // part of the agreed prefix proof.
        let prev_id = self.by_key_max[op_key].load(Ordering::Acquire);
        let (prev_id, chained_by_key) = match self.entries.get(&prev_id) {
            Some(prev) => {
                let chained_by_key = prev.chained_by_key.combined(&my_hash);
                (prev_id, chained_by_key)
            }
            None => (NO_PREV, my_hash),
        };

        let req_key = body.req_key;
        let entry = Arc::new(LogEntry::new(
            log_id, body, my_hash, chained, chained_by_key, prev_id, result,
        ));

        if prev_id != NO_PREV {
            if let Some(prev) = self.entries.get(&prev_id) {
                prev.set_next_by_key(log_id);
            }
        }

        self.entries.insert(log_id, entry.clone());
        self.req2id.insert(req_key, log_id);
        self.by_key_max[op_key].store(log_id, Ordering::Release);
        if self.by_key_min[op_key].load(Ordering::Acquire) == 0 {
            self.by_key_min[op_key].store(log_id, Ordering::Release);
        }

        tip.key = entry.body.order_key();
        tip.chained = chained;

        // Published last, inside the tip lock: a reader observing the new
        // max id sees the fully-inserted entry, and tail() never reads a
        // torn (end, chained) pair.
        self.max_id.store(log_id, Ordering::Release);
        drop(tip);
        Ok(entry)
    }

    /// Remove the entry holding `req_key`, unlinking it from its op-key
    /// chain. Used when index sync promotes an unsynced entry. The tail
    /// order key is left untouched so later releases still observe the
    /// release high-water mark.
    pub fn take(&self, req_key: u64) -> Option<Arc<LogEntry>> {
        let (_, log_id) = self.req2id.remove(&req_key)?;
        let (_, entry) = self.entries.remove(&log_id)?;
        self.unlink(&entry);
        Some(entry)
    }

    fn unlink(&self, entry: &Arc<LogEntry>) {
        let log_id = entry.log_id;
        let op_key = entry.body.op_key as usize;
        let prev = entry.prev_by_key();
        let next = entry.next_by_key();

        if prev != NO_PREV {
            if let Some(p) = self.entries.get(&prev) {
                p.set_next_by_key(next);
            }
        }
        if next != NO_NEXT {
            if let Some(n) = self.entries.get(&next) {
                n.set_prev_by_key(if self.entries.contains_key(&prev) {
                    prev
                } else {
                    NO_PREV
                });
            }
        }

        if self.by_key_max[op_key].load(Ordering::Acquire) == log_id {
            let fallback = if prev != NO_PREV && self.entries.contains_key(&prev) {
                prev
            } else {
                0
            };
            self.by_key_max[op_key].store(fallback, Ordering::Release);
        }
        if self.by_key_min[op_key].load(Ordering::Acquire) == log_id {
            let fallback = if next != NO_NEXT && self.entries.contains_key(&next) {
                next
            } else {
                0
            };
            self.by_key_min[op_key].store(fallback, Ordering::Release);
        }
    }

    /// Advance the reclaim floor without removing entries. Index sync uses
    /// this to publish how far promotion has consumed the unsynced region.
    pub fn advance_min(&self, through: u32) {
        let mut cur = self.min_id.load(Ordering::Acquire);
        while cur < through {
            match self.min_id.compare_exchange(
                cur,
                through,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(now) => cur = now,
            }
        }
    }

    /// Reclaim every entry with id at or below `through`, patching per-key
    /// links so surviving entries never point into the reclaimed range.
    pub fn reclaim_through(&self, through: u32) {
        let through = through.min(self.max_log_id());
        let floor = self.min_log_id();

        for id in (floor + 1)..=through {
            if let Some((_, entry)) = self.entries.remove(&id) {
                self.req2id.remove(&entry.body.req_key);
                self.unlink(&entry);
            }
        }
        self.advance_min(through);
        tracing::trace!(floor, through, "reclaimed log prefix");
    }

    /// Clear the log entirely, including the reclaim floor and the cached
    /// tail. Only valid while workers are quiesced: a follower resets its
    /// unsynced log when it enters a new view.
    pub fn reset(&self) {
        self.entries.clear();
        self.req2id.clear();
        for watermark in self.by_key_max.iter().chain(self.by_key_min.iter()) {
            watermark.store(0, Ordering::Release);
        }
        let mut tip = self.tip.lock();
        tip.key = (0, 0);
        tip.chained = Digest::ZERO;
        self.max_id.store(0, Ordering::Release);
        self.min_id.store(0, Ordering::Release);
        drop(tip);
    }

    /// Rewind the log so `point` is the last entry, dropping everything
    /// after it. Used before adopting a transferred prefix whose tail
    /// disagrees with ours.
    pub fn truncate_to(&self, point: u32) -> LogTail {
        let max = self.max_log_id();
        if max > point {
            tracing::debug!(from = max, to = point, "rewinding log tail");
        }
        for id in ((point + 1)..=max).rev() {
            if let Some((_, entry)) = self.entries.remove(&id) {
                self.req2id.remove(&entry.body.req_key);
                self.unlink(&entry);
            }
        }

        let mut tip = self.tip.lock();
        let mut new_tail = point;
        loop {
            if new_tail == 0 {
                tip.key = (0, 0);
                tip.chained = Digest::ZERO;
                break;
            }
            if let Some(entry) = self.entries.get(&new_tail) {
                tip.key = entry.body.order_key();
                tip.chained = entry.chained;
                break;
            }
            new_tail -= 1;
        }
        let tail = LogTail {
            end: point,
            chained: tip.chained,
        };
        self.max_id.store(point, Ordering::Release);
        drop(tip);
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rb(deadline: u64, req_key: u64, op_key: u32) -> RequestBody {
        RequestBody {
            deadline,
            req_key,
            op_key,
            proxy_id: 1,
            command: Bytes::from_static(b"cmd"),
        }
    }

    #[test]
    fn append_assigns_consecutive_ids_and_chains_hashes() {
        let log = Log::new(2);

        let c = log.append(rb(99, 9, 0), Bytes::new()).unwrap();
        let a = log.append(rb(100, 1, 0), Bytes::new()).unwrap();
        let b = log.append(rb(100, 2, 1), Bytes::new()).unwrap();

        assert_eq!((c.log_id, a.log_id, b.log_id), (1, 2, 3));

        let expect = Digest::of_request(99, 9)
            .combined(&Digest::of_request(100, 1))
            .combined(&Digest::of_request(100, 2));
        assert_eq!(log.tail(), LogTail { end: 3, chained: expect });

        // Op-key chain for key 0: C -> A.
        assert_eq!(c.next_by_key(), 2);
        assert_eq!(a.prev_by_key(), 1);
        assert_eq!(a.next_by_key(), NO_NEXT);
        assert_eq!(b.prev_by_key(), NO_PREV);
        assert_eq!(log.max_log_id_of_key(0), 2);
        assert_eq!(log.max_log_id_of_key(1), 3);
    }

    #[test]
    fn append_rejects_duplicates_and_inversions() {
        let log = Log::new(1);
        log.append(rb(100, 5, 0), Bytes::new()).unwrap();

        assert!(matches!(
            log.append(rb(200, 5, 0), Bytes::new()),
            Err(Error::DuplicateRequest { req_key: 5 })
        ));
        assert!(matches!(
            log.append(rb(99, 6, 0), Bytes::new()),
            Err(Error::OutOfOrder { .. })
        ));
        assert!(matches!(
            log.append(rb(100, 4, 0), Bytes::new()),
            Err(Error::OutOfOrder { .. })
        ));
        assert!(matches!(
            log.append(rb(101, 7, 9), Bytes::new()),
            Err(Error::UnknownOpKey { op_key: 9, .. })
        ));
        assert_eq!(log.max_log_id(), 1);
    }

    #[test]
    fn take_unlinks_the_op_key_chain() {
        let log = Log::new(1);
        let a = log.append(rb(1, 1, 0), Bytes::new()).unwrap();
        let b = log.append(rb(2, 2, 0), Bytes::new()).unwrap();
        let c = log.append(rb(3, 3, 0), Bytes::new()).unwrap();

        let taken = log.take(2).unwrap();
        assert_eq!(taken.log_id, b.log_id);
        assert!(!log.contains_req(2));
        assert_eq!(a.next_by_key(), c.log_id);
        assert_eq!(c.prev_by_key(), a.log_id);

        // Taking the chain tail falls the per-key watermark back.
        log.take(3).unwrap();
        assert_eq!(log.max_log_id_of_key(0), a.log_id);
        assert_eq!(a.next_by_key(), NO_NEXT);
    }

    #[test]
    fn reclaim_drops_prefix_and_patches_links() {
        let log = Log::new(1);
        for i in 1..=5u64 {
            log.append(rb(i, i, 0), Bytes::new()).unwrap();
        }

        log.reclaim_through(3);

        assert_eq!(log.min_log_id(), 3);
        assert!(log.get(3).is_none());
        assert!(!log.contains_req(2));
        let four = log.get(4).unwrap();
        assert_eq!(four.prev_by_key(), NO_PREV);
        assert_eq!(log.min_log_id_of_key(0), 4);

        // Appending still works against the cached tip.
        let six = log.append(rb(6, 6, 0), Bytes::new()).unwrap();
        assert_eq!(six.log_id, 6);
        assert_eq!(six.prev_by_key(), 5);
    }

    #[test]
    fn truncate_rewinds_tail_and_reopens_ids() {
        let log = Log::new(2);
        for i in 1..=4u64 {
            log.append(rb(i * 10, i, (i % 2) as u32), Bytes::new()).unwrap();
        }
        let tail_at_2 = log.collect_range(2, 2)[0].chained;

        let tail = log.truncate_to(2);
        assert_eq!(tail, LogTail { end: 2, chained: tail_at_2 });
        assert_eq!(log.max_log_id(), 2);
        assert!(!log.contains_req(3));
        assert!(!log.contains_req(4));

        // Ids 3.. are reassigned to fresh appends, in whatever order the
        // adopted prefix dictates.
        let e = log.append(rb(25, 9, 0), Bytes::new()).unwrap();
        assert_eq!(e.log_id, 3);
    }

    #[test]
    fn truncate_to_zero_resets_the_chain() {
        let log = Log::new(1);
        log.append(rb(10, 1, 0), Bytes::new()).unwrap();
        log.append(rb(20, 2, 0), Bytes::new()).unwrap();

        let tail = log.truncate_to(0);
        assert_eq!(tail, LogTail { end: 0, chained: Digest::ZERO });
        assert_eq!(log.last_order_key(), (0, 0));

        let e = log.append(rb(5, 3, 0), Bytes::new()).unwrap();
        assert_eq!(e.log_id, 1);
        assert_eq!(e.chained, Digest::of_request(5, 3));
    }
}
