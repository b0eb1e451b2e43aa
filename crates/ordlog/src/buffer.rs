use dashmap::DashMap;
use proto_nezha::{OrderKey, RequestBody};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Pre-release holding area for requests whose deadline has not passed the
/// release horizon yet, ordered by `(deadline, reqKey)`.
///
/// The processor is the buffer's only user; it is not shared across
/// threads.
#[derive(Default)]
pub struct EarlyBuffer {
    map: BTreeMap<OrderKey, RequestBody>,
}

impl EarlyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `body` unless its order key is already buffered.
    pub fn insert(&mut self, body: RequestBody) -> bool {
        match self.map.entry(body.order_key()) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(body);
                true
            }
        }
    }

    /// Drain every request with `deadline <= horizon`, in ascending order
    /// key order. All such requests are releasable: any request that could
    /// still arrive with an earlier key would have to beat the receive-side
    /// one-way-delay bound.
    pub fn release_through(&mut self, horizon: u64) -> Vec<RequestBody> {
        let not_yet = self.map.split_off(&(horizon + 1, 0));
        let released = std::mem::replace(&mut self.map, not_yet);
        released.into_values().collect()
    }

    /// Drain everything, regardless of horizon. Used when resetting worker
    /// context on a view change.
    pub fn drain_all(&mut self) -> Vec<RequestBody> {
        std::mem::take(&mut self.map).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Requests that arrived after their deadline and therefore missed the
/// early-buffer release path (followers only). Kept by ascending insertion
/// id and indexed by `reqKey` so index sync can locate them.
pub struct LateBuffer {
    entries: DashMap<u32, RequestBody>,
    req2id: DashMap<u64, u32>,
    max_id: AtomicU32,
}

impl LateBuffer {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            req2id: DashMap::new(),
            max_id: AtomicU32::new(0),
        }
    }

    /// Buffer `body`, returning its insertion id, or `None` when the
    /// request is already buffered.
    pub fn insert(&self, body: RequestBody) -> Option<u32> {
        if self.req2id.contains_key(&body.req_key) {
            return None;
        }
        let id = self.max_id.fetch_add(1, Ordering::AcqRel) + 1;
        self.req2id.insert(body.req_key, id);
        self.entries.insert(id, body);
        Some(id)
    }

    pub fn contains_req(&self, req_key: u64) -> bool {
        self.req2id.contains_key(&req_key)
    }

    /// Remove and return the request holding `req_key`.
    pub fn take_req(&self, req_key: u64) -> Option<RequestBody> {
        let (_, id) = self.req2id.remove(&req_key)?;
        self.entries.remove(&id).map(|(_, body)| body)
    }

    pub fn max_buffer_id(&self) -> u32 {
        self.max_id.load(Ordering::Acquire)
    }

    /// Drop every buffered request with insertion id at or below `through`.
    pub fn reclaim_through(&self, through: u32) {
        self.entries.retain(|id, body| {
            if *id <= through {
                self.req2id.remove(&body.req_key);
                false
            } else {
                true
            }
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LateBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn rb(deadline: u64, req_key: u64) -> RequestBody {
        RequestBody {
            deadline,
            req_key,
            op_key: 0,
            proxy_id: 0,
            command: Bytes::new(),
        }
    }

    #[test]
    fn early_buffer_releases_in_order_up_to_horizon() {
        let mut buf = EarlyBuffer::new();
        assert!(buf.insert(rb(100, 1)));
        assert!(buf.insert(rb(99, 9)));
        assert!(buf.insert(rb(100, 2)));
        assert!(buf.insert(rb(150, 3)));
        assert!(!buf.insert(rb(100, 1)));

        let released = buf.release_through(100);
        let keys: Vec<_> = released.iter().map(|r| r.order_key()).collect();
        assert_eq!(keys, vec![(99, 9), (100, 1), (100, 2)]);
        assert_eq!(buf.len(), 1);

        assert!(buf.release_through(149).is_empty());
        assert_eq!(buf.release_through(150).len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn late_buffer_is_keyed_both_ways() {
        let late = LateBuffer::new();
        assert_eq!(late.insert(rb(10, 7)), Some(1));
        assert_eq!(late.insert(rb(11, 8)), Some(2));
        assert_eq!(late.insert(rb(12, 7)), None);

        assert!(late.contains_req(7));
        let taken = late.take_req(7).unwrap();
        assert_eq!(taken.deadline, 10);
        assert!(!late.contains_req(7));
        assert!(late.take_req(7).is_none());
    }

    #[test]
    fn late_buffer_reclaims_by_insertion_id() {
        let late = LateBuffer::new();
        for k in 1..=4u64 {
            late.insert(rb(k, k));
        }
        late.reclaim_through(3);

        assert_eq!(late.len(), 1);
        assert!(!late.contains_req(2));
        assert!(late.contains_req(4));
        // Insertion ids keep growing after a reclaim.
        assert_eq!(late.insert(rb(5, 5)), Some(5));
    }
}
