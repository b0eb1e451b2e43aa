use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Position of a request in the canonical order: strict lexicographic
/// `(deadline, reqKey)`. Deadlines alone cannot order requests because
/// clients may pick the same deadline; `reqKey` is globally unique and
/// breaks the tie identically on every replica.
pub type OrderKey = (u64, u64);

/// One client request as replicas buffer and order it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBody {
    /// Absolute release deadline, microseconds since the epoch.
    pub deadline: u64,
    /// Globally unique key of this logical request. Retries reuse it.
    pub req_key: u64,
    /// Application key partitioning the keyspace for commutativity:
    /// requests with distinct `op_key` are order-independent.
    pub op_key: u32,
    /// Identifies the proxy to route the reply through.
    pub proxy_id: u64,
    /// Opaque command for the application state machine.
    pub command: Bytes,
}

impl RequestBody {
    pub fn order_key(&self) -> OrderKey {
        (self.deadline, self.req_key)
    }

    pub fn precedes(&self, other: &RequestBody) -> bool {
        self.order_key() < other.order_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn deadline_orders_first() {
        assert!(rb(99, 9).precedes(&rb(100, 1)));
        assert!(!rb(100, 1).precedes(&rb(99, 9)));
    }

    #[test]
    fn req_key_breaks_deadline_ties() {
        assert!(rb(100, 1).precedes(&rb(100, 2)));
        assert!(!rb(100, 2).precedes(&rb(100, 1)));
        assert!(!rb(100, 1).precedes(&rb(100, 1)));
    }
}
