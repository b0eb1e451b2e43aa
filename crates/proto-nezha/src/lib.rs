//! Typed schema of the Nezha replica protocol.
//!
//! These types define *what* goes over the wire; the concrete codec and the
//! UDP endpoints that carry it live outside this workspace. Everything here
//! is a plain serde-serializable value so a schema-driven codec can map it.

mod digest;
mod message;
mod request;

pub use digest::Digest;
pub use message::{
    AskMissedIndex, AskMissedReq, CommitInstruction, CrashVectorRequest, CrashVectorReply,
    FastReply, IndexRecord, IndexSync, LogTail, MissedReqAck, PeerHeader, PeerMessage,
    RecoveryReply, RecoveryRequest, ReplyMessage, SlowReply, StartView, StateTransferKind,
    StateTransferReply, StateTransferRequest, SyncStatusReport, UnsyncedRange, ViewChange,
    ViewChangeRequest,
};
pub use request::{OrderKey, RequestBody};

/// Identifies one replica of the statically configured peer set.
pub type ReplicaId = u32;

/// The leader of `view` within a peer set of `n` replicas.
pub fn leader_of(view: u32, n: usize) -> ReplicaId {
    view % n as u32
}

/// Smallest number of replicas whose agreement survives any minority of
/// crash failures: `ceil((n + 1) / 2)`.
pub fn super_majority(n: usize) -> usize {
    n / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leader_rotates_with_view() {
        assert_eq!(leader_of(0, 3), 0);
        assert_eq!(leader_of(1, 3), 1);
        assert_eq!(leader_of(5, 3), 2);
    }

    #[test]
    fn super_majority_sizes() {
        assert_eq!(super_majority(3), 2);
        assert_eq!(super_majority(4), 3);
        assert_eq!(super_majority(5), 3);
    }
}
