use crate::{Digest, ReplicaId, RequestBody};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Header carried by every replica-to-replica message.
///
/// `cv` is the sender's full crash vector at the time of sending, and
/// `cv_version`/`cv_hash` name the version it was signed under so receivers
/// can validate against their own versioned store even after the sender has
/// moved on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHeader {
    pub sender: ReplicaId,
    pub view: u32,
    pub cv_version: u32,
    pub cv_hash: Digest,
    pub cv: Vec<u32>,
}

/// Descriptor of a synced-log prefix: its last log id and the accumulative
/// hash at that id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTail {
    pub end: u32,
    pub chained: Digest,
}

/// Inclusive log-id range of a follower's unsynced region. Empty when
/// `end < begin`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsyncedRange {
    pub begin: u32,
    pub end: u32,
}

impl UnsyncedRange {
    pub const EMPTY: UnsyncedRange = UnsyncedRange { begin: 1, end: 0 };

    pub fn is_empty(&self) -> bool {
        self.end < self.begin
    }
}

/// Metadata of one synced entry, broadcast by the leader's index stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub log_id: u32,
    pub deadline: u64,
    pub req_key: u64,
    pub op_key: u32,
    pub my_hash: Digest,
    pub chained: Digest,
}

/// Leader broadcast of the synced entries `from..=to`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSync {
    pub hdr: PeerHeader,
    pub from: u32,
    pub to: u32,
    pub records: Vec<IndexRecord>,
}

/// Follower back-fill request for the index records `from..=to`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskMissedIndex {
    pub hdr: PeerHeader,
    pub from: u32,
    pub to: u32,
}

/// Follower back-fill request for full request bodies it has index records
/// for but never received from a proxy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskMissedReq {
    pub hdr: PeerHeader,
    pub req_keys: Vec<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissedReqAck {
    pub hdr: PeerHeader,
    pub requests: Vec<RequestBody>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangeRequest {
    pub hdr: PeerHeader,
    pub view: u32,
}

/// A participant's report to the prospective leader of `view`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChange {
    pub hdr: PeerHeader,
    pub view: u32,
    pub last_normal_view: u32,
    pub synced_tail: LogTail,
    pub unsynced_tail: UnsyncedRange,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartView {
    pub hdr: PeerHeader,
    pub view: u32,
    pub synced_tail: LogTail,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateTransferKind {
    Synced,
    Unsynced,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransferRequest {
    pub hdr: PeerHeader,
    pub kind: StateTransferKind,
    pub from: u32,
    pub to: u32,
}

/// Transferred request bodies. For `Synced` transfers the bodies occupy the
/// consecutive log ids starting at `from`; receivers recompute hashes and
/// cross-check against the tail they adopted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransferReply {
    pub hdr: PeerHeader,
    pub kind: StateTransferKind,
    pub from: u32,
    pub requests: Vec<RequestBody>,
}

/// First phase of recovery. Carries no crash vector: the recovering replica
/// lost its own and is asking the peer set to reconstruct one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashVectorRequest {
    pub sender: ReplicaId,
    pub nonce: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashVectorReply {
    pub sender: ReplicaId,
    pub nonce: u64,
    pub cv: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRequest {
    pub sender: ReplicaId,
    pub nonce: u64,
    pub cv: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReply {
    pub sender: ReplicaId,
    pub nonce: u64,
    pub view: u32,
    pub synced_tail: LogTail,
    pub committed_log_id: u32,
}

/// Follower's periodic digest of its synced prefix.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatusReport {
    pub hdr: PeerHeader,
    pub synced_tail: LogTail,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInstruction {
    pub hdr: PeerHeader,
    pub committed_log_id: u32,
}

/// Every replica-to-replica message, for transport dispatch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    IndexSync(IndexSync),
    AskMissedIndex(AskMissedIndex),
    AskMissedReq(AskMissedReq),
    MissedReqAck(MissedReqAck),
    ViewChangeRequest(ViewChangeRequest),
    ViewChange(ViewChange),
    StartView(StartView),
    StateTransferRequest(StateTransferRequest),
    StateTransferReply(StateTransferReply),
    CrashVectorRequest(CrashVectorRequest),
    CrashVectorReply(CrashVectorReply),
    RecoveryRequest(RecoveryRequest),
    RecoveryReply(RecoveryReply),
    SyncStatusReport(SyncStatusReport),
    CommitInstruction(CommitInstruction),
}

/// Leader fast reply: the client fast-commits on a super-majority of
/// matching `(hash, cv_hash)` pairs. `hash` is the accumulative hash of the
/// leader's prefix through `log_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastReply {
    pub sender: ReplicaId,
    pub view: u32,
    pub log_id: u32,
    pub hash: Digest,
    pub cv_hash: Digest,
    /// Execution result; present on the leader, absent on followers whose
    /// fast replies carry only the per-entry hash for divergence detection.
    pub result: Option<Bytes>,
    /// Current one-way-delay estimate for the request's proxy, for deadline
    /// tuning on the client side.
    pub owd_us: Option<u32>,
}

/// Follower slow reply, produced once index sync promotes the entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlowReply {
    pub sender: ReplicaId,
    pub view: u32,
    pub log_id: u32,
    pub hash: Digest,
    pub owd_us: Option<u32>,
}

/// Every replica-to-proxy message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyMessage {
    Fast(FastReply),
    Slow(SlowReply),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsynced_range_emptiness() {
        assert!(UnsyncedRange::EMPTY.is_empty());
        assert!(!UnsyncedRange { begin: 3, end: 3 }.is_empty());
        assert!(UnsyncedRange { begin: 4, end: 3 }.is_empty());
    }

    #[test]
    fn peer_message_round_trips_through_json() {
        let msg = PeerMessage::CommitInstruction(CommitInstruction {
            hdr: PeerHeader {
                sender: 1,
                view: 3,
                cv_version: 2,
                cv_hash: Digest::of_counts(&[1, 0, 0]),
                cv: vec![1, 0, 0],
            },
            committed_log_id: 17,
        });

        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: PeerMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }
}
