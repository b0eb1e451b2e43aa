//! The index-sync protocol.
//!
//! The leader broadcasts the metadata of newly synced entries; followers
//! apply those records in order, promoting their speculative unsynced
//! entries (or late-buffered bodies) into the synced log and emitting slow
//! replies. Gaps are buffered and back-filled with `AskMissedIndex`;
//! bodies the follower never received are fetched with `AskMissedReq`.
//!
//! Three dedicated worker threads live here: index-recv (the sole writer
//! of a follower's synced log, draining `IndexSync` and `MissedReqAck`
//! messages), missed-index-ack, and missed-req-ack (serving the back-fill
//! asks). The leader's index-send worker is the fourth.
//!
//! Lock order: handlers here take `Inner::sync` and release it before
//! calling into the master module, which may take `Inner::master` and
//! `Inner::sync` in that order.

use crate::gate::Status;
use crate::replica::{Inner, ViewCheck};
use crate::seams::TimerKind;
use proto_nezha::{
    AskMissedIndex, AskMissedReq, Digest, IndexRecord, IndexSync, MissedReqAck, PeerMessage,
    ReplicaId, RequestBody,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

/// Follower-side state of the index stream.
pub(crate) struct SyncState {
    /// Buffered out-of-order IndexSync batches, keyed by `(from, to)`.
    pending: BTreeMap<(u32, u32), Vec<IndexRecord>>,
    /// Bodies recovered through `AskMissedReq`, awaiting application.
    fetched: HashMap<u64, RequestBody>,
    /// Request keys named by index records that no local buffer holds.
    missed_req_keys: BTreeSet<u64>,
    /// Rotates back-fill targets so a dead peer cannot wedge recovery.
    ask_rr: usize,
}

impl SyncState {
    pub(crate) fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            fetched: HashMap::new(),
            missed_req_keys: BTreeSet::new(),
            ask_rr: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.pending.clear();
        self.fetched.clear();
        self.missed_req_keys.clear();
    }
}

enum ApplyOutcome {
    /// Everything applicable was applied.
    Done,
    /// Progress stopped on a gap or a missing body; back-fill is in flight.
    Blocked,
    /// The record stream contradicts our log; the view is lost.
    Diverged,
}

/// Work items of the index-recv thread. Index records and fetched bodies
/// must funnel through one queue: applying either mutates the synced log,
/// which has a single writer on followers.
pub(crate) enum IndexRecvMsg {
    Sync(IndexSync),
    ReqAck(MissedReqAck),
}

/// One cycle of the index-recv worker.
pub(crate) fn recv_step(inner: &Inner) {
    // This thread is the late buffer's only consumer; acknowledge the
    // collector's pending watermark even when the stream is idle.
    inner.gc.ack_late();
    if let Ok(msg) = inner
        .index_recv_rx
        .recv_timeout(Duration::from_millis(2))
    {
        match msg {
            IndexRecvMsg::Sync(msg) => on_index_sync(inner, msg),
            IndexRecvMsg::ReqAck(msg) => on_missed_req_ack(inner, msg),
        }
    }
}

/// One cycle of the missed-index-ack worker: answer one back-fill ask.
pub(crate) fn missed_index_ack_step(inner: &Inner) {
    if let Ok(msg) = inner
        .missed_index_rx
        .recv_timeout(Duration::from_millis(2))
    {
        on_ask_missed_index(inner, msg);
    }
}

/// One cycle of the missed-req-ack worker: answer one body ask.
pub(crate) fn missed_req_ack_step(inner: &Inner) {
    if let Ok(msg) = inner
        .missed_req_rx
        .recv_timeout(Duration::from_millis(2))
    {
        on_ask_missed_req(inner, msg);
    }
}

/// One cycle of the leader's index-send worker: broadcast the next batch of
/// synced entries, if any. Followers idle here.
pub(crate) fn send_step(inner: &Inner) {
    if !inner.am_leader() {
        std::thread::sleep(Duration::from_millis(2));
        return;
    }
    let sent = inner
        .index_sent
        .load(std::sync::atomic::Ordering::Acquire);
    let max = inner.synced.max_log_id();
    if max <= sent {
        std::thread::sleep(Duration::from_millis(1));
        return;
    }

    let to = max.min(sent + inner.config.index_transfer_batch);
    let records = records_for(inner, sent + 1, to);
    let Some(last) = records.last() else {
        std::thread::sleep(Duration::from_millis(1));
        return;
    };
    let to = last.log_id;
    inner.broadcast(PeerMessage::IndexSync(IndexSync {
        hdr: inner.header(),
        from: sent + 1,
        to,
        records,
    }));
    inner
        .index_sent
        .store(to, std::sync::atomic::Ordering::Release);
}

/// Contiguous index records for `from..=to`; stops at the first reclaimed
/// or unwritten id.
fn records_for(inner: &Inner, from: u32, to: u32) -> Vec<IndexRecord> {
    let mut records = Vec::new();
    for id in from..=to {
        let Some(entry) = inner.synced.get(id) else {
            break;
        };
        records.push(IndexRecord {
            log_id: entry.log_id,
            deadline: entry.body.deadline,
            req_key: entry.body.req_key,
            op_key: entry.body.op_key,
            my_hash: entry.my_hash,
            chained: entry.chained,
        });
    }
    records
}

fn on_index_sync(inner: &Inner, msg: IndexSync) {
    if inner.gate.status() != Status::Normal {
        return;
    }
    match inner.check_view(msg.hdr.view) {
        ViewCheck::Stale => return,
        ViewCheck::Ahead(view) => {
            crate::master::observe_higher_view(inner, view);
            return;
        }
        ViewCheck::Current => {}
    }
    if msg.hdr.sender != inner.current_leader() || inner.am_leader() {
        return;
    }
    if !inner.check_cv(&msg.hdr) {
        return;
    }
    inner.touch_heartbeat();

    let outcome = {
        let mut sync = inner.sync.lock();
        ingest(inner, &mut sync, msg)
    };
    if matches!(outcome, ApplyOutcome::Diverged) {
        crate::master::initiate_next_view(inner);
    }
}

fn ingest(inner: &Inner, sync: &mut SyncState, msg: IndexSync) -> ApplyOutcome {
    let max = inner.synced.max_log_id();
    if msg.to <= max {
        // Stale re-broadcast; pending batches may still be applicable.
        return drain_pending(inner, sync);
    }
    if msg.from > max + 1 {
        tracing::debug!(
            from = msg.from,
            to = msg.to,
            have = max,
            "index gap, buffering and asking for back-fill"
        );
        sync.pending.insert((msg.from, msg.to), msg.records);
        let target = ask_target(inner, sync);
        inner.transport.send_to_replica(
            target,
            PeerMessage::AskMissedIndex(AskMissedIndex {
                hdr: inner.header(),
                from: max + 1,
                to: msg.from - 1,
            }),
        );
        inner
            .timers
            .arm(TimerKind::IndexAsk, inner.config.periodic_sync_interval);
        return ApplyOutcome::Blocked;
    }

    match apply_records(inner, sync, msg.records) {
        ApplyOutcome::Done => drain_pending(inner, sync),
        other => other,
    }
}

/// Apply a contiguous record batch starting at or before our next log id.
fn apply_records(
    inner: &Inner,
    sync: &mut SyncState,
    records: Vec<IndexRecord>,
) -> ApplyOutcome {
    let Some(last_id) = records.last().map(|r| r.log_id) else {
        return ApplyOutcome::Done;
    };

    for (i, rec) in records.iter().enumerate() {
        let expect = inner.synced.max_log_id() + 1;
        if rec.log_id < expect {
            continue;
        }
        if rec.log_id > expect {
            // A hole inside a batch; keep the remainder for later.
            sync.pending
                .insert((rec.log_id, last_id), records[i..].to_vec());
            return ApplyOutcome::Blocked;
        }
        if Digest::of_request(rec.deadline, rec.req_key) != rec.my_hash {
            tracing::warn!(log_id = rec.log_id, "corrupt index record, dropping batch");
            return ApplyOutcome::Done;
        }

        let body = match take_body(inner, sync, rec) {
            Ok(Some(body)) => body,
            Ok(None) => {
                // Body unknown anywhere locally: stash the remainder and
                // fetch the bodies this batch still needs.
                sync.pending
                    .insert((rec.log_id, last_id), records[i..].to_vec());
                request_missed_bodies(inner, sync, &records[i..]);
                return ApplyOutcome::Blocked;
            }
            Err(()) => return ApplyOutcome::Diverged,
        };

        // Followers execute at promotion time.
        let result = inner.app.execute(&body);
        match inner.synced.append(body, result) {
            Ok(entry) => {
                if entry.log_id != rec.log_id || entry.chained != rec.chained {
                    tracing::error!(
                        log_id = rec.log_id,
                        expect = %rec.chained,
                        got = %entry.chained,
                        "accumulative hash diverged from the leader's index stream"
                    );
                    return ApplyOutcome::Diverged;
                }
                inner.enqueue_slow_reply(entry);
            }
            Err(err) => {
                tracing::error!(
                    log_id = rec.log_id,
                    error = %err,
                    "index record does not extend the synced log"
                );
                return ApplyOutcome::Diverged;
            }
        }
    }
    ApplyOutcome::Done
}

/// Locate the body an index record promotes: the unsynced log first, then
/// the late buffer, then previously fetched bodies.
///
/// `Err(())` signals divergence: our speculative entry for this req key
/// disagrees with the leader's record.
fn take_body(
    inner: &Inner,
    sync: &mut SyncState,
    rec: &IndexRecord,
) -> Result<Option<RequestBody>, ()> {
    if let Some(entry) = inner.unsynced.take(rec.req_key) {
        if entry.my_hash != rec.my_hash {
            tracing::error!(
                req_key = rec.req_key,
                "unsynced entry disagrees with the leader's index record"
            );
            return Err(());
        }
        return Ok(Some(entry.body.clone()));
    }
    if let Some(body) = inner.late.take_req(rec.req_key) {
        if Digest::of_request(body.deadline, body.req_key) == rec.my_hash {
            return Ok(Some(body));
        }
        // A stale copy from an earlier client attempt; fetch the body the
        // leader actually ordered.
        tracing::debug!(req_key = rec.req_key, "discarding stale late-buffer copy");
    }
    if let Some(body) = sync.fetched.remove(&rec.req_key) {
        if Digest::of_request(body.deadline, body.req_key) == rec.my_hash {
            return Ok(Some(body));
        }
    }
    Ok(None)
}

fn request_missed_bodies(inner: &Inner, sync: &mut SyncState, records: &[IndexRecord]) {
    let mut keys = Vec::new();
    for rec in records {
        if keys.len() >= inner.config.request_key_transfer_batch as usize {
            break;
        }
        let key = rec.req_key;
        let locally_known = inner.synced.contains_req(key)
            || inner.unsynced.contains_req(key)
            || inner.late.contains_req(key)
            || sync.fetched.contains_key(&key);
        if !locally_known {
            sync.missed_req_keys.insert(key);
            keys.push(key);
        }
    }
    if keys.is_empty() {
        return;
    }
    let target = ask_target(inner, sync);
    inner.transport.send_to_replica(
        target,
        PeerMessage::AskMissedReq(AskMissedReq {
            hdr: inner.header(),
            req_keys: keys,
        }),
    );
    inner
        .timers
        .arm(TimerKind::RequestAsk, inner.config.periodic_sync_interval);
}

/// Re-apply buffered batches that have become contiguous with the log.
fn drain_pending(inner: &Inner, sync: &mut SyncState) -> ApplyOutcome {
    loop {
        let max = inner.synced.max_log_id();
        sync.pending.retain(|(_, to), _| *to > max);

        let applicable = sync
            .pending
            .iter()
            .find(|((from, _), _)| *from <= max + 1)
            .map(|(key, _)| *key);
        let Some(key) = applicable else {
            break;
        };
        let records = sync
            .pending
            .remove(&key)
            .unwrap_or_default();
        match apply_records(inner, sync, records) {
            ApplyOutcome::Done => continue,
            other => return other,
        }
    }
    if sync.pending.is_empty() {
        inner.timers.cancel(TimerKind::IndexAsk);
    }
    if sync.missed_req_keys.is_empty() {
        inner.timers.cancel(TimerKind::RequestAsk);
    }
    ApplyOutcome::Done
}

/// Serve a follower's back-fill ask from our synced log. Idempotent.
fn on_ask_missed_index(inner: &Inner, msg: AskMissedIndex) {
    if inner.gate.status() != Status::Normal {
        return;
    }
    match inner.check_view(msg.hdr.view) {
        ViewCheck::Stale => return,
        ViewCheck::Ahead(view) => {
            crate::master::observe_higher_view(inner, view);
            return;
        }
        ViewCheck::Current => {}
    }
    if !inner.check_cv(&msg.hdr) {
        return;
    }

    let to = msg.to.min(inner.synced.max_log_id());
    let mut from = msg.from;
    while from <= to {
        let chunk_end = to.min(from + inner.config.index_transfer_batch - 1);
        let records = records_for(inner, from, chunk_end);
        let Some(last) = records.last() else {
            break;
        };
        let last_id = last.log_id;
        inner.transport.send_to_replica(
            msg.hdr.sender,
            PeerMessage::IndexSync(IndexSync {
                hdr: inner.header(),
                from,
                to: last_id,
                records,
            }),
        );
        from = last_id + 1;
    }
}

/// Serve a follower's ask for full request bodies. Idempotent.
fn on_ask_missed_req(inner: &Inner, msg: AskMissedReq) {
    if inner.gate.status() != Status::Normal {
        return;
    }
    match inner.check_view(msg.hdr.view) {
        ViewCheck::Stale => return,
        ViewCheck::Ahead(view) => {
            crate::master::observe_higher_view(inner, view);
            return;
        }
        ViewCheck::Current => {}
    }
    if !inner.check_cv(&msg.hdr) {
        return;
    }

    let mut batch = Vec::new();
    for key in msg
        .req_keys
        .iter()
        .take(inner.config.request_key_transfer_batch as usize)
    {
        let body = inner
            .synced
            .get_by_req(*key)
            .or_else(|| inner.unsynced.get_by_req(*key))
            .map(|entry| entry.body.clone());
        if let Some(body) = body {
            batch.push(body);
        }
        if batch.len() >= inner.config.request_transfer_batch as usize {
            send_missed_req_ack(inner, msg.hdr.sender, std::mem::take(&mut batch));
        }
    }
    if !batch.is_empty() {
        send_missed_req_ack(inner, msg.hdr.sender, batch);
    }
}

fn send_missed_req_ack(inner: &Inner, to: ReplicaId, requests: Vec<RequestBody>) {
    inner.transport.send_to_replica(
        to,
        PeerMessage::MissedReqAck(MissedReqAck {
            hdr: inner.header(),
            requests,
        }),
    );
}

fn on_missed_req_ack(inner: &Inner, msg: MissedReqAck) {
    if inner.gate.status() != Status::Normal {
        return;
    }
    match inner.check_view(msg.hdr.view) {
        ViewCheck::Stale => return,
        ViewCheck::Ahead(view) => {
            crate::master::observe_higher_view(inner, view);
            return;
        }
        ViewCheck::Current => {}
    }
    if !inner.check_cv(&msg.hdr) {
        return;
    }

    let outcome = {
        let mut sync = inner.sync.lock();
        for body in msg.requests {
            if inner.synced.contains_req(body.req_key) {
                continue;
            }
            if sync.missed_req_keys.remove(&body.req_key) {
                sync.fetched.insert(body.req_key, body);
            }
        }
        drain_pending(inner, &mut sync)
    };
    if matches!(outcome, ApplyOutcome::Diverged) {
        crate::master::initiate_next_view(inner);
    }
}

/// The leader committed past our synced tail: we missed index broadcasts.
pub(crate) fn on_commit_gap(inner: &Inner, committed: u32) {
    let mut sync = inner.sync.lock();
    let max = inner.synced.max_log_id();
    if committed <= max {
        return;
    }
    let target = ask_target(inner, &mut sync);
    inner.transport.send_to_replica(
        target,
        PeerMessage::AskMissedIndex(AskMissedIndex {
            hdr: inner.header(),
            from: max + 1,
            to: committed,
        }),
    );
    inner
        .timers
        .arm(TimerKind::IndexAsk, inner.config.periodic_sync_interval);
}

pub(crate) fn on_index_ask_timer(inner: &Inner) {
    if inner.gate.status() != Status::Normal {
        return;
    }
    let outcome = {
        let mut sync = inner.sync.lock();
        let outcome = drain_pending(inner, &mut sync);

        let max = inner.synced.max_log_id();
        let committed = inner
            .committed_log_id
            .load(std::sync::atomic::Ordering::Acquire);
        let gap_to = match sync.pending.keys().next() {
            Some((from, _)) if *from > max + 1 => Some(*from - 1),
            Some(_) => None,
            None if committed > max => Some(committed),
            None => None,
        };
        if let Some(to) = gap_to {
            sync.ask_rr += 1;
            let target = ask_target(inner, &mut sync);
            inner.transport.send_to_replica(
                target,
                PeerMessage::AskMissedIndex(AskMissedIndex {
                    hdr: inner.header(),
                    from: max + 1,
                    to,
                }),
            );
            inner
                .timers
                .arm(TimerKind::IndexAsk, inner.config.periodic_sync_interval);
        }
        outcome
    };
    if matches!(outcome, ApplyOutcome::Diverged) {
        crate::master::initiate_next_view(inner);
    }
}

pub(crate) fn on_request_ask_timer(inner: &Inner) {
    if inner.gate.status() != Status::Normal {
        return;
    }
    let mut sync = inner.sync.lock();
    if sync.missed_req_keys.is_empty() {
        return;
    }
    let keys: Vec<u64> = sync
        .missed_req_keys
        .iter()
        .take(inner.config.request_key_transfer_batch as usize)
        .copied()
        .collect();
    sync.ask_rr += 1;
    let target = ask_target(inner, &mut sync);
    inner.transport.send_to_replica(
        target,
        PeerMessage::AskMissedReq(AskMissedReq {
            hdr: inner.header(),
            req_keys: keys,
        }),
    );
    inner
        .timers
        .arm(TimerKind::RequestAsk, inner.config.periodic_sync_interval);
}

/// First ask goes to the leader; retries rotate through the other peers.
fn ask_target(inner: &Inner, sync: &mut SyncState) -> ReplicaId {
    let leader = inner.current_leader();
    let mut order: Vec<ReplicaId> = vec![leader];
    order.extend(inner.peers().filter(|id| *id != leader));
    order[sync.ask_rr % order.len()]
}
