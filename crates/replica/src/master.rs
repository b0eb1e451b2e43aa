//! The master role: leader liveness tracking, view change, crash recovery,
//! state transfer, and the periodic commit.
//!
//! All handlers here run on the single dispatch thread. They may take
//! `Inner::master` and then `Inner::sync`; nothing takes them in the other
//! order.

use crate::gate::Status;
use crate::replica::{Inner, ViewCheck};
use crate::seams::TimerKind;
use proto_nezha::{
    leader_of, CommitInstruction, CrashVectorReply, CrashVectorRequest, LogTail, OrderKey,
    PeerMessage, RecoveryReply, RecoveryRequest, ReplicaId, RequestBody, StartView,
    StateTransferKind, StateTransferReply, StateTransferRequest, SyncStatusReport, ViewChange,
    ViewChangeRequest,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::Ordering;

// A full state transfer may retry this many timer periods before it aborts
// and re-targets a different peer.
const TRANSFER_RETRIES_BEFORE_RETARGET: u64 = 10;
// View-change rounds re-broadcast this many times before suspecting the
// prospective leader itself and moving to the next view.
const VIEW_CHANGE_ATTEMPTS: u32 = 5;

pub(crate) struct MasterState {
    /// Gathered `ViewChange` reports, keyed by reporter (prospective leader
    /// only).
    view_changes: HashMap<ReplicaId, ViewChange>,
    /// The view this replica is currently changing (or has changed) to.
    vc_target: u32,
    vc_attempts: u32,
    transfer: Option<TransferTask>,
    /// Unsynced entries gathered from reporters, ordered by
    /// `(deadline, reqKey)` and deduplicated by req key.
    requests_to_merge: BTreeMap<OrderKey, RequestBody>,
    recovery: Option<RecoveryState>,
    /// Follower sync-status reports of the current view (leader only).
    sync_status: HashMap<ReplicaId, SyncStatusReport>,
}

impl MasterState {
    pub(crate) fn new() -> Self {
        Self {
            view_changes: HashMap::new(),
            vc_target: 0,
            vc_attempts: 0,
            transfer: None,
            requests_to_merge: BTreeMap::new(),
            recovery: None,
            sync_status: HashMap::new(),
        }
    }
}

struct TransferTask {
    purpose: TransferPurpose,
    segments: VecDeque<TransferSegment>,
    /// Tail the synced log must reproduce once every Synced segment landed.
    expected_tail: LogTail,
    /// Absolute point at which the transfer aborts and re-targets.
    terminate_at_us: u64,
    retarget_rr: usize,
}

#[derive(Clone, Copy)]
struct TransferSegment {
    target: ReplicaId,
    kind: StateTransferKind,
    from: u32,
    to: u32,
    /// Next log id expected (Synced transfers advance chunk by chunk).
    next: u32,
}

#[derive(Clone, Copy)]
enum TransferPurpose {
    /// Prospective leader adopting the best prefix and gathering unsynced
    /// tails.
    ViewChangeLeader,
    /// Follower catching up to a `StartView` tail.
    FollowerStartView,
    /// Recovering replica fetching the longest reported prefix.
    Recovery,
}

struct RecoveryState {
    nonce: u64,
    cv_replies: HashMap<ReplicaId, Vec<u32>>,
    cv_done: bool,
    tail_replies: HashMap<ReplicaId, RecoveryReply>,
}

// ---------------------------------------------------------------------
// View change
// ---------------------------------------------------------------------

/// A message from a later view was observed; join that view change.
pub(crate) fn observe_higher_view(inner: &Inner, view: u32) {
    if inner.gate.status() == Status::Recovering {
        return;
    }
    let Some(mut m) = lock_for_escalation(inner) else {
        return;
    };
    initiate_locked(inner, &mut m, view);
}

/// Local evidence (divergence) that the current view is broken.
pub(crate) fn initiate_next_view(inner: &Inner) {
    if inner.gate.status() == Status::Recovering {
        return;
    }
    let Some(mut m) = lock_for_escalation(inner) else {
        return;
    };
    let next = inner.view_id() + 1;
    initiate_locked(inner, &mut m, next);
}

/// Index workers escalate from their own threads. They must not block on
/// the master lock: the dispatch thread may hold it inside a drain that is
/// waiting for this very worker to park. When the lock is busy another
/// initiator is already driving a view change (or the next index message
/// re-raises the evidence), so skipping is safe.
fn lock_for_escalation(inner: &Inner) -> Option<parking_lot::MutexGuard<'_, MasterState>> {
    if crate::gate::on_worker_thread() {
        inner.master.try_lock()
    } else {
        Some(inner.master.lock())
    }
}

fn initiate_locked(inner: &Inner, m: &mut MasterState, view: u32) {
    match inner.gate.status() {
        Status::Recovering | Status::Terminated => return,
        Status::ViewChange if view <= m.vc_target => return,
        Status::Normal if view <= inner.view_id() => return,
        _ => {}
    }
    tracing::info!(from = inner.view_id(), to = view, "initiating view change");

    inner.gate.set_status(Status::ViewChange);
    inner.gate.wait_drain();

    // Invalidate fast replies signed before the change: clients must not
    // fast-commit across views.
    inner.crash_vectors.bump_self(inner.me());
    inner.view.store(view, Ordering::Release);

    m.vc_target = view;
    m.vc_attempts = 0;
    m.view_changes.clear();
    m.transfer = None;
    m.requests_to_merge.clear();

    inner.broadcast(PeerMessage::ViewChangeRequest(ViewChangeRequest {
        hdr: inner.header(),
        view,
    }));
    send_own_view_change(inner, m);
    inner
        .timers
        .arm(TimerKind::ViewChange, inner.config.heartbeat_timeout);
}

fn send_own_view_change(inner: &Inner, m: &mut MasterState) {
    let view = m.vc_target;
    let report = ViewChange {
        hdr: inner.header(),
        view,
        last_normal_view: inner.last_normal_view.load(Ordering::Acquire),
        synced_tail: inner.synced.tail(),
        unsynced_tail: inner.unsynced.live_range(),
    };
    let leader = leader_of(view, inner.replica_num());
    if leader == inner.me() {
        m.view_changes.insert(inner.me(), report);
        check_gather(inner, m);
    } else {
        inner
            .transport
            .send_to_replica(leader, PeerMessage::ViewChange(report));
    }
}

pub(crate) fn on_view_change_request(inner: &Inner, msg: ViewChangeRequest) {
    if inner.gate.status() == Status::Recovering {
        return;
    }
    if !inner.check_cv(&msg.hdr) {
        return;
    }
    let mut m = inner.master.lock();
    if msg.view > inner.view_id() {
        initiate_locked(inner, &mut m, msg.view);
    } else if msg.view == inner.view_id() && inner.gate.status() == Status::ViewChange {
        // The round is already running; repeat our report in case the
        // prospective leader never saw it.
        send_own_view_change(inner, &mut m);
    }
}

pub(crate) fn on_view_change(inner: &Inner, msg: ViewChange) {
    if inner.gate.status() == Status::Recovering {
        return;
    }
    if !inner.check_cv(&msg.hdr) {
        return;
    }
    let mut m = inner.master.lock();
    match inner.check_view(msg.view) {
        ViewCheck::Stale => return,
        ViewCheck::Ahead(view) => {
            initiate_locked(inner, &mut m, view);
            // Fall through: we may be the prospective leader of that view.
        }
        ViewCheck::Current => {}
    }
    if msg.view != m.vc_target && inner.gate.status() == Status::ViewChange {
        return;
    }

    if inner.gate.status() == Status::Normal {
        // A straggler still changing into our NORMAL view; hand it the
        // already-started view directly.
        if inner.am_leader() && msg.view == inner.view_id() {
            inner.transport.send_to_replica(
                msg.hdr.sender,
                PeerMessage::StartView(StartView {
                    hdr: inner.header(),
                    view: inner.view_id(),
                    synced_tail: inner.synced.tail(),
                }),
            );
        }
        return;
    }

    if leader_of(msg.view, inner.replica_num()) != inner.me() {
        return;
    }
    m.view_changes.insert(msg.hdr.sender, msg);
    check_gather(inner, &mut m);
}

/// Prospective leader: once a super-majority reported, adopt the best
/// synced prefix and gather every reporter's unsynced tail.
fn check_gather(inner: &Inner, m: &mut MasterState) {
    if inner.gate.status() != Status::ViewChange
        || leader_of(m.vc_target, inner.replica_num()) != inner.me()
        || m.transfer.is_some()
        || m.view_changes.len() < inner.super_majority()
    {
        return;
    }

    let Some(best) = m
        .view_changes
        .values()
        .max_by_key(|vc| (vc.last_normal_view, vc.synced_tail.end, vc.hdr.sender))
        .cloned()
    else {
        return;
    };
    tracing::info!(
        view = m.vc_target,
        best_reporter = best.hdr.sender,
        adopt_end = best.synced_tail.end,
        "gathered super-majority of view-change reports"
    );

    let mut segments = VecDeque::new();
    let my_max = inner.synced.max_log_id();
    if best.hdr.sender != inner.me() && best.synced_tail.end > my_max {
        segments.push_back(TransferSegment {
            target: best.hdr.sender,
            kind: StateTransferKind::Synced,
            from: my_max + 1,
            to: best.synced_tail.end,
            next: my_max + 1,
        });
    }

    for (reporter, vc) in &m.view_changes {
        if vc.unsynced_tail.is_empty() {
            continue;
        }
        if *reporter == inner.me() {
            let range = inner.unsynced.live_range();
            for entry in inner.unsynced.collect_range(range.begin, range.end) {
                m.requests_to_merge
                    .insert(entry.body.order_key(), entry.body.clone());
            }
        } else {
            segments.push_back(TransferSegment {
                target: *reporter,
                kind: StateTransferKind::Unsynced,
                from: vc.unsynced_tail.begin,
                to: vc.unsynced_tail.end,
                next: vc.unsynced_tail.begin,
            });
        }
    }

    if segments.is_empty() {
        merge_and_start_view(inner, m);
        return;
    }
    m.transfer = Some(TransferTask {
        purpose: TransferPurpose::ViewChangeLeader,
        segments,
        expected_tail: best.synced_tail,
        terminate_at_us: inner.now_micros()
            + TRANSFER_RETRIES_BEFORE_RETARGET
                * inner.config.state_transfer_timeout.as_micros() as u64,
        retarget_rr: 0,
    });
    send_front_transfer_request(inner, m);
    inner
        .timers
        .arm(TimerKind::StateTransfer, inner.config.state_transfer_timeout);
}

/// Replay the merged unsynced stream through the release path, announce
/// the new view, and enter it.
fn merge_and_start_view(inner: &Inner, m: &mut MasterState) {
    let merge = std::mem::take(&mut m.requests_to_merge);
    let merged = merge.len();
    for (_, body) in merge {
        if inner.synced.contains_req(body.req_key) {
            continue;
        }
        if body.order_key() <= inner.synced.last_order_key() {
            // Ordered before the adopted tail: it can no longer be placed;
            // its client finishes via retry.
            tracing::debug!(req_key = body.req_key, "dropping unplaceable unsynced remnant");
            continue;
        }
        let result = inner.app.execute(&body);
        if let Err(err) = inner.synced.append(body, result) {
            tracing::debug!(error = %err, "skipping unmergeable unsynced remnant");
        }
    }

    let tail = inner.synced.tail();
    tracing::info!(view = m.vc_target, end = tail.end, merged, "starting view");
    inner.broadcast(PeerMessage::StartView(StartView {
        hdr: inner.header(),
        view: m.vc_target,
        synced_tail: tail,
    }));
    enter_new_view(inner, m, m.vc_target);
}

pub(crate) fn on_start_view(inner: &Inner, msg: StartView) {
    if inner.gate.status() == Status::Recovering {
        return;
    }
    if !inner.check_cv(&msg.hdr) {
        return;
    }
    match inner.check_view(msg.view) {
        ViewCheck::Stale => return,
        ViewCheck::Current if inner.gate.status() == Status::Normal => return,
        ViewCheck::Current | ViewCheck::Ahead(_) => {}
    }
    if msg.hdr.sender != leader_of(msg.view, inner.replica_num()) {
        return;
    }

    let mut m = inner.master.lock();
    if inner.gate.status() == Status::Normal {
        inner.gate.set_status(Status::ViewChange);
    }
    inner.gate.wait_drain();
    inner.view.store(msg.view, Ordering::Release);
    m.vc_target = msg.view;
    m.transfer = None;

    let target = msg.synced_tail;
    if inner.synced.max_log_id() > target.end {
        inner.synced.truncate_to(target.end);
    }
    if inner.synced.max_log_id() == target.end {
        if inner.synced.tail().chained == target.chained {
            enter_new_view(inner, &mut m, msg.view);
            return;
        }
        // Same length, different tail: rewind to the commit point and
        // re-fetch the disputed suffix.
        let committed = inner
            .committed_log_id
            .load(Ordering::Acquire)
            .min(target.end);
        inner.synced.truncate_to(committed);
    }

    let from = inner.synced.max_log_id() + 1;
    m.transfer = Some(TransferTask {
        purpose: TransferPurpose::FollowerStartView,
        segments: VecDeque::from([TransferSegment {
            target: msg.hdr.sender,
            kind: StateTransferKind::Synced,
            from,
            to: target.end,
            next: from,
        }]),
        expected_tail: target,
        terminate_at_us: inner.now_micros()
            + TRANSFER_RETRIES_BEFORE_RETARGET
                * inner.config.state_transfer_timeout.as_micros() as u64,
        retarget_rr: 0,
    });
    send_front_transfer_request(inner, &mut m);
    inner
        .timers
        .arm(TimerKind::StateTransfer, inner.config.state_transfer_timeout);
}

/// Reset worker context and resume NORMAL operation in `view`.
fn enter_new_view(inner: &Inner, m: &mut MasterState, view: u32) {
    inner.drain_queues();
    inner.early.lock().drain_all();
    inner.unsynced.reset();
    {
        let mut last = inner.last_released_by_key.lock();
        for slot in last.iter_mut() {
            *slot = (0, 0);
        }
    }
    inner.sync.lock().reset();
    inner.gc.reset();

    m.view_changes.clear();
    m.transfer = None;
    m.requests_to_merge.clear();
    m.recovery = None;
    m.sync_status.clear();
    m.vc_attempts = 0;
    m.vc_target = view;

    inner.view.store(view, Ordering::Release);
    inner.last_normal_view.store(view, Ordering::Release);
    inner
        .index_sent
        .store(inner.synced.max_log_id(), Ordering::Release);
    inner.touch_heartbeat();

    inner.timers.cancel(TimerKind::ViewChange);
    inner.timers.cancel(TimerKind::StateTransfer);
    inner.timers.cancel(TimerKind::CrashVectorRequest);
    inner.timers.cancel(TimerKind::RecoveryRequest);
    inner.timers.cancel(TimerKind::IndexAsk);
    inner.timers.cancel(TimerKind::RequestAsk);
    inner
        .timers
        .arm(TimerKind::HeartbeatCheck, inner.config.heartbeat_timeout);
    inner
        .timers
        .arm(TimerKind::PeriodicSync, inner.config.periodic_sync_interval);

    inner.gate.set_status(Status::Normal);

    // Clients of the uncommitted tail may still be waiting; re-emit their
    // replies under the new view.
    let committed = inner
        .committed_log_id
        .load(Ordering::Acquire)
        .min(inner.synced.max_log_id());
    for id in (committed + 1)..=inner.synced.max_log_id() {
        if let Some(entry) = inner.synced.get(id) {
            if inner.am_leader() {
                inner.enqueue_fast_reply(entry);
            } else {
                inner.enqueue_slow_reply(entry);
            }
        }
    }

    tracing::info!(
        view,
        leader = inner.current_leader(),
        end = inner.synced.max_log_id(),
        "entered new view"
    );
}

pub(crate) fn on_view_change_timer(inner: &Inner) {
    if inner.gate.status() != Status::ViewChange {
        return;
    }
    let mut m = inner.master.lock();
    m.vc_attempts += 1;
    if m.vc_attempts > VIEW_CHANGE_ATTEMPTS {
        // The prospective leader is not finishing the round; suspect it.
        let next = m.vc_target + 1;
        initiate_locked(inner, &mut m, next);
        return;
    }
    inner.broadcast(PeerMessage::ViewChangeRequest(ViewChangeRequest {
        hdr: inner.header(),
        view: m.vc_target,
    }));
    send_own_view_change(inner, &mut m);
    inner
        .timers
        .arm(TimerKind::ViewChange, inner.config.heartbeat_timeout);
}

// ---------------------------------------------------------------------
// State transfer
// ---------------------------------------------------------------------

fn send_front_transfer_request(inner: &Inner, m: &mut MasterState) {
    let Some(task) = m.transfer.as_ref() else {
        return;
    };
    let Some(seg) = task.segments.front() else {
        return;
    };
    let (from, to) = match seg.kind {
        StateTransferKind::Synced => (
            seg.next,
            seg.to
                .min(seg.next + inner.config.request_transfer_batch - 1),
        ),
        // Unsynced tails are short; fetched in one piece.
        StateTransferKind::Unsynced => (seg.from, seg.to),
    };
    inner.transport.send_to_replica(
        seg.target,
        PeerMessage::StateTransferRequest(StateTransferRequest {
            hdr: inner.header(),
            kind: seg.kind,
            from,
            to,
        }),
    );
}

pub(crate) fn on_state_transfer_request(inner: &Inner, msg: StateTransferRequest) {
    // Both NORMAL peers and view-change participants serve transfers; a
    // recovering replica has nothing trustworthy to offer.
    if matches!(
        inner.gate.status(),
        Status::Recovering | Status::Terminated
    ) {
        return;
    }
    match inner.check_view(msg.hdr.view) {
        ViewCheck::Stale => return,
        ViewCheck::Ahead(view) => {
            observe_higher_view(inner, view);
            return;
        }
        ViewCheck::Current => {}
    }
    if !inner.check_cv(&msg.hdr) {
        return;
    }

    match msg.kind {
        StateTransferKind::Synced => {
            let to = msg.to.min(inner.synced.max_log_id());
            let mut from = msg.from;
            while from <= to {
                let chunk_end = to.min(from + inner.config.request_transfer_batch - 1);
                let entries = inner.synced.collect_range(from, chunk_end);
                // Only a contiguous run keeps ids aligned for the receiver.
                let mut bodies = Vec::new();
                for (offset, entry) in entries.iter().enumerate() {
                    if entry.log_id != from + offset as u32 {
                        break;
                    }
                    bodies.push(entry.body.clone());
                }
                if bodies.is_empty() {
                    break;
                }
                let sent = bodies.len() as u32;
                inner.transport.send_to_replica(
                    msg.hdr.sender,
                    PeerMessage::StateTransferReply(StateTransferReply {
                        hdr: inner.header(),
                        kind: StateTransferKind::Synced,
                        from,
                        requests: bodies,
                    }),
                );
                from += sent;
            }
        }
        StateTransferKind::Unsynced => {
            let bodies: Vec<RequestBody> = inner
                .unsynced
                .collect_range(msg.from, msg.to)
                .iter()
                .map(|entry| entry.body.clone())
                .collect();
            inner.transport.send_to_replica(
                msg.hdr.sender,
                PeerMessage::StateTransferReply(StateTransferReply {
                    hdr: inner.header(),
                    kind: StateTransferKind::Unsynced,
                    from: msg.from,
                    requests: bodies,
                }),
            );
        }
    }
}

pub(crate) fn on_state_transfer_reply(inner: &Inner, msg: StateTransferReply) {
    let mut m = inner.master.lock();
    let Some(task) = m.transfer.as_mut() else {
        return;
    };
    let Some(seg) = task.segments.front_mut() else {
        return;
    };
    if msg.hdr.sender != seg.target || msg.kind != seg.kind {
        return;
    }

    let mut failed = false;
    let mut merged = Vec::new();
    match seg.kind {
        StateTransferKind::Synced => {
            if msg.from != seg.next {
                // Duplicate or out-of-order chunk; the timer re-asks.
                return;
            }
            for body in msg.requests {
                if inner.synced.contains_req(body.req_key) {
                    seg.next += 1;
                    continue;
                }
                let result = inner.app.execute(&body);
                match inner.synced.append(body, result) {
                    Ok(entry) => seg.next = entry.log_id + 1,
                    Err(err) => {
                        tracing::error!(error = %err, "transferred prefix does not extend our log");
                        failed = true;
                        break;
                    }
                }
            }
        }
        StateTransferKind::Unsynced => {
            for body in msg.requests {
                if !inner.synced.contains_req(body.req_key) {
                    merged.push(body);
                }
            }
            seg.next = seg.to + 1;
        }
    }

    if failed {
        retarget_transfer(inner, &mut m);
        return;
    }
    if seg.next > seg.to {
        task.segments.pop_front();
    }
    let done = task.segments.is_empty();
    for body in merged {
        m.requests_to_merge.insert(body.order_key(), body);
    }

    if done {
        if let Some(task) = m.transfer.take() {
            inner.timers.cancel(TimerKind::StateTransfer);
            finish_transfer(inner, &mut m, task);
        }
    } else {
        send_front_transfer_request(inner, &mut m);
        inner
            .timers
            .arm(TimerKind::StateTransfer, inner.config.state_transfer_timeout);
    }
}

fn finish_transfer(inner: &Inner, m: &mut MasterState, task: TransferTask) {
    let tail = inner.synced.tail();
    let expected = task.expected_tail;
    let verified = tail.end == expected.end && tail.chained == expected.chained;

    match task.purpose {
        TransferPurpose::ViewChangeLeader => {
            if !verified {
                tracing::error!(
                    expect = %expected.chained,
                    got = %tail.chained,
                    "adopted prefix failed its hash check"
                );
                let next = m.vc_target + 1;
                initiate_locked(inner, m, next);
                return;
            }
            merge_and_start_view(inner, m);
        }
        TransferPurpose::FollowerStartView => {
            if !verified {
                tracing::error!("start-view catch-up failed its hash check");
                let next = m.vc_target + 1;
                initiate_locked(inner, m, next);
                return;
            }
            enter_new_view(inner, m, m.vc_target);
        }
        TransferPurpose::Recovery => {
            if !verified {
                tracing::warn!("recovered prefix failed its hash check, restarting recovery");
                inner.synced.truncate_to(0);
                start_recovery_locked(inner, m);
                return;
            }
            enter_new_view(inner, m, m.vc_target);
        }
    }
}

pub(crate) fn on_state_transfer_timer(inner: &Inner) {
    let mut m = inner.master.lock();
    let Some(task) = m.transfer.as_ref() else {
        return;
    };
    if inner.now_micros() > task.terminate_at_us {
        tracing::warn!("state transfer timed out, trying a different source");
        retarget_transfer(inner, &mut m);
        return;
    }
    send_front_transfer_request(inner, &mut m);
    inner
        .timers
        .arm(TimerKind::StateTransfer, inner.config.state_transfer_timeout);
}

/// The current source is unresponsive or inconsistent: rewind any partial
/// progress of the front segment and point it at the next peer.
fn retarget_transfer(inner: &Inner, m: &mut MasterState) {
    let peers: Vec<ReplicaId> = inner.peers().collect();
    let Some(task) = m.transfer.as_mut() else {
        return;
    };
    let Some(seg) = task.segments.front_mut() else {
        return;
    };
    if matches!(seg.kind, StateTransferKind::Synced) && seg.next > seg.from {
        inner.synced.truncate_to(seg.from - 1);
    }
    seg.next = seg.from;
    task.retarget_rr += 1;
    if let Some(next_target) = peers
        .iter()
        .copied()
        .filter(|id| *id != seg.target)
        .nth(task.retarget_rr % peers.len().max(1))
        .or_else(|| peers.iter().copied().find(|id| *id != seg.target))
    {
        seg.target = next_target;
    }
    task.terminate_at_us = inner.now_micros()
        + TRANSFER_RETRIES_BEFORE_RETARGET
            * inner.config.state_transfer_timeout.as_micros() as u64;
    send_front_transfer_request(inner, m);
    inner
        .timers
        .arm(TimerKind::StateTransfer, inner.config.state_transfer_timeout);
}

// ---------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------

pub(crate) fn start_recovery(inner: &Inner) {
    let mut m = inner.master.lock();
    start_recovery_locked(inner, &mut m);
}

fn start_recovery_locked(inner: &Inner, m: &mut MasterState) {
    let nonce: u64 = rand::random();
    tracing::info!(nonce, "starting recovery");
    m.recovery = Some(RecoveryState {
        nonce,
        cv_replies: HashMap::new(),
        cv_done: false,
        tail_replies: HashMap::new(),
    });
    inner.broadcast(PeerMessage::CrashVectorRequest(CrashVectorRequest {
        sender: inner.me(),
        nonce,
    }));
    inner.timers.arm(
        TimerKind::CrashVectorRequest,
        inner.config.state_transfer_timeout,
    );
}

pub(crate) fn on_crash_vector_request(inner: &Inner, msg: CrashVectorRequest) {
    if matches!(
        inner.gate.status(),
        Status::Recovering | Status::Terminated
    ) {
        return;
    }
    let cv = inner.crash_vectors.current();
    inner.transport.send_to_replica(
        msg.sender,
        PeerMessage::CrashVectorReply(CrashVectorReply {
            sender: inner.me(),
            nonce: msg.nonce,
            cv: cv.counts.clone(),
        }),
    );
}

pub(crate) fn on_crash_vector_reply(inner: &Inner, msg: CrashVectorReply) {
    if inner.gate.status() != Status::Recovering {
        return;
    }
    let mut m = inner.master.lock();
    let Some(rec) = m.recovery.as_mut() else {
        return;
    };
    if msg.nonce != rec.nonce || rec.cv_done {
        return;
    }
    rec.cv_replies.insert(msg.sender, msg.cv);
    if rec.cv_replies.len() < inner.super_majority() {
        return;
    }

    // Aggregate by element-wise max, then bump our own slot: every message
    // of our previous incarnation is fenced from here on.
    let n = inner.replica_num();
    let mut counts = vec![0u32; n];
    for cv in rec.cv_replies.values() {
        for (slot, count) in cv.iter().enumerate().take(n) {
            counts[slot] = counts[slot].max(*count);
        }
    }
    counts[inner.me() as usize] += 1;
    inner.crash_vectors.install(counts.clone());
    rec.cv_done = true;
    let nonce = rec.nonce;

    tracing::info!(cv = ?counts, "crash vector reconstructed");
    inner.timers.cancel(TimerKind::CrashVectorRequest);
    inner.broadcast(PeerMessage::RecoveryRequest(RecoveryRequest {
        sender: inner.me(),
        nonce,
        cv: counts,
    }));
    inner
        .timers
        .arm(TimerKind::RecoveryRequest, inner.config.state_transfer_timeout);
}

pub(crate) fn on_recovery_request(inner: &Inner, msg: RecoveryRequest) {
    if matches!(
        inner.gate.status(),
        Status::Recovering | Status::Terminated
    ) {
        return;
    }
    // Adopt the recovering replica's bumped slot immediately; its old
    // incarnation must not be heard again.
    inner.crash_vectors.merge(&msg.cv);
    if inner.gate.status() != Status::Normal {
        return;
    }
    inner.transport.send_to_replica(
        msg.sender,
        PeerMessage::RecoveryReply(RecoveryReply {
            sender: inner.me(),
            nonce: msg.nonce,
            view: inner.view_id(),
            synced_tail: inner.synced.tail(),
            committed_log_id: inner.committed_log_id.load(Ordering::Acquire),
        }),
    );
}

pub(crate) fn on_recovery_reply(inner: &Inner, msg: RecoveryReply) {
    if inner.gate.status() != Status::Recovering {
        return;
    }
    let mut m = inner.master.lock();
    let Some(rec) = m.recovery.as_mut() else {
        return;
    };
    if msg.nonce != rec.nonce || !rec.cv_done {
        return;
    }
    rec.tail_replies.insert(msg.sender, msg);
    if rec.tail_replies.len() < inner.super_majority() {
        return;
    }

    let Some(best) = rec
        .tail_replies
        .values()
        .max_by_key(|r| (r.view, r.synced_tail.end))
        .cloned()
    else {
        return;
    };
    inner.timers.cancel(TimerKind::RecoveryRequest);
    inner.view.store(best.view, Ordering::Release);
    m.vc_target = best.view;
    inner
        .committed_log_id
        .store(best.committed_log_id, Ordering::Release);
    tracing::info!(
        view = best.view,
        end = best.synced_tail.end,
        source = best.sender,
        "recovery adopting longest reported prefix"
    );

    if best.synced_tail.end == 0 {
        enter_new_view(inner, &mut m, best.view);
        return;
    }
    m.transfer = Some(TransferTask {
        purpose: TransferPurpose::Recovery,
        segments: VecDeque::from([TransferSegment {
            target: best.sender,
            kind: StateTransferKind::Synced,
            from: 1,
            to: best.synced_tail.end,
            next: 1,
        }]),
        expected_tail: best.synced_tail,
        terminate_at_us: inner.now_micros()
            + TRANSFER_RETRIES_BEFORE_RETARGET
                * inner.config.state_transfer_timeout.as_micros() as u64,
        retarget_rr: 0,
    });
    send_front_transfer_request(inner, &mut m);
    inner
        .timers
        .arm(TimerKind::StateTransfer, inner.config.state_transfer_timeout);
}

pub(crate) fn on_crash_vector_timer(inner: &Inner) {
    if inner.gate.status() != Status::Recovering {
        return;
    }
    let m = inner.master.lock();
    let Some(rec) = m.recovery.as_ref() else {
        return;
    };
    if rec.cv_done {
        return;
    }
    inner.broadcast(PeerMessage::CrashVectorRequest(CrashVectorRequest {
        sender: inner.me(),
        nonce: rec.nonce,
    }));
    inner.timers.arm(
        TimerKind::CrashVectorRequest,
        inner.config.state_transfer_timeout,
    );
}

pub(crate) fn on_recovery_timer(inner: &Inner) {
    if inner.gate.status() != Status::Recovering {
        return;
    }
    let m = inner.master.lock();
    let Some(rec) = m.recovery.as_ref() else {
        return;
    };
    if !rec.cv_done || m.transfer.is_some() {
        return;
    }
    let cv = inner.crash_vectors.current();
    inner.broadcast(PeerMessage::RecoveryRequest(RecoveryRequest {
        sender: inner.me(),
        nonce: rec.nonce,
        cv: cv.counts.clone(),
    }));
    inner
        .timers
        .arm(TimerKind::RecoveryRequest, inner.config.state_transfer_timeout);
}

// ---------------------------------------------------------------------
// Heartbeat & periodic sync
// ---------------------------------------------------------------------

pub(crate) fn on_heartbeat_check(inner: &Inner) {
    if inner.gate.status() != Status::Normal {
        return;
    }
    if inner.am_leader() {
        inner
            .timers
            .arm(TimerKind::HeartbeatCheck, inner.config.heartbeat_timeout);
        return;
    }
    let last = inner.last_heartbeat_us.load(Ordering::Acquire);
    let elapsed = inner.now_micros().saturating_sub(last);
    if elapsed > inner.config.heartbeat_timeout.as_micros() as u64 {
        tracing::warn!(
            elapsed_us = elapsed,
            leader = inner.current_leader(),
            "leader heartbeat lost"
        );
        let mut m = inner.master.lock();
        let next = inner.view_id() + 1;
        initiate_locked(inner, &mut m, next);
        return;
    }
    inner
        .timers
        .arm(TimerKind::HeartbeatCheck, inner.config.heartbeat_timeout);
}

pub(crate) fn on_periodic_sync(inner: &Inner) {
    if inner.gate.status() != Status::Normal {
        return;
    }
    if inner.am_leader() {
        let mut m = inner.master.lock();
        advance_commit(inner, &mut m);
        inner.broadcast(PeerMessage::CommitInstruction(CommitInstruction {
            hdr: inner.header(),
            committed_log_id: inner.committed_log_id.load(Ordering::Acquire),
        }));
    } else {
        inner.transport.send_to_replica(
            inner.current_leader(),
            PeerMessage::SyncStatusReport(SyncStatusReport {
                hdr: inner.header(),
                synced_tail: inner.synced.tail(),
            }),
        );
    }
    inner
        .timers
        .arm(TimerKind::PeriodicSync, inner.config.periodic_sync_interval);
}

/// Leader: the commit point is the largest log id a super-majority
/// (including us) has synced and agreed on.
fn advance_commit(inner: &Inner, m: &mut MasterState) {
    let mut ends = vec![inner.synced.max_log_id()];
    for report in m.sync_status.values() {
        ends.push(report.synced_tail.end);
    }
    ends.sort_unstable_by(|a, b| b.cmp(a));

    let majority = inner.super_majority();
    if ends.len() < majority {
        return;
    }
    let candidate = ends[majority - 1];
    let committed = inner.committed_log_id.load(Ordering::Acquire);
    if candidate > committed {
        inner
            .committed_log_id
            .store(candidate, Ordering::Release);
        tracing::debug!(committed = candidate, "advanced commit point");
    }
}

pub(crate) fn on_sync_status_report(inner: &Inner, msg: SyncStatusReport) {
    if inner.gate.status() != Status::Normal || !inner.am_leader() {
        return;
    }
    match inner.check_view(msg.hdr.view) {
        ViewCheck::Stale => return,
        ViewCheck::Ahead(view) => {
            observe_higher_view(inner, view);
            return;
        }
        ViewCheck::Current => {}
    }
    if !inner.check_cv(&msg.hdr) {
        return;
    }

    // A report must describe a prefix of our log; anything else is a
    // divergent follower whose report cannot support a commit.
    let end = msg.synced_tail.end;
    if end > inner.synced.max_log_id() {
        return;
    }
    if let Some(entry) = inner.synced.get(end) {
        if entry.chained != msg.synced_tail.chained {
            tracing::warn!(
                follower = msg.hdr.sender,
                end,
                "sync-status report disagrees with our prefix"
            );
            return;
        }
    }
    let mut m = inner.master.lock();
    m.sync_status.insert(msg.hdr.sender, msg);
}

pub(crate) fn on_commit_instruction(inner: &Inner, msg: CommitInstruction) {
    if inner.gate.status() != Status::Normal || inner.am_leader() {
        return;
    }
    match inner.check_view(msg.hdr.view) {
        ViewCheck::Stale => return,
        ViewCheck::Ahead(view) => {
            observe_higher_view(inner, view);
            return;
        }
        ViewCheck::Current => {}
    }
    if msg.hdr.sender != inner.current_leader() {
        return;
    }
    if !inner.check_cv(&msg.hdr) {
        return;
    }
    inner.touch_heartbeat();

    let committed = inner.committed_log_id.load(Ordering::Acquire);
    if msg.committed_log_id > committed {
        inner
            .committed_log_id
            .store(msg.committed_log_id, Ordering::Release);
    }
    if msg.committed_log_id > inner.synced.max_log_id() {
        // The set committed past us; our index stream has a hole.
        crate::index::on_commit_gap(inner, msg.committed_log_id);
    }
}
