use crate::config::ReplicaConfig;
use crate::gate::{Status, StatusGate};
use crate::gc::GcCounters;
use crate::index::{IndexRecvMsg, SyncState};
use crate::master::MasterState;
use crate::owd::OwdEstimator;
use crate::seams::{Clock, StateMachine, TimerDriver, TimerKind, Transport};
use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use ordlog::{CrashVectorStore, EarlyBuffer, LateBuffer, Log, LogEntry};
use parking_lot::Mutex;
use proto_nezha::{
    AskMissedIndex, AskMissedReq, Digest, FastReply, LogTail, OrderKey, PeerHeader, PeerMessage,
    ReplicaId, ReplyMessage, RequestBody, SlowReply,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How a view check classified an inbound message.
pub(crate) enum ViewCheck {
    Current,
    Stale,
    /// The sender is in a later view than us.
    Ahead(u32),
}

pub(crate) struct Inner {
    pub(crate) config: ReplicaConfig,
    pub(crate) app: Box<dyn StateMachine>,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) timers: Box<dyn TimerDriver>,
    pub(crate) clock: Box<dyn Clock>,

    pub(crate) gate: StatusGate,
    pub(crate) view: AtomicU32,
    pub(crate) last_normal_view: AtomicU32,
    pub(crate) committed_log_id: AtomicU32,
    pub(crate) last_heartbeat_us: AtomicU64,

    /// The synced log: entries agreed under the current view. Written by
    /// the processor on the leader and by index-sync application on
    /// followers.
    pub(crate) synced: Log,
    /// Follower-only speculative log; empty on the leader.
    pub(crate) unsynced: Log,
    pub(crate) early: Mutex<EarlyBuffer>,
    pub(crate) late: LateBuffer,
    pub(crate) crash_vectors: CrashVectorStore,
    pub(crate) proxy_addrs: DashMap<u64, SocketAddr>,
    /// Order key of the most recently released request per op key.
    pub(crate) last_released_by_key: Mutex<Vec<OrderKey>>,

    pub(crate) process_tx: Sender<RequestBody>,
    pub(crate) process_rx: Receiver<RequestBody>,
    pub(crate) fast_reply_qs: Vec<(Sender<Arc<LogEntry>>, Receiver<Arc<LogEntry>>)>,
    pub(crate) slow_reply_qs: Vec<(Sender<Arc<LogEntry>>, Receiver<Arc<LogEntry>>)>,
    /// Feeds the index-recv worker, the single writer of a follower's
    /// synced log.
    pub(crate) index_recv_tx: Sender<IndexRecvMsg>,
    pub(crate) index_recv_rx: Receiver<IndexRecvMsg>,
    pub(crate) missed_index_tx: Sender<AskMissedIndex>,
    pub(crate) missed_index_rx: Receiver<AskMissedIndex>,
    pub(crate) missed_req_tx: Sender<AskMissedReq>,
    pub(crate) missed_req_rx: Receiver<AskMissedReq>,
    pub(crate) owd_tx: Sender<(u64, u32)>,
    pub(crate) owd_rx: Receiver<(u64, u32)>,
    pub(crate) owd: OwdEstimator,

    /// Last synced log id the leader has broadcast on the index stream.
    pub(crate) index_sent: AtomicU32,
    pub(crate) sync: Mutex<SyncState>,
    pub(crate) master: Mutex<MasterState>,
    pub(crate) gc: GcCounters,
}

impl Inner {
    pub(crate) fn me(&self) -> ReplicaId {
        self.config.replica_id
    }

    pub(crate) fn replica_num(&self) -> usize {
        self.config.replica_num()
    }

    pub(crate) fn view_id(&self) -> u32 {
        self.view.load(Ordering::Acquire)
    }

    pub(crate) fn current_leader(&self) -> ReplicaId {
        proto_nezha::leader_of(self.view_id(), self.replica_num())
    }

    pub(crate) fn am_leader(&self) -> bool {
        self.current_leader() == self.me()
    }

    pub(crate) fn super_majority(&self) -> usize {
        proto_nezha::super_majority(self.replica_num())
    }

    pub(crate) fn peers(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        (0..self.replica_num() as u32).filter(move |id| *id != self.me())
    }

    pub(crate) fn now_micros(&self) -> u64 {
        self.clock.now_micros()
    }

    pub(crate) fn touch_heartbeat(&self) {
        self.last_heartbeat_us
            .store(self.now_micros(), Ordering::Release);
    }

    pub(crate) fn header(&self) -> PeerHeader {
        let cv = self.crash_vectors.current();
        PeerHeader {
            sender: self.me(),
            view: self.view_id(),
            cv_version: cv.version,
            cv_hash: cv.hash,
            cv: cv.counts.clone(),
        }
    }

    pub(crate) fn broadcast(&self, msg: PeerMessage) {
        for peer in self.peers() {
            self.transport.send_to_replica(peer, msg.clone());
        }
    }

    /// Crash-vector admission check for an inbound peer message: integrity
    /// of the carried vector, then staleness of the sender's own slot. A
    /// vector that grows our knowledge is aggregated in.
    pub(crate) fn check_cv(&self, hdr: &PeerHeader) -> bool {
        let n = self.replica_num();
        if hdr.cv.len() != n || hdr.sender as usize >= n {
            tracing::debug!(sender = hdr.sender, "malformed crash vector, dropping");
            return false;
        }
        if Digest::of_counts(&hdr.cv) != hdr.cv_hash {
            tracing::debug!(sender = hdr.sender, "crash vector hash mismatch, dropping");
            return false;
        }
        let current = self.crash_vectors.current();
        if current.slot_is_stale(&hdr.cv, hdr.sender as usize) {
            tracing::debug!(
                sender = hdr.sender,
                "message from a stale incarnation, dropping"
            );
            return false;
        }
        self.crash_vectors.merge(&hdr.cv);
        true
    }

    pub(crate) fn check_view(&self, msg_view: u32) -> ViewCheck {
        let view = self.view_id();
        if msg_view == view {
            ViewCheck::Current
        } else if msg_view < view {
            ViewCheck::Stale
        } else {
            ViewCheck::Ahead(msg_view)
        }
    }

    pub(crate) fn reply_shard(&self, req_key: u64) -> usize {
        (req_key % self.fast_reply_qs.len() as u64) as usize
    }

    pub(crate) fn enqueue_fast_reply(&self, entry: Arc<LogEntry>) {
        let shard = self.reply_shard(entry.body.req_key);
        let _ = self.fast_reply_qs[shard].0.send(entry);
    }

    pub(crate) fn enqueue_slow_reply(&self, entry: Arc<LogEntry>) {
        let shard = self.reply_shard(entry.body.req_key);
        let _ = self.slow_reply_qs[shard].0.send(entry);
    }

    fn send_fast_reply(&self, entry: &LogEntry) {
        let Some(addr) = self.proxy_addrs.get(&entry.body.proxy_id).map(|a| *a) else {
            return;
        };
        let leader = self.am_leader();
        let cv = self.crash_vectors.current();
        let reply = FastReply {
            sender: self.me(),
            view: self.view_id(),
            log_id: entry.log_id,
            // The leader proves its whole prefix; a follower only attests
            // this entry so clients can detect divergence.
            hash: if leader { entry.chained } else { entry.my_hash },
            cv_hash: cv.hash,
            result: if leader {
                Some(entry.result.clone())
            } else {
                None
            },
            owd_us: self.owd.estimate(entry.body.proxy_id),
        };
        self.transport
            .send_to_proxy(addr, ReplyMessage::Fast(reply));
    }

    fn send_slow_reply(&self, entry: &LogEntry) {
        let Some(addr) = self.proxy_addrs.get(&entry.body.proxy_id).map(|a| *a) else {
            return;
        };
        let reply = SlowReply {
            sender: self.me(),
            view: self.view_id(),
            log_id: entry.log_id,
            hash: entry.chained,
            owd_us: self.owd.estimate(entry.body.proxy_id),
        };
        self.transport
            .send_to_proxy(addr, ReplyMessage::Slow(reply));
    }

    fn fast_reply_step(&self, shard: usize) {
        // Publish garbage-collection acknowledgements even when idle; a
        // quiet shard must not wedge the collector.
        self.gc.ack_reply_shard(shard);
        if let Ok(entry) = self.fast_reply_qs[shard]
            .1
            .recv_timeout(Duration::from_millis(2))
        {
            self.send_fast_reply(&entry);
        }
    }

    fn slow_reply_step(&self, shard: usize) {
        if let Ok(entry) = self.slow_reply_qs[shard]
            .1
            .recv_timeout(Duration::from_millis(2))
        {
            self.send_slow_reply(&entry);
        }
    }

    fn owd_step(&self) {
        if let Ok((proxy_id, sample)) = self.owd_rx.recv_timeout(Duration::from_millis(2)) {
            self.owd.observe(proxy_id, sample);
            for (proxy_id, sample) in self.owd_rx.try_iter() {
                self.owd.observe(proxy_id, sample);
            }
        }
    }

    /// Drain every worker queue. Only valid while workers are quiesced.
    pub(crate) fn drain_queues(&self) {
        for _ in self.process_rx.try_iter() {}
        for (_, rx) in &self.fast_reply_qs {
            for _ in rx.try_iter() {}
        }
        for (_, rx) in &self.slow_reply_qs {
            for _ in rx.try_iter() {}
        }
        for _ in self.index_recv_rx.try_iter() {}
        for _ in self.missed_index_rx.try_iter() {}
        for _ in self.missed_req_rx.try_iter() {}
        for _ in self.owd_rx.try_iter() {}
    }
}

/// Handle to a running replica. Dropping it terminates and joins the
/// worker threads.
pub struct Replica {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl Replica {
    /// Construct and start a replica. With `is_recovering` the replica
    /// boots into the RECOVERING handshake instead of NORMAL; a replica
    /// that lost its state must never rejoin as if nothing happened.
    pub fn new(
        config: ReplicaConfig,
        is_recovering: bool,
        app: Box<dyn StateMachine>,
        transport: Box<dyn Transport>,
        timers: Box<dyn TimerDriver>,
        clock: Box<dyn Clock>,
    ) -> crate::Result<Replica> {
        config.validate()?;
        tracing::info!(
            replica_id = config.replica_id,
            replicas = ?config.replica_ips,
            key_num = config.key_num,
            reply_shards = config.reply_shards,
            index_transfer_batch = config.index_transfer_batch,
            heartbeat_timeout = ?config.heartbeat_timeout,
            periodic_sync_interval = ?config.periodic_sync_interval,
            owd_headroom = ?config.owd_headroom,
            is_recovering,
            "starting replica"
        );

        let replica_num = config.replica_num();
        let key_num = config.key_num;
        let shards = config.reply_shards;

        let (process_tx, process_rx) = unbounded();
        let (index_recv_tx, index_recv_rx) = unbounded();
        let (missed_index_tx, missed_index_rx) = unbounded();
        let (missed_req_tx, missed_req_rx) = unbounded();
        let (owd_tx, owd_rx) = unbounded();
        let fast_reply_qs = (0..shards).map(|_| unbounded()).collect();
        let slow_reply_qs = (0..shards).map(|_| unbounded()).collect();

        let initial = if is_recovering {
            Status::Recovering
        } else {
            Status::Normal
        };

        let inner = Arc::new(Inner {
            owd: OwdEstimator::new(config.sliding_window_len),
            last_released_by_key: Mutex::new(vec![(0, 0); key_num as usize]),
            gc: GcCounters::new(shards),
            config,
            app,
            transport,
            timers,
            clock,
            gate: StatusGate::new(initial),
            view: AtomicU32::new(0),
            last_normal_view: AtomicU32::new(0),
            committed_log_id: AtomicU32::new(0),
            last_heartbeat_us: AtomicU64::new(0),
            synced: Log::new(key_num),
            unsynced: Log::new(key_num),
            early: Mutex::new(EarlyBuffer::new()),
            late: LateBuffer::new(),
            crash_vectors: CrashVectorStore::new(replica_num),
            proxy_addrs: DashMap::new(),
            process_tx,
            process_rx,
            fast_reply_qs,
            slow_reply_qs,
            index_recv_tx,
            index_recv_rx,
            missed_index_tx,
            missed_index_rx,
            missed_req_tx,
            missed_req_rx,
            owd_tx,
            owd_rx,
            index_sent: AtomicU32::new(0),
            sync: Mutex::new(SyncState::new()),
            master: Mutex::new(MasterState::new()),
        });

        inner.touch_heartbeat();

        let mut workers = Vec::new();
        workers.push(spawn_worker(&inner, "processor", |inner| {
            crate::processor::step(inner)
        }));
        for shard in 0..shards {
            let s = shard;
            workers.push(spawn_worker(&inner, "fast-reply", move |inner| {
                inner.fast_reply_step(s)
            }));
            workers.push(spawn_worker(&inner, "slow-reply", move |inner| {
                inner.slow_reply_step(s)
            }));
        }
        workers.push(spawn_worker(&inner, "index-send", |inner| {
            crate::index::send_step(inner)
        }));
        workers.push(spawn_worker(&inner, "index-recv", |inner| {
            crate::index::recv_step(inner)
        }));
        workers.push(spawn_worker(&inner, "missed-index-ack", |inner| {
            crate::index::missed_index_ack_step(inner)
        }));
        workers.push(spawn_worker(&inner, "missed-req-ack", |inner| {
            crate::index::missed_req_ack_step(inner)
        }));
        workers.push(spawn_worker(&inner, "gc", |inner| crate::gc::step(inner)));
        workers.push(spawn_worker(&inner, "owd-calc", |inner| inner.owd_step()));

        if is_recovering {
            crate::master::start_recovery(&inner);
        } else {
            inner
                .timers
                .arm(TimerKind::HeartbeatCheck, inner.config.heartbeat_timeout);
            inner
                .timers
                .arm(TimerKind::PeriodicSync, inner.config.periodic_sync_interval);
        }

        Ok(Replica { inner, workers })
    }

    /// Bootstrap from a YAML config file.
    pub fn from_config_file(
        path: &Path,
        is_recovering: bool,
        app: Box<dyn StateMachine>,
        transport: Box<dyn Transport>,
        timers: Box<dyn TimerDriver>,
        clock: Box<dyn Clock>,
    ) -> crate::Result<Replica> {
        let config = ReplicaConfig::from_file(path)?;
        Replica::new(config, is_recovering, app, transport, timers, clock)
    }

    /// Ingest one decoded client request from the event loop.
    pub fn receive_client_request(&self, body: RequestBody, sender: SocketAddr) {
        let inner = &self.inner;
        if inner.gate.status() != Status::Normal {
            return;
        }
        inner.proxy_addrs.insert(body.proxy_id, sender);

        // Sample how much one-way delay this request needed: the slack
        // (or overshoot) of its arrival against the stamped deadline,
        // shifted by the configured headroom.
        let now = inner.now_micros();
        let headroom = inner.config.owd_headroom.as_micros() as u64;
        let sample = (now + headroom)
            .saturating_sub(body.deadline)
            .min(u32::MAX as u64) as u32;
        let _ = inner.owd_tx.send((body.proxy_id, sample));

        // Duplicate: never a second log entry. Re-enqueue the existing one
        // so a retrying client converges on the cached reply.
        let existing = inner
            .synced
            .get_by_req(body.req_key)
            .or_else(|| inner.unsynced.get_by_req(body.req_key));
        if let Some(entry) = existing {
            inner.enqueue_fast_reply(entry);
            return;
        }
        if inner.late.contains_req(body.req_key) {
            return;
        }
        let _ = inner.process_tx.send(body);
    }

    /// Ingest one decoded peer message. Must be called from the single
    /// master/dispatch thread. Index-stream and back-fill messages are
    /// handed to their worker threads' queues; master messages are handled
    /// here, on the caller's thread.
    pub fn receive_peer_message(&self, msg: PeerMessage) {
        let inner = &self.inner;
        if inner.gate.status() == Status::Terminated {
            return;
        }
        match msg {
            PeerMessage::IndexSync(msg) => {
                let _ = inner.index_recv_tx.send(IndexRecvMsg::Sync(msg));
            }
            PeerMessage::MissedReqAck(msg) => {
                let _ = inner.index_recv_tx.send(IndexRecvMsg::ReqAck(msg));
            }
            PeerMessage::AskMissedIndex(msg) => {
                let _ = inner.missed_index_tx.send(msg);
            }
            PeerMessage::AskMissedReq(msg) => {
                let _ = inner.missed_req_tx.send(msg);
            }
            PeerMessage::ViewChangeRequest(msg) => {
                crate::master::on_view_change_request(inner, msg)
            }
            PeerMessage::ViewChange(msg) => crate::master::on_view_change(inner, msg),
            PeerMessage::StartView(msg) => crate::master::on_start_view(inner, msg),
            PeerMessage::StateTransferRequest(msg) => {
                crate::master::on_state_transfer_request(inner, msg)
            }
            PeerMessage::StateTransferReply(msg) => {
                crate::master::on_state_transfer_reply(inner, msg)
            }
            PeerMessage::CrashVectorRequest(msg) => {
                crate::master::on_crash_vector_request(inner, msg)
            }
            PeerMessage::CrashVectorReply(msg) => {
                crate::master::on_crash_vector_reply(inner, msg)
            }
            PeerMessage::RecoveryRequest(msg) => crate::master::on_recovery_request(inner, msg),
            PeerMessage::RecoveryReply(msg) => crate::master::on_recovery_reply(inner, msg),
            PeerMessage::SyncStatusReport(msg) => {
                crate::master::on_sync_status_report(inner, msg)
            }
            PeerMessage::CommitInstruction(msg) => {
                crate::master::on_commit_instruction(inner, msg)
            }
        }
    }

    /// A timer the engine armed has fired. Must be called from the single
    /// master/dispatch thread.
    pub fn on_timer(&self, timer: TimerKind) {
        let inner = &self.inner;
        if inner.gate.status() == Status::Terminated {
            return;
        }
        match timer {
            TimerKind::HeartbeatCheck => crate::master::on_heartbeat_check(inner),
            TimerKind::PeriodicSync => crate::master::on_periodic_sync(inner),
            TimerKind::IndexAsk => crate::index::on_index_ask_timer(inner),
            TimerKind::RequestAsk => crate::index::on_request_ask_timer(inner),
            TimerKind::ViewChange => crate::master::on_view_change_timer(inner),
            TimerKind::StateTransfer => crate::master::on_state_transfer_timer(inner),
            TimerKind::CrashVectorRequest => crate::master::on_crash_vector_timer(inner),
            TimerKind::RecoveryRequest => crate::master::on_recovery_timer(inner),
        }
    }

    /// Stop the worker threads and wait for them to exit.
    pub fn terminate(&mut self) {
        self.inner.gate.set_status(Status::Terminated);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }

    // Observability used by embedders and tests.

    pub fn status(&self) -> Status {
        self.inner.gate.status()
    }

    pub fn view_id(&self) -> u32 {
        self.inner.view_id()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.am_leader()
    }

    pub fn committed_log_id(&self) -> u32 {
        self.inner.committed_log_id.load(Ordering::Acquire)
    }

    pub fn synced_tail(&self) -> LogTail {
        self.inner.synced.tail()
    }

    pub fn max_synced_log_id(&self) -> u32 {
        self.inner.synced.max_log_id()
    }

    pub fn max_unsynced_log_id(&self) -> u32 {
        self.inner.unsynced.max_log_id()
    }

    pub fn synced_entry(&self, log_id: u32) -> Option<Arc<LogEntry>> {
        self.inner.synced.get(log_id)
    }

    pub fn synced_log_id_of(&self, req_key: u64) -> Option<u32> {
        self.inner.synced.log_id_of_req(req_key)
    }

    pub fn late_buffer_len(&self) -> usize {
        self.inner.late.len()
    }

    pub fn owd_estimate(&self, proxy_id: u64) -> Option<u32> {
        self.inner.owd.estimate(proxy_id)
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn spawn_worker(
    inner: &Arc<Inner>,
    name: &str,
    step: impl Fn(&Inner) + Send + 'static,
) -> JoinHandle<()> {
    let inner = inner.clone();
    inner.gate.register_worker();
    std::thread::Builder::new()
        .name(format!("nezha-{name}"))
        .spawn(move || {
            crate::gate::mark_worker_thread();
            loop {
                if inner.gate.pause_point() == Status::Terminated {
                    break;
                }
                step(&inner);
            }
            inner.gate.deregister_worker();
        })
        .expect("spawning a worker thread")
}
