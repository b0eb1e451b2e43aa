//! Three-replica cluster scenarios over an in-memory transport hub.
//!
//! The hub queues every peer message; tests pump deliveries from the test
//! thread, which doubles as each replica's master/dispatch thread. Time is
//! a shared manual clock so deadline release is driven explicitly.

use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use proto_nezha::{PeerMessage, ReplicaId, ReplyMessage, RequestBody};
use replica::{Clock, Replica, ReplicaConfig, Status, TimerDriver, TimerKind, Transport};
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

const N: usize = 3;
const BASE_US: u64 = 1_000_000_000;

#[derive(Clone)]
struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    fn new() -> Self {
        Self(Arc::new(AtomicU64::new(BASE_US)))
    }

    fn advance(&self, by_us: u64) {
        self.0.fetch_add(by_us, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

/// Records timer arms; tests fire timers explicitly through `on_timer`.
struct NullTimers;

impl TimerDriver for NullTimers {
    fn arm(&self, _timer: TimerKind, _after: Duration) {}
    fn cancel(&self, _timer: TimerKind) {}
}

#[derive(Default)]
struct HubState {
    inboxes: Vec<VecDeque<PeerMessage>>,
    replies: Vec<(u64, ReplyMessage)>,
    /// Replicas cut off from the network, both directions.
    dead: HashSet<ReplicaId>,
}

struct Hub {
    state: Mutex<HubState>,
}

impl Hub {
    fn new() -> Arc<Hub> {
        Arc::new(Hub {
            state: Mutex::new(HubState {
                inboxes: (0..N).map(|_| VecDeque::new()).collect(),
                replies: Vec::new(),
                dead: HashSet::new(),
            }),
        })
    }

    fn kill(&self, id: ReplicaId) {
        let mut state = self.state.lock();
        state.dead.insert(id);
        state.inboxes[id as usize].clear();
    }

    fn revive(&self, id: ReplicaId) {
        self.state.lock().dead.remove(&id);
    }

    fn pop(&self, id: ReplicaId) -> Option<PeerMessage> {
        self.state.lock().inboxes[id as usize].pop_front()
    }

    fn replies_for(&self, proxy_id: u64) -> Vec<ReplyMessage> {
        self.state
            .lock()
            .replies
            .iter()
            .filter(|(p, _)| *p == proxy_id)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

struct HubTransport {
    hub: Arc<Hub>,
    owner: ReplicaId,
}

impl Transport for HubTransport {
    fn send_to_replica(&self, to: ReplicaId, msg: PeerMessage) {
        let mut state = self.hub.state.lock();
        if state.dead.contains(&self.owner) || state.dead.contains(&to) {
            return;
        }
        state.inboxes[to as usize].push_back(msg);
    }

    fn send_to_proxy(&self, addr: SocketAddr, msg: ReplyMessage) {
        let mut state = self.hub.state.lock();
        if state.dead.contains(&self.owner) {
            return;
        }
        // The harness encodes the proxy id in the address port.
        state.replies.push((addr.port() as u64, msg));
    }
}

struct Cluster {
    hub: Arc<Hub>,
    clock: ManualClock,
    replicas: Vec<Option<Replica>>,
}

impl Cluster {
    fn config(id: u32) -> ReplicaConfig {
        ReplicaConfig {
            replica_id: id,
            replica_ips: (0..N).map(|i| format!("127.0.0.1:{}", 7000 + i)).collect(),
            key_num: 4,
            sliding_window_len: 2,
            index_transfer_batch: 8,
            request_key_transfer_batch: 8,
            request_transfer_batch: 8,
            reclaim_timeout: Duration::from_millis(50),
            state_transfer_timeout: Duration::from_millis(100),
            heartbeat_timeout: Duration::from_millis(50),
            periodic_sync_interval: Duration::from_millis(10),
            owd_headroom: Duration::from_millis(1),
            reply_shards: 2,
        }
    }

    fn start() -> Cluster {
        init_tracing();
        let hub = Hub::new();
        let clock = ManualClock::new();
        let replicas = (0..N as u32)
            .map(|id| Some(Self::boot(&hub, &clock, id, false)))
            .collect();
        Cluster {
            hub,
            clock,
            replicas,
        }
    }

    fn boot(hub: &Arc<Hub>, clock: &ManualClock, id: u32, recovering: bool) -> Replica {
        Replica::new(
            Self::config(id),
            recovering,
            Box::new(replica::EchoApp),
            Box::new(HubTransport {
                hub: hub.clone(),
                owner: id,
            }),
            Box::new(NullTimers),
            Box::new(clock.clone()),
        )
        .expect("boot replica")
    }

    fn replica(&self, id: usize) -> &Replica {
        self.replicas[id].as_ref().expect("replica alive")
    }

    /// Deliver queued peer messages until the cluster goes quiet.
    fn pump(&self) {
        for _ in 0..10_000 {
            let mut delivered = false;
            for id in 0..N as u32 {
                if let Some(msg) = self.hub.pop(id) {
                    if let Some(replica) = &self.replicas[id as usize] {
                        replica.receive_peer_message(msg);
                    }
                    delivered = true;
                }
            }
            if !delivered {
                return;
            }
        }
        panic!("message pump did not quiesce");
    }

    /// Pump while waiting out a condition that worker threads establish.
    fn settle(&self, what: &str, mut pred: impl FnMut(&Cluster) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            self.pump();
            if pred(self) {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("timed out settling: {what}");
    }

    /// Wait on worker-thread progress without delivering any peer
    /// messages; the hub keeps them queued.
    fn wait_local(&self, what: &str, mut pred: impl FnMut(&Cluster) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if pred(self) {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("timed out waiting: {what}");
    }

    /// One round of periodic sync: followers report, then the leader
    /// commits and broadcasts.
    fn sync_round(&self) {
        for id in 0..N {
            if let Some(replica) = &self.replicas[id] {
                if !replica.is_leader() {
                    replica.on_timer(TimerKind::PeriodicSync);
                }
            }
        }
        self.pump();
        for id in 0..N {
            if let Some(replica) = &self.replicas[id] {
                if replica.is_leader() {
                    replica.on_timer(TimerKind::PeriodicSync);
                }
            }
        }
        self.pump();
    }

    fn send_to(&self, id: usize, body: RequestBody) {
        let addr: SocketAddr = format!("127.0.0.1:{}", body.proxy_id)
            .parse()
            .expect("proxy addr");
        self.replica(id).receive_client_request(body, addr);
    }

    fn send_to_all(&self, body: RequestBody) {
        for id in 0..N {
            if self.replicas[id].is_some() {
                self.send_to(id, body.clone());
            }
        }
    }
}

fn request(deadline: u64, req_key: u64, op_key: u32) -> RequestBody {
    RequestBody {
        deadline,
        req_key,
        op_key,
        proxy_id: 9000,
        command: Bytes::from(format!("cmd-{req_key}")),
    }
}

#[test]
fn releases_in_deadline_order_and_chains_hashes() {
    let cluster = Cluster::start();

    // A and B share a deadline (req key breaks the tie); C's is earlier.
    let future = BASE_US + 100_000;
    let a = request(future + 1_000, 1, 0);
    let b = request(future + 1_000, 2, 1);
    let c = request(future, 9, 0);
    cluster.send_to_all(a.clone());
    cluster.send_to_all(b.clone());
    cluster.send_to_all(c.clone());

    // Nothing is releasable until the horizon passes the deadlines.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(cluster.replica(0).max_synced_log_id(), 0);

    cluster.clock.advance(200_000);
    cluster.settle("leader releases three entries", |c| {
        c.replica(0).max_synced_log_id() == 3
    });

    // Canonical order: C, A, B.
    let leader = cluster.replica(0);
    let order: Vec<u64> = (1..=3)
        .map(|id| leader.synced_entry(id).unwrap().body.req_key)
        .collect();
    assert_eq!(order, vec![9, 1, 2]);

    // The accumulative hash is the XOR of the per-entry digests.
    let expect = proto_nezha::Digest::of_request(c.deadline, 9)
        .combined(&proto_nezha::Digest::of_request(a.deadline, 1))
        .combined(&proto_nezha::Digest::of_request(b.deadline, 2));
    assert_eq!(leader.synced_tail().chained, expect);

    // Per-op-key chain for op 0: C then A.
    let entry_c = leader.synced_entry(1).unwrap();
    let entry_a = leader.synced_entry(2).unwrap();
    assert_eq!(entry_c.next_by_key(), 2);
    assert_eq!(entry_a.prev_by_key(), 1);

    // Followers converge through the index stream.
    cluster.settle("followers promote the index stream", |c| {
        (1..N).all(|id| c.replica(id).synced_tail() == c.replica(0).synced_tail())
    });

    // Periodic sync advances the commit point everywhere.
    cluster.sync_round();
    cluster.sync_round();
    assert_eq!(cluster.replica(0).committed_log_id(), 3);
    cluster.settle("followers learn the commit point", |c| {
        (1..N).all(|id| c.replica(id).committed_log_id() == 3)
    });
}

#[test]
fn follower_backfills_an_index_gap() {
    let cluster = Cluster::start();

    // Follower 2 misses the first index broadcasts entirely.
    cluster.hub.kill(2);
    for key in 1..=2u64 {
        cluster.send_to(0, request(BASE_US - 10_000 + key, key, 0));
        cluster.send_to(1, request(BASE_US - 10_000 + key, key, 0));
    }
    cluster.settle("follower 1 syncs the first batch", |c| {
        c.replica(1).max_synced_log_id() == 2
    });

    // It comes back just in time for the second batch, which now has a gap
    // in front of it.
    cluster.hub.revive(2);
    for key in 3..=5u64 {
        cluster.send_to(0, request(BASE_US - 5_000 + key, key, 1));
    }
    cluster.settle("follower 2 backfills and catches up", |c| {
        c.replica(2).synced_tail() == c.replica(0).synced_tail()
            && c.replica(2).max_synced_log_id() == 5
    });

    // Entries it never saw as client requests were fetched whole.
    for key in 1..=5u64 {
        assert_eq!(
            cluster.replica(2).synced_log_id_of(key),
            cluster.replica(0).synced_log_id_of(key)
        );
    }
}

#[test]
fn view_change_elects_next_leader_and_merges_unsynced() {
    let cluster = Cluster::start();

    // Two entries reach everyone and commit.
    cluster.send_to_all(request(BASE_US - 10_000, 1, 0));
    cluster.send_to_all(request(BASE_US - 9_000, 2, 1));
    cluster.settle("followers sync the prefix", |c| {
        (1..N).all(|id| c.replica(id).max_synced_log_id() == 2)
    });
    cluster.sync_round();
    cluster.sync_round();
    assert_eq!(cluster.replica(0).committed_log_id(), 2);

    // One more request that only the followers see: it stays unsynced.
    cluster.send_to(1, request(BASE_US - 1_000, 3, 0));
    cluster.send_to(2, request(BASE_US - 1_000, 3, 0));
    // Speculative releases of the committed prefix already used unsynced
    // ids 1 and 2; the new entry lands at 3 on both followers.
    cluster.settle("followers hold it unsynced", |c| {
        c.replica(1).max_unsynced_log_id() >= 3 && c.replica(2).max_unsynced_log_id() >= 3
    });

    // The leader dies; a follower notices the silence.
    cluster.hub.kill(0);
    cluster.clock.advance(200_000);
    cluster.replica(1).on_timer(TimerKind::HeartbeatCheck);
    cluster.pump();

    cluster.settle("survivors enter view 1", |c| {
        c.replica(1).view_id() == 1
            && c.replica(1).status() == Status::Normal
            && c.replica(2).view_id() == 1
            && c.replica(2).status() == Status::Normal
    });
    assert!(cluster.replica(1).is_leader());

    // The unsynced entry was merged behind the adopted prefix.
    assert_eq!(cluster.replica(1).max_synced_log_id(), 3);
    assert_eq!(cluster.replica(1).synced_log_id_of(3), Some(3));
    cluster.settle("new follower catches up", |c| {
        c.replica(2).synced_tail() == c.replica(1).synced_tail()
    });

    // And the new view commits it.
    cluster.sync_round();
    cluster.sync_round();
    assert_eq!(cluster.replica(1).committed_log_id(), 3);
}

#[test]
fn crashed_replica_recovers_through_the_crash_vector_handshake() {
    let mut cluster = Cluster::start();

    cluster.send_to_all(request(BASE_US - 10_000, 1, 0));
    cluster.send_to_all(request(BASE_US - 9_000, 2, 1));
    cluster.settle("cluster syncs the prefix", |c| {
        (0..N).all(|id| c.replica(id).max_synced_log_id() == 2)
    });
    cluster.sync_round();
    cluster.sync_round();

    // Replica 2 crashes and loses everything.
    cluster.hub.kill(2);
    let old = cluster.replicas[2].take();
    drop(old);
    cluster.hub.revive(2);

    // A fresh incarnation boots straight into recovery; constructing it
    // broadcasts the crash-vector gather.
    let fresh = Cluster::boot(&cluster.hub, &cluster.clock, 2, true);
    cluster.replicas[2] = Some(fresh);
    assert_eq!(cluster.replica(2).status(), Status::Recovering);

    cluster.settle("recovery adopts the prefix and rejoins", |c| {
        c.replica(2).status() == Status::Normal
            && c.replica(2).synced_tail() == c.replica(0).synced_tail()
    });
    assert_eq!(cluster.replica(2).view_id(), cluster.replica(0).view_id());
}

#[test]
fn late_request_takes_the_late_buffer_path_on_followers() {
    let cluster = Cluster::start();

    // Followers speculatively release X before the leader has seen
    // anything; their release point is now past Y's deadline.
    let x = request(BASE_US - 1_000, 1, 0);
    cluster.send_to(1, x.clone());
    cluster.send_to(2, x.clone());
    cluster.wait_local("followers release X unsynced", |c| {
        c.replica(1).max_unsynced_log_id() == 1 && c.replica(2).max_unsynced_log_id() == 1
    });

    // Y is ordered first by the leader, but arrives late at the followers.
    // The hub holds the leader's index stream back until the late buffering
    // is observable.
    let y = request(BASE_US - 50_000, 9, 1);
    cluster.send_to_all(y.clone());
    cluster.wait_local("followers late-buffer Y", |c| {
        c.replica(1).late_buffer_len() == 1 && c.replica(2).late_buffer_len() == 1
    });

    // Index sync releases Y out of the late buffer at the leader's id.
    cluster.settle("followers promote Y from the late buffer", |c| {
        (1..N).all(|id| {
            c.replica(id).synced_log_id_of(9) == Some(1) && c.replica(id).late_buffer_len() == 0
        })
    });
    assert_eq!(cluster.replica(0).synced_log_id_of(9), Some(1));

    // Slow replies for Y went back to its proxy.
    let slow = cluster
        .hub
        .replies_for(9000)
        .into_iter()
        .filter(|r| matches!(r, ReplyMessage::Slow(s) if s.log_id == 1))
        .count();
    assert!(slow >= 1, "expected slow replies after promotion");
}

#[test]
fn duplicate_req_key_yields_one_log_id_and_a_cached_reply() {
    let cluster = Cluster::start();

    let body = request(BASE_US - 10_000, 7, 0);
    cluster.send_to(0, body.clone());
    cluster.settle("leader orders the request", |c| {
        c.replica(0).max_synced_log_id() == 1
    });

    // The retry carries the same req key (and a fresh deadline).
    let retry = request(BASE_US - 2_000, 7, 0);
    cluster.send_to(0, retry);
    cluster.wait_local("cached reply is re-sent", |c| {
        c.hub
            .replies_for(9000)
            .iter()
            .filter(|r| matches!(r, ReplyMessage::Fast(_)))
            .count()
            >= 2
    });

    assert_eq!(cluster.replica(0).max_synced_log_id(), 1);
    assert_eq!(cluster.replica(0).synced_log_id_of(7), Some(1));

    let fast: Vec<_> = cluster
        .hub
        .replies_for(9000)
        .into_iter()
        .filter_map(|r| match r {
            ReplyMessage::Fast(f) => Some(f),
            _ => None,
        })
        .collect();
    // Original reply plus at least one cached re-reply, all naming the
    // same log id and result.
    assert!(fast.len() >= 2, "expected a re-reply, got {}", fast.len());
    assert!(fast.iter().all(|f| f.log_id == 1));
    assert!(fast
        .iter()
        .all(|f| f.result.as_deref() == Some(b"cmd-7".as_ref())));
}

#[test]
fn owd_estimate_reaches_replies_after_the_window_fills() {
    let cluster = Cluster::start();

    // Window length is 2; the second sample publishes an estimate.
    cluster.send_to(0, request(BASE_US - 30_000, 21, 0));
    cluster.send_to(0, request(BASE_US - 20_000, 22, 1));
    cluster.settle("leader orders both", |c| {
        c.replica(0).max_synced_log_id() == 2
    });
    cluster.settle("owd estimate published", |c| {
        c.replica(0).owd_estimate(9000).is_some()
    });

    // The conservative estimate is the window max: the 30ms-late request
    // plus the 1ms headroom.
    assert_eq!(cluster.replica(0).owd_estimate(9000), Some(31_000));
}
