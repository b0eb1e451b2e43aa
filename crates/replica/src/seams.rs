use bytes::Bytes;
use proto_nezha::{PeerMessage, ReplicaId, ReplyMessage, RequestBody};
use std::net::SocketAddr;
use std::time::Duration;

/// Microsecond wall-clock source. Injected so tests can drive the release
/// horizon deterministically.
pub trait Clock: Send + Sync + 'static {
    fn now_micros(&self) -> u64;
}

/// The real clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// Outbound side of the replica's endpoints. The sockets themselves, their
/// event loop, and the wire codec live outside the engine; sends must never
/// block (drop on pressure, peers and clients retry).
pub trait Transport: Send + Sync + 'static {
    fn send_to_replica(&self, to: ReplicaId, msg: PeerMessage);
    fn send_to_proxy(&self, addr: SocketAddr, msg: ReplyMessage);
}

/// Timers the engine registers with the external event loop. `arm` is
/// one-shot: the handler re-arms recurring timers from `Replica::on_timer`.
pub trait TimerDriver: Send + Sync + 'static {
    fn arm(&self, timer: TimerKind, after: Duration);
    fn cancel(&self, timer: TimerKind);
}

/// Every timer the engine owns. The event loop calls
/// [`crate::Replica::on_timer`] with the kind when one fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Follower-side leader liveness check.
    HeartbeatCheck,
    /// Follower sync-status report / leader commit broadcast.
    PeriodicSync,
    /// Re-ask for missing index records.
    IndexAsk,
    /// Re-ask for missing request bodies.
    RequestAsk,
    /// Re-broadcast view-change messages while a view change is pending.
    ViewChange,
    /// Re-send an unanswered state-transfer request.
    StateTransfer,
    /// Re-broadcast the recovery crash-vector gather.
    CrashVectorRequest,
    /// Re-broadcast the recovery request.
    RecoveryRequest,
}

/// The replicated application. Execution must be deterministic: every
/// replica applies the same commands in the same order and must reach the
/// same results.
pub trait StateMachine: Send + Sync + 'static {
    fn execute(&self, request: &RequestBody) -> Bytes;
}

/// Trivial state machine that echoes the command back. Handy as a harness
/// application and for wiring tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoApp;

impl StateMachine for EchoApp {
    fn execute(&self, request: &RequestBody) -> Bytes {
        request.command.clone()
    }
}
