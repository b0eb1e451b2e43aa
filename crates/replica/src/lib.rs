//! The Nezha replica engine.
//!
//! A replica ingests deadline-stamped client requests, agrees with its
//! peers on the order `(deadline, reqKey)` derives, executes against an
//! injected application state machine, and replies to client proxies
//! through a fast path (prefix provably matches the leader) or a slow path
//! (after index sync). The engine also runs view change, crash recovery,
//! periodic commit, and garbage collection.
//!
//! Sockets, timers, and the wire codec are external: the embedding event
//! loop feeds decoded messages into [`Replica::receive_client_request`] and
//! [`Replica::receive_peer_message`], fires [`Replica::on_timer`] for
//! timers the engine arms through [`TimerDriver`], and provides a
//! [`Transport`] for outbound sends. Peer-message dispatch and timer
//! callbacks must come from one thread, which acts as the protocol's
//! master thread. Every other role runs on its own worker thread behind a
//! queue: processor, fast/slow reply shards, index send and recv, the
//! missed-index and missed-req ack servers, garbage collection, and OWD
//! calculation.

mod config;
mod gate;
mod gc;
mod index;
mod master;
mod owd;
mod processor;
mod replica;
mod seams;

pub use config::ReplicaConfig;
pub use gate::Status;
pub use owd::OwdEstimator;
pub use replica::Replica;
pub use seams::{Clock, EchoApp, StateMachine, SystemClock, TimerDriver, TimerKind, Transport};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(&'static str),
    #[error("failed to read config file {path}")]
    ConfigIo {
        path: std::path::PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to parse config file {path}")]
    ConfigParse {
        path: std::path::PathBuf,
        #[source]
        err: serde_yaml::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
