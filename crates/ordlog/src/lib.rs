//! Deadline-ordered dual log.
//!
//! A replica keeps two append-only logs keyed by monotonically increasing
//! log id: the synced log (entries it believes are agreed under the current
//! view) and, on followers, the unsynced log (entries released locally but
//! not yet confirmed by the leader's index stream). Entries carry a
//! per-entry digest and an accumulative XOR chain over the whole log, plus a
//! per-`opKey` chain linking non-commuting entries.
//!
//! Writers are single-threaded per log (the processor for the early buffer
//! and one log, index-sync application for the other); every other worker
//! only reads. Reads go through concurrent maps and published watermark
//! atomics, so they see a stable snapshot without locking the writer.

mod buffer;
mod crash_vector;
mod entry;
mod log;

pub use buffer::{EarlyBuffer, LateBuffer};
pub use crash_vector::{CrashVector, CrashVectorStore};
pub use entry::{LogEntry, NO_NEXT, NO_PREV};
pub use log::Log;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request {req_key} is already in the log")]
    DuplicateRequest { req_key: u64 },
    #[error(
        "request ({deadline}, {req_key}) does not follow the log tail ({tail_deadline}, {tail_req_key})"
    )]
    OutOfOrder {
        deadline: u64,
        req_key: u64,
        tail_deadline: u64,
        tail_req_key: u64,
    },
    #[error("op key {op_key} is outside the configured key space of {key_num}")]
    UnknownOpKey { op_key: u32, key_num: u32 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
