use crate::replica::Inner;
use bytes::Bytes;
use proto_nezha::RequestBody;
use std::time::Duration;

// Requests admitted from the ingest queue per cycle, bounding the latency
// of the deadline-release scan behind a burst.
const ADMIT_BATCH: usize = 128;

/// One processor cycle: admit queued requests into the early buffer, then
/// release everything whose deadline has passed the release horizon.
///
/// The processor is the single writer of the early buffer, of the leader's
/// synced log, and of a follower's unsynced log.
pub(crate) fn step(inner: &Inner) {
    if let Ok(body) = inner.process_rx.recv_timeout(Duration::from_millis(1)) {
        admit(inner, body);
        for body in inner.process_rx.try_iter().take(ADMIT_BATCH - 1) {
            admit(inner, body);
        }
    }

    // Release horizon: everything stamped at or before `now - headroom` is
    // releasable. A request that could still arrive with an earlier
    // `(deadline, reqKey)` would have to exceed the headroom's one-way
    // delay bound, and such stragglers take the late path instead.
    let horizon = inner
        .now_micros()
        .saturating_sub(inner.config.owd_headroom.as_micros() as u64);
    let released = inner.early.lock().release_through(horizon);
    for body in released {
        release(inner, body);
    }
}

fn admit(inner: &Inner, body: RequestBody) {
    // A req key already in a log means a duplicate slipped past the
    // receiver; re-reply with the existing entry rather than re-ordering.
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

    let leader = inner.am_leader();
    let released_tail = if leader {
        inner.synced.last_order_key()
    } else {
        inner.unsynced.last_order_key()
    };
    if body.order_key() <= released_tail && released_tail != (0, 0) {
        if leader {
            // The leader defines the order; a request past its release
            // point cannot be placed. The client re-stamps on retry.
            tracing::trace!(
                req_key = body.req_key,
                deadline = body.deadline,
                "late request at leader, dropping for client retry"
            );
        } else {
            // Followers hold on to it: the leader may still order it, and
            // index sync will then promote straight from the late buffer.
            inner.late.insert(body);
        }
        return;
    }

    inner.early.lock().insert(body);
}

fn release(inner: &Inner, body: RequestBody) {
    // Index sync may have promoted this req key while it sat in the early
    // buffer; the agreed entry wins.
    if let Some(entry) = inner.synced.get_by_req(body.req_key) {
        inner.enqueue_fast_reply(entry);
        return;
    }

    let leader = inner.am_leader();
    let key = body.order_key();
    let op_key = body.op_key;

    let released_tail = if leader {
        inner.synced.last_order_key()
    } else {
        inner.unsynced.last_order_key()
    };
    if key <= released_tail && released_tail != (0, 0) {
        if !leader {
            inner.late.insert(body);
        }
        return;
    }

    // The leader executes at release; a follower defers execution until
    // index sync promotes the entry.
    let appended = if leader {
        let result = inner.app.execute(&body);
        inner.synced.append(body, result)
    } else {
        inner.unsynced.append(body, Bytes::new())
    };

    match appended {
        Ok(entry) => {
            let mut last = inner.last_released_by_key.lock();
            if let Some(slot) = last.get_mut(op_key as usize) {
                *slot = key;
            }
            drop(last);
            inner.enqueue_fast_reply(entry);
        }
        Err(err) => {
            tracing::debug!(error = %err, "dropping unreleasable request");
        }
    }
}
