use bytes::Bytes;
use ordlog::{Log, NO_NEXT};
use proto_nezha::{Digest, RequestBody};
use quickcheck::quickcheck;

const KEY_NUM: u32 = 4;

// Compact generator domain: tiny deadline/key ranges force collisions,
// duplicates, and inversions.
fn body(deadline: u8, req_key: u8, op_key: u8) -> RequestBody {
    RequestBody {
        deadline: deadline as u64,
        req_key: req_key as u64,
        op_key: op_key as u32 % KEY_NUM,
        proxy_id: 0,
        command: Bytes::from_static(b"x"),
    }
}

// Append every input in sequence, letting the log accept or reject each.
fn build_log(input: &[(u8, u8, u8)]) -> Log {
    let log = Log::new(KEY_NUM);
    for (d, r, k) in input {
        // Rejected appends (duplicates, inversions) must leave no trace;
        // the properties below hold over whatever was accepted.
        let _ = log.append(body(*d, *r, *k), Bytes::new());
    }
    log
}

quickcheck! {
    fn accepted_entries_are_totally_ordered(input: Vec<(u8, u8, u8)>) -> bool {
        let log = build_log(&input);
        let entries = log.collect_range(1, log.max_log_id());

        entries
            .windows(2)
            .all(|w| w[0].body.order_key() < w[1].body.order_key())
    }

    fn chained_hash_is_the_running_xor(input: Vec<(u8, u8, u8)>) -> bool {
        let log = build_log(&input);
        let entries = log.collect_range(1, log.max_log_id());

        let mut acc = Digest::ZERO;
        for entry in &entries {
            acc.xor(&Digest::of_request(entry.body.deadline, entry.body.req_key));
            if entry.chained != acc || entry.my_hash != Digest::of_request(entry.body.deadline, entry.body.req_key) {
                return false;
            }
        }
        log.tail().chained == acc
    }

    fn req_keys_are_unique_across_the_log(input: Vec<(u8, u8, u8)>) -> bool {
        let log = build_log(&input);
        let entries = log.collect_range(1, log.max_log_id());

        let mut seen = std::collections::HashSet::new();
        entries.iter().all(|e| seen.insert(e.body.req_key))
            && entries
                .iter()
                .all(|e| log.log_id_of_req(e.body.req_key) == Some(e.log_id))
    }

    fn per_key_chain_visits_exactly_the_keys_entries(input: Vec<(u8, u8, u8)>) -> bool {
        let log = build_log(&input);
        let entries = log.collect_range(1, log.max_log_id());

        for op_key in 0..KEY_NUM {
            let expect: Vec<u32> = entries
                .iter()
                .filter(|e| e.body.op_key == op_key)
                .map(|e| e.log_id)
                .collect();

            // Walk the chain forward from the per-key minimum.
            let mut walked = Vec::new();
            let mut cursor = log.min_log_id_of_key(op_key);
            while cursor != 0 && cursor != NO_NEXT {
                let Some(entry) = log.get(cursor) else { return false };
                walked.push(cursor);
                cursor = entry.next_by_key();
            }

            if walked != expect {
                return false;
            }
            let tail = log.max_log_id_of_key(op_key);
            if tail != expect.last().copied().unwrap_or(0) {
                return false;
            }
        }
        true
    }

    fn reclaim_preserves_the_surviving_suffix(input: Vec<(u8, u8, u8)>, cut: u8) -> bool {
        let log = build_log(&input);
        let before = log.collect_range(1, log.max_log_id());
        let cut = cut as u32 % (log.max_log_id() + 1);

        log.reclaim_through(cut);

        let after = log.collect_range(1, log.max_log_id());
        let expect: Vec<u32> = before
            .iter()
            .map(|e| e.log_id)
            .filter(|id| *id > cut)
            .collect();
        let got: Vec<u32> = after.iter().map(|e| e.log_id).collect();

        // Survivors are untouched, reclaimed req keys are forgotten, and
        // no survivor's per-key links reach into the reclaimed range.
        got == expect
            && before
                .iter()
                .filter(|e| e.log_id <= cut)
                .all(|e| !log.contains_req(e.body.req_key))
            && after.iter().all(|e| {
                let prev = e.prev_by_key();
                prev == 0 || prev > cut
            })
    }
}
