use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

thread_local! {
    static IS_WORKER: Cell<bool> = Cell::new(false);
}

/// Tag the calling thread as one of the gated workers. Drain logic needs
/// to know: a worker that escalates into the master path (index divergence
/// triggering a view change) cannot wait for itself to park.
pub(crate) fn mark_worker_thread() {
    IS_WORKER.with(|w| w.set(true));
}

pub(crate) fn on_worker_thread() -> bool {
    IS_WORKER.with(|w| w.get())
}

/// Replica lifecycle status. Worker threads only mutate log state while
/// NORMAL; the master parks them through the other states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Normal = 0,
    ViewChange = 1,
    Recovering = 2,
    Terminated = 3,
}

impl Status {
    fn from_u8(raw: u8) -> Status {
        match raw {
            0 => Status::Normal,
            1 => Status::ViewChange,
            2 => Status::Recovering,
            _ => Status::Terminated,
        }
    }
}

/// The status word plus the worker gate.
///
/// Every worker samples the status once per iteration via [`pause_point`].
/// On a non-NORMAL status it signs off the active-worker count and parks on
/// the condvar; the master flips the status and then [`wait_drain`]s until
/// the count reaches zero, after which it alone may mutate shared log
/// state.
pub struct StatusGate {
    status: AtomicU8,
    active: AtomicU32,
    mu: Mutex<()>,
    worker_cv: Condvar,
    drain_cv: Condvar,
}

impl StatusGate {
    pub fn new(initial: Status) -> Self {
        Self {
            status: AtomicU8::new(initial as u8),
            active: AtomicU32::new(0),
            mu: Mutex::new(()),
            worker_cv: Condvar::new(),
            drain_cv: Condvar::new(),
        }
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: Status) {
        let _guard = self.mu.lock();
        self.status.store(status as u8, Ordering::Release);
        self.worker_cv.notify_all();
        self.drain_cv.notify_all();
    }

    /// A worker announces itself before its first iteration.
    pub fn register_worker(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    /// A worker leaving its loop for good signs off.
    pub fn deregister_worker(&self) {
        let _guard = self.mu.lock();
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.drain_cv.notify_all();
    }

    /// Worker iteration preamble: park while the status is neither NORMAL
    /// nor TERMINATED. Returns the status in effect when the worker may
    /// proceed (Normal) or must exit (Terminated).
    pub fn pause_point(&self) -> Status {
        loop {
            match self.status() {
                Status::Normal => return Status::Normal,
                Status::Terminated => return Status::Terminated,
                Status::ViewChange | Status::Recovering => {
                    let mut guard = self.mu.lock();
                    // Re-check under the lock so a wake between the sample
                    // and the park is not lost.
                    let raw = Status::from_u8(self.status.load(Ordering::Acquire));
                    if raw == Status::ViewChange || raw == Status::Recovering {
                        self.active.fetch_sub(1, Ordering::AcqRel);
                        self.drain_cv.notify_all();
                        self.worker_cv.wait(&mut guard);
                        self.active.fetch_add(1, Ordering::AcqRel);
                    }
                }
            }
        }
    }

    /// Master side: block until every worker has parked (or exited). When
    /// the caller is itself a worker (an index worker escalating a
    /// divergence into a view change), it is excluded from the count: it
    /// mutates under the master lock and parks as soon as it returns to
    /// its loop.
    pub fn wait_drain(&self) {
        let floor = if on_worker_thread() { 1 } else { 0 };
        let mut guard = self.mu.lock();
        while self.active.load(Ordering::Acquire) > floor {
            self.drain_cv.wait(&mut guard);
        }
    }

    pub fn active_workers(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn workers_drain_on_view_change_and_resume_on_normal() {
        let gate = Arc::new(StatusGate::new(Status::Normal));
        let iterations = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let gate = gate.clone();
            let iterations = iterations.clone();
            gate.register_worker();
            handles.push(std::thread::spawn(move || loop {
                match gate.pause_point() {
                    Status::Terminated => {
                        gate.deregister_worker();
                        return;
                    }
                    _ => {
                        iterations.fetch_add(1, Ordering::AcqRel);
                        std::thread::sleep(Duration::from_micros(50));
                    }
                }
            }));
        }

        gate.set_status(Status::ViewChange);
        gate.wait_drain();
        assert_eq!(gate.active_workers(), 0);

        // No worker iterates while drained.
        let settled = iterations.load(Ordering::Acquire);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(iterations.load(Ordering::Acquire), settled);

        gate.set_status(Status::Normal);
        std::thread::sleep(Duration::from_millis(10));
        assert!(iterations.load(Ordering::Acquire) > settled);

        gate.set_status(Status::Terminated);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(gate.active_workers(), 0);
    }
}
