//! Stop-the-world coordination.
//!
//! Every attached mutator is registered here. A thread that wants a
//! collection calls [`PauseCoordinator::begin_collection`]; it either becomes
//! the collector, or, if another collection is already underway, parks until
//! that one finishes. The collector raises the `requested` flag and waits
//! until every registered thread is stopped: parked at a safepoint, or
//! inside a safe region (blocking call, finalizer wait, contended lock).
//!
//! A thread that never polls delays the pause; the collector only waits,
//! logging a warning every `safepoint_timeout`.
//!
//! # Lock Ordering
//!
//! The coordination lock is taken before the heap state lock and is never
//! requested while the heap state lock is held.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::gc::pause::PauseLog;
use crate::mutator::MutatorId;
use crate::roots::RootStack;

/// Thread is running mutator code.
pub(crate) const THREAD_STATE_EXECUTING: u8 = 0;
/// Thread is parked at a safepoint.
pub(crate) const THREAD_STATE_SAFEPOINT: u8 = 1;
/// Thread is in a safe region and does not touch the heap.
pub(crate) const THREAD_STATE_SAFE_REGION: u8 = 2;

/// Shared per-mutator state visible to the collector.
#[derive(Debug)]
pub(crate) struct MutatorState {
    pub id: MutatorId,
    pub roots: Mutex<RootStack>,
    state: AtomicU8,
}

impl MutatorState {
    pub fn new(id: MutatorId) -> Self {
        Self {
            id,
            roots: Mutex::new(RootStack::new()),
            state: AtomicU8::new(THREAD_STATE_EXECUTING),
        }
    }

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct Coordination {
    threads: Vec<Arc<MutatorState>>,
    /// Registered threads currently stopped, including the collector.
    stopped: usize,
    collecting: bool,
    /// Completed collections; waiters resume when it changes.
    epoch: u64,
}

/// The pause coordinator of one heap.
#[derive(Debug)]
pub(crate) struct PauseCoordinator {
    requested: CachePadded<AtomicBool>,
    inner: Mutex<Coordination>,
    cond: Condvar,
    timeout: Duration,
}

impl PauseCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            requested: CachePadded::new(AtomicBool::new(false)),
            inner: Mutex::new(Coordination::default()),
            cond: Condvar::new(),
            timeout,
        }
    }

    /// Whether a pause is being requested. Mutators poll this.
    #[inline]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Registers a thread. Waits out an in-progress collection so a new
    /// thread never joins mid-trace.
    pub fn register(&self, state: Arc<MutatorState>) {
        let mut inner = self.inner.lock();
        while inner.collecting {
            self.cond.wait(&mut inner);
        }
        inner.threads.push(state);
    }

    /// Removes a thread. The thread is executing, so the collector may be
    /// waiting on it; removal lets that wait complete.
    pub fn unregister(&self, id: MutatorId) {
        let mut inner = self.inner.lock();
        inner.threads.retain(|t| t.id != id);
        self.cond.notify_all();
    }

    pub fn thread_count(&self) -> usize {
        self.inner.lock().threads.len()
    }

    /// Registered threads; only stable while a collection holds the pause.
    pub fn threads(&self) -> Vec<Arc<MutatorState>> {
        self.inner.lock().threads.clone()
    }

    /// Parks `me` if a pause is in progress. Returns once the collection
    /// has finished.
    pub fn safepoint(&self, me: &MutatorState, log: &PauseLog) {
        if !self.is_requested() {
            return;
        }
        let mut inner = self.inner.lock();
        if !inner.collecting {
            return;
        }
        let start = Instant::now();
        me.set_state(THREAD_STATE_SAFEPOINT);
        inner.stopped += 1;
        self.cond.notify_all();

        let epoch = inner.epoch;
        while inner.epoch == epoch {
            self.cond.wait(&mut inner);
        }
        inner.stopped -= 1;
        me.set_state(THREAD_STATE_EXECUTING);
        drop(inner);
        log.record(me.id, start, Instant::now());
    }

    /// Marks `me` as stopped for the duration of a blocking operation.
    pub fn enter_safe_region(&self, me: &MutatorState) {
        let mut inner = self.inner.lock();
        me.set_state(THREAD_STATE_SAFE_REGION);
        inner.stopped += 1;
        self.cond.notify_all();
    }

    /// Leaves a safe region, waiting for an in-progress collection first.
    pub fn leave_safe_region(&self, me: &MutatorState, log: &PauseLog) {
        let mut inner = self.inner.lock();
        let start = Instant::now();
        let waited = inner.collecting;
        while inner.collecting {
            self.cond.wait(&mut inner);
        }
        inner.stopped -= 1;
        me.set_state(THREAD_STATE_EXECUTING);
        drop(inner);
        if waited {
            log.record(me.id, start, Instant::now());
        }
    }

    /// Tries to become the collector.
    ///
    /// Returns `true` once every registered thread is stopped; the caller
    /// must then run the collection and call [`end_collection`]. Returns
    /// `false` after waiting out a collection started by another thread.
    ///
    /// [`end_collection`]: Self::end_collection
    pub fn begin_collection(&self, me: Option<&MutatorState>, log: &PauseLog) -> bool {
        let mut inner = self.inner.lock();
        if inner.collecting {
            let start = Instant::now();
            if let Some(me) = me {
                me.set_state(THREAD_STATE_SAFEPOINT);
                inner.stopped += 1;
                self.cond.notify_all();
            }
            let epoch = inner.epoch;
            while inner.epoch == epoch {
                self.cond.wait(&mut inner);
            }
            if let Some(me) = me {
                inner.stopped -= 1;
                me.set_state(THREAD_STATE_EXECUTING);
                drop(inner);
                log.record(me.id, start, Instant::now());
            }
            return false;
        }

        inner.collecting = true;
        self.requested.store(true, Ordering::Release);
        if let Some(me) = me {
            me.set_state(THREAD_STATE_SAFEPOINT);
            inner.stopped += 1;
        }

        let wait_start = Instant::now();
        while inner.stopped < inner.threads.len() {
            let timed_out = self.cond.wait_for(&mut inner, self.timeout).timed_out();
            if timed_out && inner.stopped < inner.threads.len() {
                crate::tracing::internal::log_safepoint_timeout(
                    inner.threads.len() - inner.stopped,
                    wait_start.elapsed(),
                );
            }
        }
        true
    }

    /// Ends the pause started by a successful [`begin_collection`] and
    /// resumes every parked thread.
    ///
    /// [`begin_collection`]: Self::begin_collection
    pub fn end_collection(&self, me: Option<&MutatorState>) {
        let mut inner = self.inner.lock();
        inner.collecting = false;
        inner.epoch += 1;
        self.requested.store(false, Ordering::Release);
        if let Some(me) = me {
            inner.stopped -= 1;
            me.set_state(THREAD_STATE_EXECUTING);
        }
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn log() -> PauseLog {
        PauseLog::new(Duration::ZERO, 64)
    }

    #[test]
    fn test_collect_with_no_threads() {
        let coord = PauseCoordinator::new(Duration::from_secs(1));
        let log = log();
        assert!(coord.begin_collection(None, &log));
        assert!(coord.is_requested());
        coord.end_collection(None);
        assert!(!coord.is_requested());
    }

    #[test]
    fn test_collector_counts_itself() {
        let coord = PauseCoordinator::new(Duration::from_secs(1));
        let log = log();
        let me = Arc::new(MutatorState::new(MutatorId::from_raw(1)));
        coord.register(me.clone());

        assert!(coord.begin_collection(Some(&me), &log));
        assert_eq!(me.state(), THREAD_STATE_SAFEPOINT);
        coord.end_collection(Some(&me));
        assert_eq!(me.state(), THREAD_STATE_EXECUTING);
    }

    #[test]
    fn test_safe_region_counts_as_stopped() {
        let coord = PauseCoordinator::new(Duration::from_secs(1));
        let log = log();
        let other = Arc::new(MutatorState::new(MutatorId::from_raw(2)));
        coord.register(other.clone());
        coord.enter_safe_region(&other);

        assert!(coord.begin_collection(None, &log));
        coord.end_collection(None);

        coord.leave_safe_region(&other, &log);
        assert_eq!(other.state(), THREAD_STATE_EXECUTING);
    }

    #[test]
    fn test_polling_thread_parks_until_resumed() {
        let coord = Arc::new(PauseCoordinator::new(Duration::from_millis(50)));
        let log = Arc::new(log());
        let worker = Arc::new(MutatorState::new(MutatorId::from_raw(3)));
        coord.register(worker.clone());

        let polls = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let (coord, log, worker, polls, stop) =
                (coord.clone(), log.clone(), worker.clone(), polls.clone(), stop.clone());
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    coord.safepoint(&worker, &log);
                    polls.fetch_add(1, Ordering::Relaxed);
                    thread::yield_now();
                }
                coord.unregister(worker.id);
            })
        };

        assert!(coord.begin_collection(None, &log));
        assert_eq!(worker.state(), THREAD_STATE_SAFEPOINT);
        let frozen = polls.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(polls.load(Ordering::Relaxed), frozen);
        coord.end_collection(None);

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
        assert_eq!(coord.thread_count(), 0);
        assert!(log.snapshot().iter().any(|p| p.thread == worker.id));
    }

    #[test]
    fn test_second_requester_waits_for_first() {
        let coord = Arc::new(PauseCoordinator::new(Duration::from_secs(1)));
        let log = Arc::new(log());
        let a = Arc::new(MutatorState::new(MutatorId::from_raw(4)));
        coord.register(a.clone());

        assert!(coord.begin_collection(Some(&a), &log));
        let handle = {
            let (coord, log) = (coord.clone(), log.clone());
            thread::spawn(move || coord.begin_collection(None, &log))
        };
        thread::sleep(Duration::from_millis(10));
        coord.end_collection(Some(&a));

        assert!(!handle.join().unwrap());
    }
}
