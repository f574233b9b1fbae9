use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::shard::CallHandle;
use crate::Error;

/// Slack below which a firing timer is considered genuinely expired.
/// A deadline further out than this means the timer was extended after
/// the heap node was queued, and the node re-arms instead.
pub(crate) const FIRE_GRACE: Duration = Duration::from_millis(100);

/// How a state transition programs the entry timer.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum TimerPolicy {
    /// The new timeout replaces the old one, shorter or longer.
    Force,
    /// The timeout may only move further out. Retransmissions and
    /// ignored in-dialog messages use this, so they cannot cut a
    /// dialog's life short.
    ExtendOnly,
}

/// The per-entry timer state, protected by the entry's shard mutex.
/// Cancellation is lazy: stopping or extending just updates this slot,
/// and queued heap nodes discover it when they fire.
#[derive(Copy, Clone, Debug)]
pub(crate) struct TimerSlot {
    pub expires: Instant,
    /// No further firing is wanted (stopped, or already fired).
    pub done: bool,
    /// The expiry callback committed to firing. Once set, the entry is
    /// on its way out and must not be relied on.
    pub fired: bool,
}

impl TimerSlot {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            expires: now,
            done: true,
            fired: false,
        }
    }

    /// Program the first deadline. The caller schedules a heap node for
    /// `expires` afterwards.
    pub(crate) fn init(&mut self, now: Instant, after: Duration) {
        self.expires = now + after;
        self.done = false;
        self.fired = false;
    }

    /// Move the deadline. Returns true when the caller must queue a new
    /// heap node (the deadline moved earlier than the queued one);
    /// extensions are picked up lazily by the node already queued.
    #[must_use]
    pub(crate) fn update(&mut self, now: Instant, after: Duration, policy: TimerPolicy) -> bool {
        let new = now + after;
        match policy {
            TimerPolicy::ExtendOnly => {
                if new > self.expires {
                    self.expires = new;
                }
                false
            }
            TimerPolicy::Force => {
                let shortened = new < self.expires;
                self.expires = new;
                shortened && !self.done
            }
        }
    }

    /// Try to cancel. Succeeds unless the expiry callback has already
    /// committed to firing; in that case the caller must treat the
    /// entry as about to disappear.
    pub(crate) fn try_stop(&mut self) -> bool {
        if self.fired {
            return false;
        }
        self.done = true;
        true
    }
}

#[derive(PartialEq, Eq)]
pub(crate) struct Deadline {
    pub when: Instant,
    pub target: CallHandle,
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.when
            .cmp(&other.when)
            .then_with(|| self.target.slot.cmp(&other.target.slot))
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The shared deadline queue feeding the timer service thread. Leaf
/// lock: it is taken under shard mutexes (to queue) but the service
/// never resolves a target while holding it.
pub(crate) struct TimerQueue {
    heap: Mutex<BinaryHeap<Reverse<Deadline>>>,
    cond: Condvar,
    shutdown: AtomicBool,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Queue a deadline. Fails only once the tracker is shutting down.
    pub(crate) fn schedule(&self, when: Instant, target: CallHandle) -> Result<(), Error> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::TimerStart);
        }
        self.heap
            .lock()
            .unwrap()
            .push(Reverse(Deadline { when, target }));
        self.cond.notify_one();
        Ok(())
    }

    /// Block until a deadline is due, then pop it. Returns None once the
    /// queue shuts down. Never called with any shard lock held, and the
    /// heap lock is released before the caller touches a shard.
    pub(crate) fn next_due(&self) -> Option<Deadline> {
        let mut heap = self.heap.lock().unwrap();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            let now = Instant::now();
            let next_when = heap.peek().map(|Reverse(d)| d.when);
            match next_when {
                Some(when) if when <= now => {
                    let Reverse(d) = heap.pop().unwrap();
                    return Some(d);
                }
                Some(when) => {
                    let (g, _) = self.cond.wait_timeout(heap, when - now).unwrap();
                    heap = g;
                }
                None => {
                    heap = self.cond.wait(heap).unwrap();
                }
            }
        }
    }

    pub(crate) fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.cond.notify_all();
    }
}
