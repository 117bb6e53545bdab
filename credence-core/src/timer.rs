//! ## credence-core::timer
//! **Single ordered callback queue for every tracked node**
//!
//! Nodes never own timers. A node that wants to be looked at again pushes a
//! `(time, target)` entry into the tracker's [`CallbackQueue`]; entries carry
//! the generation of the node's timer so that superseded entries are skipped
//! when they come due. The queue also drives the periodic flush.
//!
//! Under a [`SimulatedClock`](crate::clock::SimulatedClock) the due entries
//! are fired inside `advance`. Any other clock gets a dedicated dispatcher
//! thread that sleeps on a condition variable until the earliest deadline.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::clock::{AbsTime, Clock, TimerDriver};
use crate::node_id::NodeId;

/// What a queue entry wakes up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Target {
    /// Re-evaluate a node's callbacks, unless its timer generation moved on.
    Node { id: NodeId, generation: u64 },
    /// Persist all live balances.
    Flush,
}

#[derive(Debug)]
struct Scheduled {
    at: AbsTime,
    seq: u64,
    target: Target,
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order: earlier entries have higher priority.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
    stopped: bool,
}

/// Min-heap of pending entries keyed by `(fire time, insertion order)`.
#[derive(Default)]
pub(crate) struct CallbackQueue {
    state: Mutex<QueueState>,
    wake: Condvar,
}

impl CallbackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, at: AbsTime, target: Target) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Scheduled { at, seq, target });
        self.wake.notify_one();
    }

    pub fn next_deadline(&self) -> Option<AbsTime> {
        let state = self.state.lock();
        if state.stopped {
            return None;
        }
        state.heap.peek().map(|entry| entry.at)
    }

    /// Removes and returns the earliest entry if it is due at `now`.
    pub fn pop_due(&self, now: AbsTime) -> Option<Target> {
        let mut state = self.state.lock();
        if state.stopped || state.heap.peek().map_or(true, |entry| entry.at > now) {
            return None;
        }
        state.heap.pop().map(|entry| entry.target)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Drops every pending entry and wakes the dispatcher so it can exit.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        state.heap.clear();
        self.wake.notify_all();
    }

    #[cfg(test)]
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Blocks until the earliest entry is due. Returns `false` once stopped.
    fn wait_due(&self, clock: &dyn Clock) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return false;
            }
            match state.heap.peek().map(|entry| entry.at) {
                None => self.wake.wait(&mut state),
                Some(at) => {
                    let now = clock.now();
                    if at <= now {
                        return true;
                    }
                    self.wake.wait_for(&mut state, at - now);
                }
            }
        }
    }
}

/// Starts the real-time dispatcher. The thread holds only a weak reference
/// to the driver and exits when the queue is stopped or the driver is gone.
pub(crate) fn spawn_dispatcher(
    queue: Arc<CallbackQueue>,
    clock: Arc<dyn Clock>,
    driver: Weak<dyn TimerDriver>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("credence-dispatcher".into())
        .spawn(move || {
            tracing::debug!("Callback dispatcher started");
            while queue.wait_due(clock.as_ref()) {
                let Some(driver) = driver.upgrade() else {
                    break;
                };
                driver.fire_due(clock.now());
            }
            tracing::debug!("Callback dispatcher stopped");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::time::{Duration, Instant};

    fn node(index: u64, generation: u64) -> Target {
        Target::Node {
            id: NodeId::from_index(index),
            generation,
        }
    }

    #[test]
    fn pops_in_time_then_insertion_order() {
        let queue = CallbackQueue::new();
        queue.schedule(AbsTime(20), node(1, 0));
        queue.schedule(AbsTime(10), node(2, 0));
        queue.schedule(AbsTime(20), Target::Flush);

        assert_eq!(queue.next_deadline(), Some(AbsTime(10)));
        assert_eq!(queue.pop_due(AbsTime(5)), None);
        assert_eq!(queue.pop_due(AbsTime(25)), Some(node(2, 0)));
        assert_eq!(queue.pop_due(AbsTime(25)), Some(node(1, 0)));
        assert_eq!(queue.pop_due(AbsTime(25)), Some(Target::Flush));
        assert_eq!(queue.pop_due(AbsTime(25)), None);
    }

    #[test]
    fn stopped_queue_rejects_entries() {
        let queue = CallbackQueue::new();
        queue.schedule(AbsTime(1), Target::Flush);
        queue.stop();
        queue.schedule(AbsTime(2), Target::Flush);
        assert!(queue.is_stopped());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.next_deadline(), None);
    }

    struct Counter {
        queue: Arc<CallbackQueue>,
        fired: Mutex<Vec<Target>>,
    }

    impl TimerDriver for Counter {
        fn next_deadline(&self) -> Option<AbsTime> {
            self.queue.next_deadline()
        }

        fn fire_due(&self, now: AbsTime) {
            while let Some(target) = self.queue.pop_due(now) {
                self.fired.lock().push(target);
            }
        }
    }

    #[test]
    fn dispatcher_fires_on_the_wall_clock() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let queue = Arc::new(CallbackQueue::new());
        let counter = Arc::new(Counter {
            queue: queue.clone(),
            fired: Mutex::new(Vec::new()),
        });
        let driver: Weak<dyn TimerDriver> = Arc::downgrade(&counter) as Weak<dyn TimerDriver>;
        let handle = spawn_dispatcher(queue.clone(), clock.clone(), driver).unwrap();

        queue.schedule(clock.now() + Duration::from_millis(20), node(7, 1));

        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.fired.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*counter.fired.lock(), vec![node(7, 1)]);

        queue.stop();
        handle.join().unwrap();
    }
}
