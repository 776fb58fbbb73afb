//! Deadline Timer
//!
//! One background thread owns a min-heap of deadlines and runs each callback
//! once its deadline passes. Used for request deadlines and behavior receive
//! timeouts. A callback whose work is done before its deadline (request
//! resolved, timeout generation superseded) is cancelled through its
//! [`TimerId`], which releases the callback at once; stale heap keys are
//! skipped when they surface and compacted away when they pile up.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

type Callback = Box<dyn FnOnce() + Send>;

/// Heap keys tolerated beyond twice the live callbacks before compaction
const COMPACTION_SLACK: usize = 64;

/// `now + timeout`, or `None` if that lies beyond what `Instant` can hold
///
/// Callers treat `None` as "no deadline".
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// Whole milliseconds of `duration`, saturating at `u64::MAX`
pub(crate) fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Handle of a scheduled callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimerEntry {
    deadline: Instant,
    /// Insertion order; keeps equal deadlines FIFO
    sequence: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    callbacks: HashMap<u64, Callback>,
    next_sequence: u64,
    shutdown: bool,
}

impl TimerQueue {
    fn compact(&mut self) {
        if self.heap.len() > 2 * self.callbacks.len() + COMPACTION_SLACK {
            let callbacks = &self.callbacks;
            self.heap.retain(|entry| callbacks.contains_key(&entry.sequence));
        }
    }
}

#[derive(Default)]
struct TimerShared {
    queue: Mutex<TimerQueue>,
    changed: Condvar,
}

/// Background deadline scheduler
pub struct Timer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Start the timer thread
    pub fn start(name: &str) -> std::io::Result<Self> {
        let shared = Arc::new(TimerShared::default());
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("{}-timer", name))
            .spawn(move || run(worker))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Run `callback` at `deadline`; dropped if the timer is shut down
    pub fn schedule_at(&self, deadline: Instant, callback: impl FnOnce() + Send + 'static) -> TimerId {
        let mut queue = self.shared.queue.lock();
        let sequence = queue.next_sequence;
        queue.next_sequence += 1;
        if queue.shutdown {
            return TimerId(sequence);
        }
        let is_earliest = queue
            .heap
            .peek()
            .map_or(true, |top| deadline < top.deadline);
        queue.heap.push(TimerEntry { deadline, sequence });
        queue.callbacks.insert(sequence, Box::new(callback));
        drop(queue);
        if is_earliest {
            self.shared.changed.notify_one();
        }
        TimerId(sequence)
    }

    /// Drop the callback of `id` unless it already ran
    ///
    /// Returns `true` if a pending callback was removed.
    pub fn cancel(&self, id: TimerId) -> bool {
        let callback = {
            let mut queue = self.shared.queue.lock();
            let callback = queue.callbacks.remove(&id.0);
            if callback.is_some() {
                queue.compact();
            }
            callback
        };
        // Released after the lock
        callback.is_some()
    }

    /// Callbacks waiting to fire
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().callbacks.len()
    }

    /// Stop the thread and drop all outstanding callbacks
    pub fn shutdown(&self) {
        let dropped = {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
            queue.heap.clear();
            std::mem::take(&mut queue.callbacks)
        };
        self.shared.changed.notify_all();
        debug!(dropped = dropped.len(), "Timer shutting down");
        drop(dropped);

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Timer thread panicked");
            }
        }
    }
}

fn run(shared: Arc<TimerShared>) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            return;
        }
        let now = Instant::now();
        match queue.heap.peek().map(|top| top.deadline) {
            None => shared.changed.wait(&mut queue),
            Some(deadline) if deadline <= now => {
                let Some(entry) = queue.heap.pop() else {
                    continue;
                };
                // Absent if cancelled
                if let Some(callback) = queue.callbacks.remove(&entry.sequence) {
                    drop(queue);
                    callback();
                    queue = shared.queue.lock();
                }
            }
            Some(deadline) => {
                shared.changed.wait_until(&mut queue, deadline);
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_fires_in_deadline_order() {
        let timer = Timer::start("test").unwrap();
        let (tx, rx) = mpsc::channel();
        let base = Instant::now();
        for (label, offset) in [(3u32, 30u64), (1, 10), (2, 20)] {
            let tx = tx.clone();
            timer.schedule_at(base + Duration::from_millis(offset), move || {
                tx.send(label).unwrap();
            });
        }

        let fired: Vec<u32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(fired, vec![1, 2, 3]);
        assert_eq!(timer.pending(), 0);
        timer.shutdown();
    }

    #[test]
    fn test_cancelled_callback_never_fires() {
        let timer = Timer::start("test").unwrap();
        let (tx, rx) = mpsc::channel();
        let base = Instant::now();
        let cancelled_tx = tx.clone();
        let cancelled = timer.schedule_at(base + Duration::from_millis(10), move || {
            cancelled_tx.send("cancelled").unwrap();
        });
        timer.schedule_at(base + Duration::from_millis(30), move || {
            tx.send("kept").unwrap();
        });

        assert!(timer.cancel(cancelled));
        assert!(!timer.cancel(cancelled));
        assert_eq!(timer.pending(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "kept");
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        timer.shutdown();
    }

    #[test]
    fn test_cancelled_entries_are_compacted() {
        let timer = Timer::start("test").unwrap();
        let far = Instant::now() + Duration::from_secs(3600);
        let ids: Vec<TimerId> = (0..1000).map(|_| timer.schedule_at(far, || {})).collect();
        for id in ids {
            assert!(timer.cancel(id));
        }

        assert_eq!(timer.pending(), 0);
        assert!(timer.shared.queue.lock().heap.len() <= COMPACTION_SLACK);
        timer.shutdown();
    }

    #[test]
    fn test_shutdown_drops_pending_callbacks() {
        let timer = Timer::start("test").unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        timer.schedule_at(Instant::now() + Duration::from_secs(60), move || {
            tx.send(()).unwrap();
        });
        assert_eq!(timer.pending(), 1);

        timer.shutdown();
        // Sender dropped with the callback
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        // Scheduling after shutdown is a no-op
        timer.schedule_at(Instant::now(), || {});
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn test_deadline_beyond_instant_range_is_none() {
        assert!(deadline_after(Duration::MAX).is_none());
        assert!(deadline_after(Duration::from_secs(1)).is_some());
        assert_eq!(saturating_millis(Duration::MAX), u64::MAX);
        assert_eq!(saturating_millis(Duration::from_millis(30)), 30);
    }
}
