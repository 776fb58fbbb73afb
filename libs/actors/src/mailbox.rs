//! Actor Mailbox
//!
//! Unbounded multi-producer / single-consumer queue with three lanes:
//!
//! ```text
//!   enqueue ──┬─ signal ──► [ signals ] ─┐
//!             ├─ High   ──► [ high    ] ─┼─► try_dequeue (signals, high, normal)
//!             └─ Normal ──► [ normal  ] ─┘
//! ```
//!
//! FIFO order holds within a lane. Senders never block and never see an
//! error: once the mailbox is closed, every enqueue is redirected to the
//! dead letter sink.

use crate::message::{Message, Priority};
use crate::registry::ActorId;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Receiver of messages that cannot be delivered
pub trait DeadLetterSink: Send + Sync {
    fn deliver(&self, recipient: ActorId, message: Message);
}

/// Outcome of an enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueResult {
    /// The mailbox went from empty to non-empty; the owner must be woken
    pub became_non_empty: bool,
    /// The mailbox was closed and the message went to the dead letter sink
    pub redirected: bool,
}

#[derive(Default)]
struct Lanes {
    signals: VecDeque<Message>,
    high: VecDeque<Message>,
    normal: VecDeque<Message>,
    closed: Option<Arc<dyn DeadLetterSink>>,
}

impl Lanes {
    fn is_empty(&self) -> bool {
        self.signals.is_empty() && self.high.is_empty() && self.normal.is_empty()
    }

    fn len(&self) -> usize {
        self.signals.len() + self.high.len() + self.normal.len()
    }

    fn lane_for(&mut self, message: &Message) -> &mut VecDeque<Message> {
        if message.is_signal() {
            &mut self.signals
        } else {
            match message.priority() {
                Priority::High => &mut self.high,
                Priority::Normal => &mut self.normal,
            }
        }
    }

    fn pop(&mut self) -> Option<Message> {
        self.signals
            .pop_front()
            .or_else(|| self.high.pop_front())
            .or_else(|| self.normal.pop_front())
    }
}

/// Per-actor message queue
pub struct Mailbox {
    owner: ActorId,
    lanes: Mutex<Lanes>,
    available: Condvar,
}

impl Mailbox {
    pub fn new(owner: ActorId) -> Self {
        Self {
            owner,
            lanes: Mutex::new(Lanes::default()),
            available: Condvar::new(),
        }
    }

    pub fn owner(&self) -> ActorId {
        self.owner
    }

    /// Append a message; safe from any number of threads
    pub fn enqueue(&self, message: Message) -> EnqueueResult {
        let mut lanes = self.lanes.lock();
        if let Some(sink) = lanes.closed.clone() {
            drop(lanes);
            sink.deliver(self.owner, message);
            return EnqueueResult {
                became_non_empty: false,
                redirected: true,
            };
        }

        let became_non_empty = lanes.is_empty();
        lanes.lane_for(&message).push_back(message);
        drop(lanes);

        if became_non_empty {
            self.available.notify_one();
        }
        EnqueueResult {
            became_non_empty,
            redirected: false,
        }
    }

    /// Next message by lane then arrival order. Single consumer only.
    pub fn try_dequeue(&self) -> Option<Message> {
        self.lanes.lock().pop()
    }

    /// Put previously skipped messages back at the front of their lanes,
    /// keeping their relative order
    pub fn requeue_front(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let mut lanes = self.lanes.lock();
        if let Some(sink) = lanes.closed.clone() {
            drop(lanes);
            for message in messages {
                sink.deliver(self.owner, message);
            }
            return;
        }
        for message in messages.into_iter().rev() {
            lanes.lane_for(&message).push_front(message);
        }
    }

    /// Close the mailbox, draining queued messages into `sink`
    ///
    /// Returns the number of drained messages. Closing twice is a no-op.
    pub fn close(&self, sink: Arc<dyn DeadLetterSink>) -> usize {
        let mut lanes = self.lanes.lock();
        if lanes.closed.is_some() {
            return 0;
        }
        lanes.closed = Some(Arc::clone(&sink));
        let mut drained = Vec::with_capacity(lanes.len());
        while let Some(message) = lanes.pop() {
            drained.push(message);
        }
        drop(lanes);
        self.available.notify_all();

        let count = drained.len();
        for message in drained {
            sink.deliver(self.owner, message);
        }
        count
    }

    /// Block until a message is available, the mailbox closes or `deadline`
    /// passes. Returns whether a message is available.
    pub fn wait_for_message(&self, deadline: Option<Instant>) -> bool {
        let mut lanes = self.lanes.lock();
        loop {
            if !lanes.is_empty() {
                return true;
            }
            if lanes.closed.is_some() {
                return false;
            }
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut lanes, deadline).timed_out() {
                        return !lanes.is_empty();
                    }
                }
                None => self.available.wait(&mut lanes),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lanes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lanes.lock().closed.is_some()
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lanes = self.lanes.lock();
        f.debug_struct("Mailbox")
            .field("owner", &self.owner)
            .field("signals", &lanes.signals.len())
            .field("high", &lanes.high.len())
            .field("normal", &lanes.normal.len())
            .field("closed", &lanes.closed.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExitReason;
    use parking_lot::Mutex as PlMutex;
    use proptest::prelude::*;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct CollectingSink {
        messages: PlMutex<Vec<(ActorId, Message)>>,
    }

    impl DeadLetterSink for CollectingSink {
        fn deliver(&self, recipient: ActorId, message: Message) {
            self.messages.lock().push((recipient, message));
        }
    }

    fn number(msg: &Message) -> i64 {
        msg.get_as::<i64>(0).unwrap()
    }

    fn mailbox() -> Mailbox {
        Mailbox::new(ActorId::next())
    }

    #[test]
    fn test_fifo_within_priority() {
        let mb = mailbox();
        for i in 0..5i64 {
            mb.enqueue(Message::new((i,)));
        }
        let order: Vec<i64> = std::iter::from_fn(|| mb.try_dequeue()).map(|m| number(&m)).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_high_priority_overtakes_normal() {
        let mb = mailbox();
        for i in 0..3i64 {
            mb.enqueue(Message::new((i,)));
        }
        mb.enqueue(Message::new((99i64,)).with_priority(Priority::High));
        assert_eq!(number(&mb.try_dequeue().unwrap()), 99);
        assert_eq!(number(&mb.try_dequeue().unwrap()), 0);
    }

    #[test]
    fn test_signals_overtake_everything() {
        let mb = mailbox();
        mb.enqueue(Message::new((1i64,)).with_priority(Priority::High));
        mb.enqueue(Message::exit(None, ExitReason::Kill));
        assert!(mb.try_dequeue().unwrap().is_signal());
    }

    #[test]
    fn test_became_non_empty_only_on_transition() {
        let mb = mailbox();
        assert!(mb.enqueue(Message::new((1i64,))).became_non_empty);
        assert!(!mb.enqueue(Message::new((2i64,))).became_non_empty);
        mb.try_dequeue();
        mb.try_dequeue();
        assert!(mb.enqueue(Message::new((3i64,))).became_non_empty);
    }

    #[test]
    fn test_close_drains_and_redirects() {
        let mb = mailbox();
        let sink = Arc::new(CollectingSink::default());
        mb.enqueue(Message::new((1i64,)));
        mb.enqueue(Message::new((2i64,)));

        assert_eq!(mb.close(sink.clone()), 2);
        assert!(mb.is_closed());
        assert!(mb.try_dequeue().is_none());

        let result = mb.enqueue(Message::new((3i64,)));
        assert!(result.redirected);
        assert!(!result.became_non_empty);

        let delivered: Vec<i64> = sink.messages.lock().iter().map(|(_, m)| number(m)).collect();
        assert_eq!(delivered, vec![1, 2, 3]);
        assert!(sink.messages.lock().iter().all(|(to, _)| *to == mb.owner()));

        // Second close does nothing
        assert_eq!(mb.close(sink.clone()), 0);
    }

    #[test]
    fn test_requeue_front_restores_order_per_lane() {
        let mb = mailbox();
        mb.enqueue(Message::new((10i64,)));
        mb.enqueue(Message::new((11i64,)).with_priority(Priority::High));

        let held = vec![
            Message::new((1i64,)),
            Message::new((2i64,)).with_priority(Priority::High),
            Message::new((3i64,)),
        ];
        mb.requeue_front(held);

        let order: Vec<i64> = std::iter::from_fn(|| mb.try_dequeue()).map(|m| number(&m)).collect();
        // Held urgent first, then new urgent, then held normal, then new normal
        assert_eq!(order, vec![2, 11, 1, 3, 10]);
    }

    #[test]
    fn test_wait_for_message_times_out_and_wakes() {
        let mb = Arc::new(mailbox());
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(!mb.wait_for_message(Some(deadline)));

        let producer = {
            let mb = Arc::clone(&mb);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                mb.enqueue(Message::new((1i64,)));
            })
        };
        assert!(mb.wait_for_message(Some(Instant::now() + Duration::from_secs(5))));
        producer.join().unwrap();
    }

    #[test]
    fn test_concurrent_senders_lose_nothing() {
        let mb = Arc::new(mailbox());
        let handles: Vec<_> = (0..1000i64)
            .map(|i| {
                let mb = Arc::clone(&mb);
                thread::spawn(move || {
                    mb.enqueue(Message::new((i,)));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut seen: Vec<i64> = std::iter::from_fn(|| mb.try_dequeue()).map(|m| number(&m)).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..1000).collect::<Vec<_>>());
    }

    proptest! {
        #[test]
        fn prop_priority_then_arrival_order(urgent in proptest::collection::vec(any::<bool>(), 0..64)) {
            let mb = mailbox();
            for (i, is_urgent) in urgent.iter().enumerate() {
                let priority = if *is_urgent { Priority::High } else { Priority::Normal };
                mb.enqueue(Message::new((i as i64,)).with_priority(priority));
            }

            let expected: Vec<i64> = urgent.iter().enumerate().filter(|(_, u)| **u).map(|(i, _)| i as i64)
                .chain(urgent.iter().enumerate().filter(|(_, u)| !**u).map(|(i, _)| i as i64))
                .collect();
            let actual: Vec<i64> = std::iter::from_fn(|| mb.try_dequeue()).map(|m| number(&m)).collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
