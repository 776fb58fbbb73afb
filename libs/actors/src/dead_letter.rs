//! Dead Letters
//!
//! Messages sent to terminated actors end up here: everything a mailbox held
//! when it closed, everything enqueued afterwards and the skipped messages of
//! the dying actor. Requests among them are failed with `TargetUnreachable`
//! so their requesters are not left waiting for the deadline.

use crate::correlator::Correlator;
use crate::error::ActorError;
use crate::mailbox::DeadLetterSink;
use crate::message::{Message, SystemSignal};
use crate::registry::ActorId;
use crate::system::SystemMetrics;
use actor_config::DeadLetterConfig;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A captured undeliverable message
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub recipient: ActorId,
    pub message: Message,
}

/// Default dead letter sink of an actor system
pub struct DeadLetters {
    count: AtomicU64,
    log: bool,
    capture_limit: usize,
    captured: Mutex<VecDeque<DeadLetter>>,
    correlator: Arc<Correlator>,
    metrics: Arc<SystemMetrics>,
}

impl DeadLetters {
    pub fn new(
        config: &DeadLetterConfig,
        correlator: Arc<Correlator>,
        metrics: Arc<SystemMetrics>,
    ) -> Self {
        Self {
            count: AtomicU64::new(0),
            log: config.log,
            capture_limit: config.capture_limit,
            captured: Mutex::new(VecDeque::with_capacity(config.capture_limit)),
            correlator,
            metrics,
        }
    }

    /// Dead letters received so far
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// The most recent `capture_limit` dead letters, oldest first
    pub fn captured(&self) -> Vec<DeadLetter> {
        self.captured.lock().iter().cloned().collect()
    }
}

impl DeadLetterSink for DeadLetters {
    fn deliver(&self, recipient: ActorId, message: Message) {
        // Timeout ticks for dead actors are expected noise
        if matches!(message.as_signal(), Some(SystemSignal::ReceiveTimeout { .. })) {
            return;
        }

        self.count.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_dead_letter();
        if self.log {
            debug!(
                recipient = %recipient,
                sender = ?message.sender(),
                signal = message.is_signal(),
                len = message.len(),
                "Dead letter"
            );
        }

        if let Some(request_id) = message.request_id() {
            self.correlator
                .fail(request_id, ActorError::TargetUnreachable { target: recipient });
        }

        if self.capture_limit > 0 {
            let mut captured = self.captured.lock();
            if captured.len() == self.capture_limit {
                captured.pop_front();
            }
            captured.push_back(DeadLetter { recipient, message });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Correlation;
    use crate::timer::Timer;
    use std::time::Duration;

    fn dead_letters(capture_limit: usize) -> (DeadLetters, Arc<Correlator>, Arc<Timer>) {
        let timer = Arc::new(Timer::start("dead-letter-test").unwrap());
        let metrics = Arc::new(SystemMetrics::default());
        let correlator = Arc::new(Correlator::new(Arc::clone(&timer), Arc::clone(&metrics)));
        let config = DeadLetterConfig {
            log: true,
            capture_limit,
        };
        (
            DeadLetters::new(&config, Arc::clone(&correlator), metrics),
            correlator,
            timer,
        )
    }

    #[test]
    fn test_counts_and_captures_most_recent() {
        let (sink, _correlator, timer) = dead_letters(2);
        let recipient = ActorId::next();
        for i in 0..3i64 {
            sink.deliver(recipient, Message::new((i,)));
        }
        assert_eq!(sink.count(), 3);

        let captured: Vec<i64> = sink
            .captured()
            .iter()
            .map(|letter| letter.message.get_as::<i64>(0).unwrap())
            .collect();
        assert_eq!(captured, vec![1, 2]);
        timer.shutdown();
    }

    #[test]
    fn test_fails_dead_requests_as_unreachable() {
        let (sink, correlator, timer) = dead_letters(0);
        let target = ActorId::next();
        let id = correlator.next_id();
        let future = correlator.register_direct(id, None, target, Duration::from_secs(5));

        sink.deliver(target, Message::new(()).with_correlation(Correlation::Request(id)));
        assert_eq!(future.wait(), Err(ActorError::TargetUnreachable { target }));
        assert!(sink.captured().is_empty());
        timer.shutdown();
    }

    #[test]
    fn test_ignores_receive_timeout_ticks() {
        let (sink, _correlator, timer) = dead_letters(4);
        sink.deliver(
            ActorId::next(),
            Message::signal(SystemSignal::ReceiveTimeout { generation: 1 }),
        );
        assert_eq!(sink.count(), 0);
        timer.shutdown();
    }
}
