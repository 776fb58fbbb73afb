//! Request/Response Correlation
//!
//! Every request gets a fresh id and a pending entry holding where the
//! outcome goes:
//!
//! - `Direct`: a one-shot channel behind a [`ResponseFuture`] (external
//!   callers and blocking actors)
//! - `Mailbox`: the requesting actor's mailbox, where the receive loop
//!   intercepts the response before behavior matching
//!
//! Each entry reaches exactly one terminal state (resolved, timed out,
//! unreachable or cancelled). Resolution removes the entry from the map
//! atomically, so whichever of response, timer and termination comes first
//! wins and everything later finds nothing.

use crate::actor::ActorRef;
use crate::error::{ActorError, Result};
use crate::message::{Message, RequestId, SystemSignal};
use crate::registry::ActorId;
use crate::system::SystemMetrics;
use crate::timer::{deadline_after, saturating_millis, Timer, TimerId};
use dashmap::DashMap;
use futures::channel::oneshot;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tracing::debug;

enum ReplySlot {
    Direct(oneshot::Sender<Result<Message>>),
    Mailbox(ActorRef),
}

struct PendingRequest {
    origin: Option<ActorId>,
    target: ActorId,
    /// Deadline callback; `None` for timeouts without a representable deadline
    timer: Option<TimerId>,
    slot: ReplySlot,
}

/// Pending request table
pub struct Correlator {
    next_id: AtomicU64,
    pending: DashMap<RequestId, PendingRequest>,
    timer: Arc<Timer>,
    metrics: Arc<SystemMetrics>,
}

impl Correlator {
    pub fn new(timer: Arc<Timer>, metrics: Arc<SystemMetrics>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            timer,
            metrics,
        }
    }

    /// Allocate a request id; ids are never reused
    pub fn next_id(&self) -> RequestId {
        RequestId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a request resolved through a [`ResponseFuture`]
    pub(crate) fn register_direct(
        self: &Arc<Self>,
        request_id: RequestId,
        origin: Option<ActorId>,
        target: ActorId,
        timeout: Duration,
    ) -> ResponseFuture {
        let (sender, receiver) = oneshot::channel();
        self.register(request_id, origin, target, timeout, ReplySlot::Direct(sender));
        ResponseFuture {
            request_id,
            receiver,
        }
    }

    /// Register a request resolved into `origin`'s mailbox
    pub(crate) fn register_mailbox(
        self: &Arc<Self>,
        request_id: RequestId,
        origin: &ActorRef,
        target: ActorId,
        timeout: Duration,
    ) {
        self.register(
            request_id,
            Some(origin.id()),
            target,
            timeout,
            ReplySlot::Mailbox(origin.clone()),
        );
    }

    fn register(
        self: &Arc<Self>,
        request_id: RequestId,
        origin: Option<ActorId>,
        target: ActorId,
        timeout: Duration,
        slot: ReplySlot,
    ) {
        self.pending.insert(
            request_id,
            PendingRequest {
                origin,
                target,
                timer: None,
                slot,
            },
        );
        self.metrics.record_request_issued();

        let Some(deadline) = deadline_after(timeout) else {
            return;
        };
        let correlator = Arc::downgrade(self);
        let timeout_ms = saturating_millis(timeout);
        let timer_id = self.timer.schedule_at(deadline, move || {
            if let Some(correlator) = correlator.upgrade() {
                correlator.expire(request_id, timeout_ms);
            }
        });
        // The request may have resolved while the deadline was being armed
        match self.pending.get_mut(&request_id) {
            Some(mut pending) => pending.timer = Some(timer_id),
            None => {
                self.timer.cancel(timer_id);
            }
        }
    }

    /// Remove `request_id` from the table, releasing its deadline callback
    fn take(&self, request_id: RequestId) -> Option<PendingRequest> {
        let (_, pending) = self.pending.remove(&request_id)?;
        if let Some(timer_id) = pending.timer {
            self.timer.cancel(timer_id);
        }
        Some(pending)
    }

    /// Deliver the response to request `request_id`
    ///
    /// Returns `false` if the request is no longer pending; the response is
    /// then discarded.
    pub fn route_response(&self, request_id: RequestId, response: Message) -> bool {
        match self.take(request_id) {
            Some(pending) => {
                resolve(request_id, pending, Ok(response));
                true
            }
            None => {
                debug!(request_id = %request_id, "Discarding late response");
                false
            }
        }
    }

    /// Resolve request `request_id` with `error`
    pub fn fail(&self, request_id: RequestId, error: ActorError) -> bool {
        match self.take(request_id) {
            Some(pending) => {
                debug!(request_id = %request_id, error = %error, "Request failed");
                resolve(request_id, pending, Err(error));
                true
            }
            None => false,
        }
    }

    fn expire(&self, request_id: RequestId, timeout_ms: u64) {
        if let Some((_, pending)) = self.pending.remove(&request_id) {
            // The firing callback has already left the timer
            self.metrics.record_request_timeout();
            debug!(
                request_id = %request_id,
                target = %pending.target,
                timeout_ms,
                "Request timed out"
            );
            resolve(
                request_id,
                pending,
                Err(ActorError::RequestTimeout {
                    request_id,
                    timeout_ms,
                }),
            );
        }
    }

    /// Fail every request addressed to `target` with `TargetUnreachable`
    pub fn fail_target(&self, target: ActorId) -> usize {
        self.matching(|pending| pending.target == target)
            .into_iter()
            .filter(|id| self.fail(*id, ActorError::TargetUnreachable { target }))
            .count()
    }

    /// Drop every request issued by `origin`; their futures resolve to
    /// `RequestCancelled`
    pub fn cancel_origin(&self, origin: ActorId) -> usize {
        let cancelled = self
            .matching(|pending| pending.origin == Some(origin))
            .into_iter()
            .filter(|id| self.take(*id).is_some())
            .count();
        if cancelled > 0 {
            debug!(actor_id = %origin, cancelled, "Cancelled requests of terminated actor");
        }
        cancelled
    }

    /// Fail everything still pending with `SystemShutdown`
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<RequestId> = self.pending.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter(|id| self.fail(*id, ActorError::SystemShutdown))
            .count()
    }

    /// Attribute a forwarded request to its new target
    pub fn retarget(&self, request_id: RequestId, target: ActorId) -> bool {
        match self.pending.get_mut(&request_id) {
            Some(mut pending) => {
                pending.target = target;
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, request_id: RequestId) -> bool {
        self.pending.contains_key(&request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn matching(&self, predicate: impl Fn(&PendingRequest) -> bool) -> Vec<RequestId> {
        self.pending
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| *entry.key())
            .collect()
    }
}

fn resolve(request_id: RequestId, pending: PendingRequest, outcome: Result<Message>) {
    match pending.slot {
        ReplySlot::Direct(sender) => {
            // The receiver may already be gone
            let _ = sender.send(outcome);
        }
        ReplySlot::Mailbox(origin) => {
            let message = match outcome {
                Ok(response) => response,
                Err(error) => Message::signal(SystemSignal::RequestFailed { request_id, error }),
            };
            origin.enqueue(message);
        }
    }
}

/// Outcome of a request
///
/// Await it from async code or call [`ResponseFuture::wait`] from a thread.
#[must_use = "a dropped ResponseFuture discards the response"]
pub struct ResponseFuture {
    request_id: RequestId,
    receiver: oneshot::Receiver<Result<Message>>,
}

impl ResponseFuture {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Block the calling thread until the request resolves
    pub fn wait(self) -> Result<Message> {
        futures::executor::block_on(self)
    }
}

impl Future for ResponseFuture {
    type Output = Result<Message>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let request_id = self.request_id;
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(oneshot::Canceled)) => {
                Poll::Ready(Err(ActorError::RequestCancelled { request_id }))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correlator() -> (Arc<Correlator>, Arc<Timer>) {
        let timer = Arc::new(Timer::start("correlator-test").unwrap());
        let metrics = Arc::new(SystemMetrics::default());
        (Arc::new(Correlator::new(Arc::clone(&timer), metrics)), timer)
    }

    #[test]
    fn test_response_resolves_exactly_once() {
        let (correlator, timer) = correlator();
        let id = correlator.next_id();
        let target = ActorId::next();
        let future = correlator.register_direct(id, None, target, Duration::from_secs(5));
        assert!(correlator.is_pending(id));

        assert!(correlator.route_response(id, Message::new(("pong",))));
        // Late duplicates are discarded
        assert!(!correlator.route_response(id, Message::new(("again",))));
        assert!(!correlator.fail(id, ActorError::TargetUnreachable { target }));

        let response = future.wait().unwrap();
        assert_eq!(response.get_as::<String>(0).unwrap(), "pong");
        assert_eq!(correlator.pending_count(), 0);
        timer.shutdown();
    }

    #[test]
    fn test_timeout_then_late_response() {
        let (correlator, timer) = correlator();
        let id = correlator.next_id();
        let future = correlator.register_direct(id, None, ActorId::next(), Duration::from_millis(10));

        match future.wait() {
            Err(ActorError::RequestTimeout { request_id, timeout_ms }) => {
                assert_eq!(request_id, id);
                assert_eq!(timeout_ms, 10);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(!correlator.route_response(id, Message::new(())));
        timer.shutdown();
    }

    #[test]
    fn test_fail_target_and_cancel_origin() {
        let (correlator, timer) = correlator();
        let origin = ActorId::next();
        let target = ActorId::next();
        let other = ActorId::next();

        let to_target = correlator.register_direct(correlator.next_id(), None, target, Duration::from_secs(5));
        let from_origin = correlator.register_direct(correlator.next_id(), Some(origin), other, Duration::from_secs(5));

        assert_eq!(correlator.fail_target(target), 1);
        assert_eq!(correlator.cancel_origin(origin), 1);

        assert_eq!(to_target.wait(), Err(ActorError::TargetUnreachable { target }));
        assert!(matches!(from_origin.wait(), Err(ActorError::RequestCancelled { .. })));
        timer.shutdown();
    }

    #[test]
    fn test_resolution_releases_deadline_callback() {
        let (correlator, timer) = correlator();
        let hour = Duration::from_secs(3600);
        let origin = ActorId::next();
        let target = ActorId::next();

        let answered = correlator.next_id();
        let answered_future = correlator.register_direct(answered, None, target, hour);
        let failed = correlator.register_direct(correlator.next_id(), None, target, hour);
        let cancelled = correlator.register_direct(correlator.next_id(), Some(origin), target, hour);
        assert_eq!(timer.pending(), 3);

        assert!(correlator.route_response(answered, Message::new(())));
        assert_eq!(correlator.cancel_origin(origin), 1);
        assert_eq!(correlator.fail_target(target), 1);

        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(timer.pending(), 0);
        assert!(answered_future.wait().is_ok());
        assert!(failed.wait().is_err());
        assert!(cancelled.wait().is_err());
        timer.shutdown();
    }

    #[test]
    fn test_unbounded_timeout_has_no_deadline() {
        let (correlator, timer) = correlator();
        let id = correlator.next_id();
        let future = correlator.register_direct(id, None, ActorId::next(), Duration::MAX);
        assert!(correlator.is_pending(id));
        assert_eq!(timer.pending(), 0);

        assert!(correlator.route_response(id, Message::new((7i64,))));
        assert_eq!(future.wait().unwrap().get_as::<i64>(0).unwrap(), 7);
        timer.shutdown();
    }

    #[test]
    fn test_retarget_moves_unreachable_attribution() {
        let (correlator, timer) = correlator();
        let first = ActorId::next();
        let second = ActorId::next();
        let id = correlator.next_id();
        let future = correlator.register_direct(id, None, first, Duration::from_secs(5));

        assert!(correlator.retarget(id, second));
        assert_eq!(correlator.fail_target(first), 0);
        assert_eq!(correlator.fail_target(second), 1);
        assert_eq!(future.wait(), Err(ActorError::TargetUnreachable { target: second }));
        timer.shutdown();
    }

    #[tokio::test]
    async fn test_future_can_be_awaited() {
        let (correlator, timer) = correlator();
        let id = correlator.next_id();
        let future = correlator.register_direct(id, None, ActorId::next(), Duration::from_secs(5));
        let responder = Arc::clone(&correlator);
        std::thread::spawn(move || {
            responder.route_response(id, Message::new((1i64,)));
        });
        let response = future.await.unwrap();
        assert_eq!(response.get_as::<i64>(0).unwrap(), 1);
        timer.shutdown();
    }
}
