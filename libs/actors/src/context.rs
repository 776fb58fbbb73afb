//! Handler Context
//!
//! Every handler receives a `Context` giving access to its own actor, the
//! message being processed and the system. Operations that change how the
//! actor proceeds (`become_`, `quit`, request continuations) are recorded as
//! effects and applied by the receive loop after the handler returns.

use crate::actor::ActorRef;
use crate::behavior::Behavior;
use crate::error::{ActorError, ExitReason};
use crate::message::{Header, IntoValues, Message, Priority, RequestId};
use crate::registry::ActorId;
use crate::system::ActorSystem;
use std::time::Duration;
use tracing::debug;

/// Callback run with the outcome of a request issued from a handler
pub(crate) type Continuation<S> = Box<
    dyn FnOnce(&mut S, &mut Context<'_, S>, Result<Message, ActorError>) -> Result<(), ActorError>
        + Send,
>;

pub(crate) enum BecomeOp<S> {
    Replace(Behavior<S>),
    Push(Behavior<S>),
    Pop,
}

/// Changes requested by a handler
pub(crate) struct Effects<S> {
    pub(crate) behavior_ops: Vec<BecomeOp<S>>,
    pub(crate) quit: Option<ExitReason>,
    pub(crate) continuations: Vec<(RequestId, Continuation<S>)>,
    pub(crate) trap_exit: Option<bool>,
    /// The response was taken over by a promise or a forward
    pub(crate) reply_delegated: bool,
}

impl<S> Default for Effects<S> {
    fn default() -> Self {
        Self {
            behavior_ops: Vec::new(),
            quit: None,
            continuations: Vec::new(),
            trap_exit: None,
            reply_delegated: false,
        }
    }
}

/// Execution context handed to handlers
pub struct Context<'a, S> {
    actor: &'a ActorRef,
    current: Option<&'a Message>,
    effects: &'a mut Effects<S>,
}

impl<'a, S> Context<'a, S> {
    pub(crate) fn new(
        actor: &'a ActorRef,
        current: Option<&'a Message>,
        effects: &'a mut Effects<S>,
    ) -> Self {
        Self {
            actor,
            current,
            effects,
        }
    }

    pub fn id(&self) -> ActorId {
        self.actor.id()
    }

    /// Handle to the running actor
    pub fn self_ref(&self) -> &ActorRef {
        self.actor
    }

    pub fn system(&self) -> &ActorSystem {
        self.actor.system()
    }

    /// Message being processed; `None` in startup hooks and timeouts
    pub fn current_message(&self) -> Option<&Message> {
        self.current
    }

    pub fn sender(&self) -> Option<ActorId> {
        self.current.and_then(Message::sender)
    }

    /// Live handle of the sender, if it is still running
    pub fn sender_ref(&self) -> Option<ActorRef> {
        self.sender().and_then(|id| self.system().lookup(id))
    }

    /// Send a normal-priority message with this actor as sender
    pub fn send(&self, target: &ActorRef, values: impl IntoValues) -> bool {
        target.enqueue(self.outgoing(Priority::Normal, values))
    }

    /// Send a high-priority message with this actor as sender
    pub fn send_urgent(&self, target: &ActorRef, values: impl IntoValues) -> bool {
        target.enqueue(self.outgoing(Priority::High, values))
    }

    /// Send to an actor known only by id
    pub fn send_to(&self, target: ActorId, values: impl IntoValues) -> bool {
        self.system()
            .deliver(target, self.outgoing(Priority::Normal, values))
    }

    fn outgoing(&self, priority: Priority, values: impl IntoValues) -> Message {
        Message::with_header(
            Header {
                sender: Some(self.id()),
                priority,
                ..Header::default()
            },
            values.into_values(),
        )
    }

    /// Issue a request; attach the response handler with
    /// [`PendingRequest::then`]
    pub fn request(
        &mut self,
        target: &ActorRef,
        values: impl IntoValues,
        timeout: Duration,
    ) -> PendingRequest<'_, S> {
        let request_id =
            self.system()
                .request_into_mailbox(self.actor, target, values.into_values(), timeout);
        PendingRequest {
            request_id,
            effects: &mut *self.effects,
        }
    }

    /// Take over the response to the current message
    ///
    /// The handler's return value is no longer sent back; the promise must be
    /// delivered instead, possibly later and from another thread.
    pub fn promise(&mut self) -> ResponsePromise {
        self.effects.reply_delegated = true;
        ResponsePromise {
            responder: self.actor.clone(),
            request_id: self.current.and_then(Message::request_id),
            reply_to: self.sender(),
            settled: false,
        }
    }

    /// Hand the current message to `target`, keeping its sender and
    /// request correlation so `target` answers the original requester
    pub fn forward(&mut self, target: &ActorRef) -> bool {
        let Some(message) = self.current else {
            return false;
        };
        if let Some(request_id) = message.request_id() {
            self.system().correlator().retarget(request_id, target.id());
        }
        self.effects.reply_delegated = true;
        debug!(actor_id = %self.id(), target = %target.id(), "Forwarding message");
        target.enqueue(message.clone())
    }

    /// Replace the current behavior
    pub fn become_(&mut self, behavior: Behavior<S>) {
        self.effects.behavior_ops.push(BecomeOp::Replace(behavior));
    }

    /// Push a behavior, keeping the current one for [`Context::unbecome`]
    pub fn become_stacked(&mut self, behavior: Behavior<S>) {
        self.effects.behavior_ops.push(BecomeOp::Push(behavior));
    }

    /// Return to the previous behavior
    pub fn unbecome(&mut self) {
        self.effects.behavior_ops.push(BecomeOp::Pop);
    }

    /// Terminate after the current handler returns
    pub fn quit(&mut self, reason: ExitReason) {
        self.effects.quit = Some(reason);
    }

    /// Receive non-kill exit signals as `[EXIT, Actor, Reason]` messages
    pub fn trap_exit(&mut self, enabled: bool) {
        self.effects.trap_exit = Some(enabled);
    }

    /// Bidirectional exit propagation with `other`
    pub fn link(&self, other: &ActorRef) {
        if other.id() == self.id() {
            return;
        }
        other.add_link(self.actor);
        self.actor.add_link(other);
    }

    pub fn unlink(&self, other: &ActorRef) {
        other.remove_link(self.id());
        self.actor.remove_link(other.id());
    }

    /// Receive a `DOWN` message when `target` terminates
    pub fn monitor(&self, target: &ActorRef) {
        target.add_monitor(self.actor);
    }

    pub fn demonitor(&self, target: &ActorRef) {
        target.remove_monitor(self.id());
    }

    /// Spawn a stateless event-based actor
    pub fn spawn<F>(&self, init: F) -> ActorRef
    where
        F: FnOnce(&mut Context<'_, ()>) -> Behavior<()> + Send + 'static,
    {
        self.system().spawn(init)
    }

    /// Spawn an event-based actor owning `state`
    pub fn spawn_with<T, F>(&self, state: T, init: F) -> ActorRef
    where
        T: Send + 'static,
        F: FnOnce(&mut T, &mut Context<'_, T>) -> Behavior<T> + Send + 'static,
    {
        self.system().spawn_with(state, init)
    }
}

/// A request issued from a handler, awaiting its continuation
pub struct PendingRequest<'c, S> {
    request_id: RequestId,
    effects: &'c mut Effects<S>,
}

impl<'c, S: 'static> PendingRequest<'c, S> {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Run `continuation` with the response or the failure
    ///
    /// Without a continuation the response is discarded.
    pub fn then<F>(self, continuation: F)
    where
        F: FnOnce(&mut S, &mut Context<'_, S>, Result<Message, ActorError>) -> Result<(), ActorError>
            + Send
            + 'static,
    {
        self.effects
            .continuations
            .push((self.request_id, Box::new(continuation)));
    }
}

/// Delayed response to a message
///
/// Dropping an unsettled promise for a request fails it with
/// `RequestCancelled` so the requester is never left waiting.
pub struct ResponsePromise {
    responder: ActorRef,
    request_id: Option<RequestId>,
    reply_to: Option<ActorId>,
    settled: bool,
}

impl ResponsePromise {
    pub fn is_request(&self) -> bool {
        self.request_id.is_some()
    }

    /// Send the response
    pub fn deliver(mut self, values: impl IntoValues) -> bool {
        self.settled = true;
        let system = self.responder.system();
        match (self.request_id, self.reply_to) {
            (Some(request_id), _) => {
                system.respond(self.responder.id(), request_id, values.into_values())
            }
            (None, Some(sender)) => system.deliver(
                sender,
                Message::with_header(
                    Header {
                        sender: Some(self.responder.id()),
                        ..Header::default()
                    },
                    values.into_values(),
                ),
            ),
            (None, None) => false,
        }
    }

    /// Fail the request with `error`
    pub fn fail(mut self, error: ActorError) -> bool {
        self.settled = true;
        match self.request_id {
            Some(request_id) => self.responder.system().correlator().fail(request_id, error),
            None => false,
        }
    }
}

impl Drop for ResponsePromise {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(request_id) = self.request_id {
            debug!(actor_id = %self.responder.id(), request_id = %request_id, "Promise dropped unsettled");
            self.responder
                .system()
                .correlator()
                .fail(request_id, ActorError::RequestCancelled { request_id });
        }
    }
}
