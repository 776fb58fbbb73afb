//! Blocking Actors
//!
//! A `ScopedActor` is an actor driven by an ordinary thread: it blocks in
//! `receive` until a message matches, a deadline passes or it is killed.
//! `ActorSystem::scoped` binds one to the calling thread and
//! `ActorSystem::spawn_blocking` runs a closure on a dedicated thread. The
//! actor terminates when the `ScopedActor` is dropped.
//!
//! Inside a blocking receive, `become_` replaces the behavior passed in and
//! request continuations run synchronously: the receive waits for the
//! response before returning.

use crate::actor::{ActorRef, ActorState};
use crate::behavior::{Behavior, MatchOutcome, TimeoutOutcome};
use crate::cell::{send_reply, trapped_exit_message};
use crate::context::{BecomeOp, Context, Effects};
use crate::correlator::ResponseFuture;
use crate::error::{ActorError, ExitReason, Result};
use crate::message::{Header, IntoValues, Message, Priority, RequestId, SystemSignal};
use crate::registry::ActorId;
use crate::system::ActorSystem;
use crate::timer::{deadline_after, saturating_millis};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Actor bound to a thread
pub struct ScopedActor {
    actor: ActorRef,
    held: Vec<Message>,
    trap_exit: bool,
    exit_reason: Option<ExitReason>,
}

impl ScopedActor {
    pub(crate) fn new(actor: ActorRef) -> Self {
        actor.set_state(ActorState::Running);
        Self {
            actor,
            held: Vec::new(),
            trap_exit: false,
            exit_reason: None,
        }
    }

    pub fn id(&self) -> ActorId {
        self.actor.id()
    }

    pub fn actor_ref(&self) -> &ActorRef {
        &self.actor
    }

    pub fn system(&self) -> &ActorSystem {
        self.actor.system()
    }

    /// Reason this actor will exit with, once decided
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit_reason
    }

    /// Send a normal-priority message with this actor as sender
    pub fn send(&self, target: &ActorRef, values: impl IntoValues) -> bool {
        target.enqueue(self.outgoing(Priority::Normal, values))
    }

    /// Send a high-priority message with this actor as sender
    pub fn send_urgent(&self, target: &ActorRef, values: impl IntoValues) -> bool {
        target.enqueue(self.outgoing(Priority::High, values))
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

    /// Issue a request; block on it with [`ResponseFuture::wait`]
    pub fn request(
        &self,
        target: &ActorRef,
        values: impl IntoValues,
        timeout: Duration,
    ) -> ResponseFuture {
        self.system()
            .request_direct(Some(self.id()), target, values.into_values(), timeout)
    }

    pub fn trap_exit(&mut self, enabled: bool) {
        self.trap_exit = enabled;
    }

    pub fn link(&self, other: &ActorRef) {
        if other.id() == self.id() {
            return;
        }
        other.add_link(&self.actor);
        self.actor.add_link(other);
    }

    pub fn unlink(&self, other: &ActorRef) {
        other.remove_link(self.id());
        self.actor.remove_link(other.id());
    }

    pub fn monitor(&self, target: &ActorRef) {
        target.add_monitor(&self.actor);
    }

    pub fn demonitor(&self, target: &ActorRef) {
        target.remove_monitor(self.id());
    }

    /// Exit with `reason` once this handle is dropped; further receives fail
    pub fn quit(&mut self, reason: ExitReason) {
        self.exit_reason.get_or_insert(reason);
    }

    /// Block until `behavior` handles one message
    ///
    /// A receive timeout on the behavior is honored.
    pub fn receive<S: 'static>(&mut self, state: &mut S, behavior: &mut Behavior<S>) -> Result<()> {
        self.receive_until(state, behavior, None)
    }

    /// Like [`ScopedActor::receive`], failing with `ReceiveTimeout` if no
    /// message is handled within `timeout`
    pub fn receive_timeout<S: 'static>(
        &mut self,
        state: &mut S,
        behavior: &mut Behavior<S>,
        timeout: Duration,
    ) -> Result<()> {
        let result = self.receive_until(state, behavior, deadline_after(timeout));
        match result {
            Err(ActorError::ReceiveTimeout { .. }) => Err(ActorError::ReceiveTimeout {
                timeout_ms: saturating_millis(timeout),
            }),
            other => other,
        }
    }

    /// Next user message without matching
    pub fn receive_message(&mut self, timeout: Option<Duration>) -> Result<Message> {
        let deadline = timeout.and_then(deadline_after);
        loop {
            let Some(message) = self.next_message(deadline)? else {
                return Err(ActorError::ReceiveTimeout {
                    timeout_ms: timeout.map_or(0, saturating_millis),
                });
            };
            if let Some(message) = self.intercept(message)? {
                self.actor.set_state(ActorState::Running);
                return Ok(message);
            }
        }
    }

    fn receive_until<S: 'static>(
        &mut self,
        state: &mut S,
        behavior: &mut Behavior<S>,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let behavior_deadline = behavior.timeout().and_then(deadline_after);
        let effective = match (deadline, behavior_deadline) {
            (Some(d), Some(b)) => Some(d.min(b)),
            (d, b) => d.or(b),
        };
        let behavior_first = match (deadline, behavior_deadline) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(d), Some(b)) => b <= d,
        };

        let result = loop {
            let message = match self.next_message(effective) {
                Ok(Some(message)) => message,
                Ok(None) if behavior_first => break self.run_timeout(state, behavior),
                Ok(None) => break Err(ActorError::ReceiveTimeout { timeout_ms: 0 }),
                Err(error) => break Err(error),
            };
            let message = match self.intercept(message) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(error) => break Err(error),
            };

            self.actor.set_state(ActorState::Running);
            let metrics = self.actor.system().metrics();
            let started = Instant::now();
            let mut effects = Effects::default();
            let outcome = {
                let mut ctx = Context::new(&self.actor, Some(&message), &mut effects);
                behavior.apply(state, &mut ctx, &message)
            };
            match outcome {
                MatchOutcome::Skipped => {
                    metrics.record_skipped();
                    self.held.push(message);
                }
                MatchOutcome::Handled(Ok(reply)) => {
                    metrics.record_message_handled(started.elapsed());
                    if !effects.reply_delegated {
                        send_reply(&self.actor, &message, reply);
                    }
                    break self.apply_effects(state, behavior, effects);
                }
                MatchOutcome::Handled(Err(error)) => break Err(error),
            }
        };

        self.requeue_held();
        result
    }

    fn run_timeout<S: 'static>(&mut self, state: &mut S, behavior: &mut Behavior<S>) -> Result<()> {
        let mut effects = Effects::default();
        let outcome = {
            let mut ctx = Context::new(&self.actor, None, &mut effects);
            behavior.handle_timeout(state, &mut ctx)
        };
        match outcome {
            TimeoutOutcome::Handled(Ok(())) => self.apply_effects(state, behavior, effects),
            TimeoutOutcome::Handled(Err(error)) => Err(error),
            TimeoutOutcome::Exit(reason) => {
                self.exit_reason = Some(reason);
                Err(ActorError::Terminated {
                    actor: self.id(),
                    reason,
                })
            }
            TimeoutOutcome::Unset => Ok(()),
        }
    }

    fn apply_effects<S: 'static>(
        &mut self,
        state: &mut S,
        behavior: &mut Behavior<S>,
        effects: Effects<S>,
    ) -> Result<()> {
        for op in effects.behavior_ops {
            match op {
                BecomeOp::Replace(next) | BecomeOp::Push(next) => *behavior = next,
                BecomeOp::Pop => debug!(actor_id = %self.id(), "unbecome has no effect in a blocking receive"),
            }
        }
        if let Some(trap_exit) = effects.trap_exit {
            self.trap_exit = trap_exit;
        }
        if let Some(reason) = effects.quit {
            self.quit(reason);
        }

        for (request_id, continuation) in effects.continuations {
            let outcome = self.await_response(request_id)?;
            let current = outcome.as_ref().ok().cloned();
            let mut nested = Effects::default();
            {
                let mut ctx = Context::new(&self.actor, current.as_ref(), &mut nested);
                continuation(state, &mut ctx, outcome)?;
            }
            self.apply_effects(state, behavior, nested)?;
        }
        Ok(())
    }

    /// Wait for the outcome of a request issued through a handler context
    fn await_response(&mut self, request_id: RequestId) -> Result<Result<Message>> {
        loop {
            let Some(message) = self.next_message(None)? else {
                continue;
            };
            if message.response_id() == Some(request_id) {
                return Ok(Ok(message));
            }
            if let Some(SystemSignal::RequestFailed { request_id: failed, error }) = message.as_signal() {
                if *failed == request_id {
                    return Ok(Err(error.clone()));
                }
            }
            if let Some(message) = self.intercept(message)? {
                self.held.push(message);
            }
        }
    }

    /// Next mailbox message, `None` once `deadline` passes
    fn next_message(&mut self, deadline: Option<Instant>) -> Result<Option<Message>> {
        if let Some(reason) = self.exit_reason {
            return Err(ActorError::Terminated {
                actor: self.id(),
                reason,
            });
        }
        loop {
            if let Some(message) = self.actor.mailbox().try_dequeue() {
                return Ok(Some(message));
            }
            self.actor.set_state(ActorState::AwaitingMessage { deadline });
            if !self.actor.mailbox().wait_for_message(deadline) {
                if self.actor.mailbox().is_closed() {
                    let reason = *self.exit_reason.get_or_insert(ExitReason::UserShutdown);
                    return Err(ActorError::Terminated {
                        actor: self.id(),
                        reason,
                    });
                }
                if deadline.map_or(false, |d| Instant::now() >= d) {
                    return Ok(None);
                }
            }
        }
    }

    /// Handle signals and stray responses; returns user messages
    fn intercept(&mut self, message: Message) -> Result<Option<Message>> {
        match message.as_signal() {
            Some(SystemSignal::Exit { from, reason }) => {
                let (from, reason) = (*from, *reason);
                if let Some(from) = from {
                    self.actor.remove_link(from);
                }
                if self.trap_exit && reason != ExitReason::Kill {
                    return Ok(Some(trapped_exit_message(from, reason)));
                }
                if reason.is_normal() {
                    return Ok(None);
                }
                self.exit_reason = Some(reason);
                Err(ActorError::Terminated {
                    actor: self.id(),
                    reason,
                })
            }
            Some(SystemSignal::ReceiveTimeout { .. }) => Ok(None),
            Some(SystemSignal::RequestFailed { request_id, error }) => {
                debug!(actor_id = %self.id(), request_id = %request_id, error = %error, "Discarding stray request failure");
                Ok(None)
            }
            None if message.response_id().is_some() => {
                debug!(actor_id = %self.id(), "Discarding stray response");
                Ok(None)
            }
            None => Ok(Some(message)),
        }
    }

    fn requeue_held(&mut self) {
        if !self.held.is_empty() {
            self.actor.mailbox().requeue_front(std::mem::take(&mut self.held));
        }
    }

    pub(crate) fn fail(&mut self, error: &ActorError) {
        if self.exit_reason.is_none() {
            self.system().metrics().record_handler_failure();
            warn!(actor_id = %self.id(), error = %error, "Blocking actor failed");
            self.exit_reason = Some(ExitReason::UnhandledException);
        }
    }
}

impl Drop for ScopedActor {
    fn drop(&mut self) {
        let reason = self.exit_reason.unwrap_or(ExitReason::Normal);
        self.actor.finalize(reason, std::mem::take(&mut self.held));
    }
}

impl std::fmt::Debug for ScopedActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedActor")
            .field("id", &self.id())
            .field("held", &self.held.len())
            .field("trap_exit", &self.trap_exit)
            .field("exit_reason", &self.exit_reason)
            .finish()
    }
}
