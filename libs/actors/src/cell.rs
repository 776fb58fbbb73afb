//! Event-Based Receive Loop
//!
//! `EventCell` owns the state, behavior stack, held messages and request
//! continuations of one event-based actor. The scheduler calls `resume`,
//! which processes up to one quantum of messages:
//!
//! 1. system signals and responses are intercepted before matching
//! 2. the top behavior is applied; unmatched messages are held
//! 3. after a handled message the held messages go back to the mailbox front
//!    and the handler's effects (`become`, `quit`, ...) are applied
//!
//! Receive timeouts use a generation counter: every handled message and every
//! behavior change starts a new generation, so ticks armed for an older one
//! are ignored.

use crate::actor::{ActorRef, ActorState, ResumeResult, Runnable};
use crate::atom::atoms;
use crate::behavior::{panic_message, Behavior, MatchOutcome, Reply, TimeoutOutcome};
use crate::context::{BecomeOp, Context, Continuation, Effects};
use crate::error::{ActorError, ExitReason};
use crate::message::{Header, Message, RequestId, SystemSignal};
use crate::registry::ActorId;
use crate::timer::{deadline_after, TimerId};
use crate::value::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;
use tracing::{debug, error};

/// Startup hook installing the first behavior
pub(crate) type InitFn<S> = Box<dyn FnOnce(&mut S, &mut Context<'_, S>) -> Behavior<S> + Send>;

enum Flow {
    Continue,
    Terminate(ExitReason),
}

pub(crate) struct EventCell<S> {
    state: S,
    init: Option<InitFn<S>>,
    behaviors: Vec<Behavior<S>>,
    held: Vec<Message>,
    continuations: HashMap<RequestId, Continuation<S>>,
    trap_exit: bool,
    generation: u64,
    armed: Option<ArmedTimeout>,
}

/// Receive timeout scheduled for one generation
struct ArmedTimeout {
    generation: u64,
    deadline: Instant,
    timer: TimerId,
}

impl<S: Send + 'static> EventCell<S> {
    pub(crate) fn new(state: S, init: InitFn<S>) -> Self {
        Self {
            state,
            init: Some(init),
            behaviors: Vec::new(),
            held: Vec::new(),
            continuations: HashMap::new(),
            trap_exit: false,
            generation: 0,
            armed: None,
        }
    }

    fn start(&mut self, actor: &ActorRef, init: InitFn<S>) -> Flow {
        let mut effects = Effects::default();
        let state = &mut self.state;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut ctx = Context::new(actor, None, &mut effects);
            init(state, &mut ctx)
        }));
        match outcome {
            Ok(behavior) => {
                if !behavior.is_empty() {
                    self.behaviors.push(behavior);
                }
                debug!(actor_id = %actor.id(), "Actor started");
                self.apply_effects(effects)
            }
            Err(payload) => self.fail(
                actor,
                ActorError::handler(actor.id(), panic_message(payload.as_ref())),
            ),
        }
    }

    fn process(&mut self, actor: &ActorRef, message: Message) -> Flow {
        if let Some(signal) = message.as_signal() {
            return match signal.clone() {
                SystemSignal::Exit { from, reason } => self.handle_exit(actor, from, reason),
                SystemSignal::ReceiveTimeout { generation } => {
                    self.handle_receive_timeout(actor, generation)
                }
                SystemSignal::RequestFailed { request_id, error } => {
                    self.resume_continuation(actor, request_id, None, Err(error))
                }
            };
        }
        if let Some(request_id) = message.response_id() {
            let response = message.clone();
            return self.resume_continuation(actor, request_id, Some(&message), Ok(response));
        }
        self.dispatch(actor, message)
    }

    fn handle_exit(&mut self, actor: &ActorRef, from: Option<ActorId>, reason: ExitReason) -> Flow {
        if let Some(from) = from {
            actor.remove_link(from);
        }
        if reason == ExitReason::Kill {
            return Flow::Terminate(ExitReason::Kill);
        }
        if self.trap_exit {
            return self.dispatch(actor, trapped_exit_message(from, reason));
        }
        if reason.is_normal() {
            Flow::Continue
        } else {
            Flow::Terminate(reason)
        }
    }

    fn handle_receive_timeout(&mut self, actor: &ActorRef, generation: u64) -> Flow {
        if generation != self.generation {
            return Flow::Continue;
        }
        self.next_generation();
        self.requeue_held(actor);

        let mut effects = Effects::default();
        let outcome = match self.behaviors.last_mut() {
            Some(behavior) => {
                let mut ctx = Context::new(actor, None, &mut effects);
                behavior.handle_timeout(&mut self.state, &mut ctx)
            }
            None => TimeoutOutcome::Unset,
        };
        match outcome {
            TimeoutOutcome::Unset => Flow::Continue,
            TimeoutOutcome::Exit(reason) => Flow::Terminate(reason),
            TimeoutOutcome::Handled(Ok(())) => self.apply_effects(effects),
            TimeoutOutcome::Handled(Err(error)) => self.fail(actor, error),
        }
    }

    fn resume_continuation(
        &mut self,
        actor: &ActorRef,
        request_id: RequestId,
        current: Option<&Message>,
        outcome: Result<Message, ActorError>,
    ) -> Flow {
        let Some(continuation) = self.continuations.remove(&request_id) else {
            debug!(actor_id = %actor.id(), request_id = %request_id, "No continuation for request outcome");
            return self.check_alive();
        };

        let mut effects = Effects::default();
        let state = &mut self.state;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut ctx = Context::new(actor, current, &mut effects);
            continuation(state, &mut ctx, outcome)
        }));
        match result {
            Ok(Ok(())) => {
                self.next_generation();
                self.requeue_held(actor);
                self.apply_effects(effects)
            }
            Ok(Err(error)) => self.fail(actor, error),
            Err(payload) => self.fail(
                actor,
                ActorError::handler(actor.id(), panic_message(payload.as_ref())),
            ),
        }
    }

    fn dispatch(&mut self, actor: &ActorRef, message: Message) -> Flow {
        let metrics = actor.system().metrics();
        let started = Instant::now();
        let mut effects = Effects::default();
        let outcome = match self.behaviors.last_mut() {
            Some(behavior) => {
                let mut ctx = Context::new(actor, Some(&message), &mut effects);
                behavior.apply(&mut self.state, &mut ctx, &message)
            }
            None => MatchOutcome::Skipped,
        };

        match outcome {
            MatchOutcome::Skipped => {
                metrics.record_skipped();
                self.held.push(message);
                Flow::Continue
            }
            MatchOutcome::Handled(Ok(reply)) => {
                metrics.record_message_handled(started.elapsed());
                if !effects.reply_delegated {
                    send_reply(actor, &message, reply);
                }
                self.next_generation();
                self.requeue_held(actor);
                self.apply_effects(effects)
            }
            MatchOutcome::Handled(Err(error)) => self.fail(actor, error),
        }
    }

    fn apply_effects(&mut self, effects: Effects<S>) -> Flow {
        for op in effects.behavior_ops {
            match op {
                BecomeOp::Replace(behavior) => {
                    self.behaviors.pop();
                    self.behaviors.push(behavior);
                }
                BecomeOp::Push(behavior) => self.behaviors.push(behavior),
                BecomeOp::Pop => {
                    self.behaviors.pop();
                }
            }
            self.next_generation();
        }
        self.continuations.extend(effects.continuations);
        if let Some(trap_exit) = effects.trap_exit {
            self.trap_exit = trap_exit;
        }
        match effects.quit {
            Some(reason) => Flow::Terminate(reason),
            None => self.check_alive(),
        }
    }

    /// An actor without behavior and without pending requests is done
    fn check_alive(&self) -> Flow {
        let has_behavior = self.behaviors.last().map_or(false, |b| !b.is_empty());
        if has_behavior || !self.continuations.is_empty() {
            Flow::Continue
        } else {
            Flow::Terminate(ExitReason::Normal)
        }
    }

    fn fail(&mut self, actor: &ActorRef, error: ActorError) -> Flow {
        actor.system().metrics().record_handler_failure();
        error!(
            actor_id = %actor.id(),
            error = %error,
            category = error.category(),
            "Handler failed, terminating actor"
        );
        Flow::Terminate(ExitReason::UnhandledException)
    }

    fn next_generation(&mut self) {
        self.generation += 1;
    }

    fn requeue_held(&mut self, actor: &ActorRef) {
        if !self.held.is_empty() {
            actor.mailbox().requeue_front(std::mem::take(&mut self.held));
        }
    }

    /// Arm the receive timeout of the current behavior for this generation
    ///
    /// A timeout armed for an older generation is cancelled first.
    fn arm_timeout(&mut self, actor: &ActorRef) -> Option<Instant> {
        if let Some(armed) = &self.armed {
            if armed.generation == self.generation {
                return Some(armed.deadline);
            }
        }
        self.disarm_timeout(actor);

        let duration = self.behaviors.last()?.timeout()?;
        let deadline = deadline_after(duration)?;
        let generation = self.generation;
        let target = actor.downgrade();
        let timer = actor.system().timer().schedule_at(deadline, move || {
            if let Some(actor) = target.upgrade() {
                actor.enqueue(Message::signal(SystemSignal::ReceiveTimeout { generation }));
            }
        });
        self.armed = Some(ArmedTimeout {
            generation,
            deadline,
            timer,
        });
        Some(deadline)
    }

    fn disarm_timeout(&mut self, actor: &ActorRef) {
        if let Some(armed) = self.armed.take() {
            actor.system().timer().cancel(armed.timer);
        }
    }

    fn terminate(&mut self, actor: &ActorRef, reason: ExitReason) {
        self.disarm_timeout(actor);
        if !self.continuations.is_empty() {
            debug!(
                actor_id = %actor.id(),
                pending = self.continuations.len(),
                "Dropping continuations of terminating actor"
            );
            self.continuations.clear();
        }
        actor.finalize(reason, std::mem::take(&mut self.held));
    }
}

impl<S: Send + 'static> Runnable for EventCell<S> {
    fn resume(&mut self, actor: &ActorRef, quantum: usize) -> ResumeResult {
        actor.set_state(ActorState::Running);

        if let Some(init) = self.init.take() {
            if let Flow::Terminate(reason) = self.start(actor, init) {
                self.terminate(actor, reason);
                return ResumeResult::Terminated;
            }
        }

        let mut processed = 0;
        while processed < quantum {
            let Some(message) = actor.mailbox().try_dequeue() else {
                break;
            };
            processed += 1;
            if let Flow::Terminate(reason) = self.process(actor, message) {
                self.terminate(actor, reason);
                return ResumeResult::Terminated;
            }
        }

        if actor.mailbox().is_empty() {
            let deadline = self.arm_timeout(actor);
            actor.set_state(ActorState::AwaitingMessage { deadline });
            ResumeResult::AwaitingMessage
        } else {
            ResumeResult::Yielded
        }
    }
}

/// `[EXIT, Actor(from), Reason(reason)]`, or `Unit` in place of an
/// anonymous sender
pub(crate) fn trapped_exit_message(from: Option<ActorId>, reason: ExitReason) -> Message {
    Message::with_header(
        Header {
            sender: from,
            ..Header::default()
        },
        vec![
            Value::Atom(atoms::EXIT),
            from.map(Value::Actor).unwrap_or(Value::Unit),
            Value::Reason(reason),
        ],
    )
}

/// Send a handler's reply back to the sender of `message`
///
/// Requests always get a response, empty if the handler returned nothing.
pub(crate) fn send_reply(actor: &ActorRef, message: &Message, reply: Reply) {
    let values = match reply {
        Reply::Values(values) => values,
        Reply::None if message.request_id().is_some() => Vec::new(),
        Reply::None | Reply::Skip => return,
    };
    actor.system().reply(actor.id(), message, values);
}
