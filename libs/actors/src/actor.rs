//! Actor Handles and Lifecycle
//!
//! `ActorRef` is the cheap, cloneable handle every sender holds. It owns the
//! mailbox, the scheduling token and the exit bookkeeping (monitors, links,
//! exit callbacks). The message processing logic lives behind the
//! [`Runnable`] trait so event-based and blocking actors share one handle type.
//!
//! Schedule token transitions (event-based actors only):
//!
//! ```text
//!   Idle ──enqueue──► Queued ──worker──► Running ──┬─ Yielded ─────► Queued
//!     ▲                                            ├─ Awaiting ────► Idle
//!     └────────────────────────────────────────────┘  Terminated ──► Dead
//! ```

use crate::atom::atoms;
use crate::error::ExitReason;
use crate::mailbox::{DeadLetterSink, Mailbox};
use crate::message::{Header, IntoValues, Message, Priority};
use crate::registry::ActorId;
use crate::system::ActorSystem;
use crate::value::Value;
use parking_lot::Mutex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info};

pub(crate) const IDLE: u8 = 0;
pub(crate) const QUEUED: u8 = 1;
pub(crate) const RUNNING: u8 = 2;
pub(crate) const DEAD: u8 = 3;

/// Observable lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    /// Spawned; the startup hook has not run yet
    Initializing,
    /// Processing messages
    Running,
    /// Mailbox empty; waiting for a message or the receive deadline
    AwaitingMessage { deadline: Option<Instant> },
    /// Quantum exhausted; waiting for a worker
    Suspended,
    /// Absorbing final state
    Terminated,
}

/// How the actor is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorKind {
    /// Scheduled cooperatively on the worker pool
    EventBased,
    /// Runs on its own thread and blocks in `receive`
    Blocking,
}

/// Outcome of one scheduling quantum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResumeResult {
    /// Quantum exhausted with messages left
    Yielded,
    /// Mailbox drained
    AwaitingMessage,
    Terminated,
}

/// Message processing logic of a scheduled actor
pub(crate) trait Runnable: Send {
    fn resume(&mut self, actor: &ActorRef, quantum: usize) -> ResumeResult;
}

/// Something to notify when the actor terminates
enum Attachable {
    Monitor(ActorRef),
    Link(ActorRef),
    Callback(Box<dyn FnOnce(ExitReason) + Send>),
}

#[derive(Default)]
struct ExitState {
    reason: Option<ExitReason>,
    attached: Vec<Attachable>,
}

struct ActorInner {
    id: ActorId,
    kind: ActorKind,
    /// Hidden actors (scoped actors) do not count as running
    hidden: bool,
    mailbox: Mailbox,
    schedule: AtomicU8,
    state: Mutex<ActorState>,
    runner: Mutex<Option<Box<dyn Runnable>>>,
    exit: Mutex<ExitState>,
    system: ActorSystem,
}

/// Handle to an actor
#[derive(Clone)]
pub struct ActorRef {
    inner: Arc<ActorInner>,
}

impl ActorRef {
    pub(crate) fn new(kind: ActorKind, system: ActorSystem, hidden: bool) -> Self {
        let id = ActorId::next();
        // Event-based actors start queued so the startup hook runs first
        let schedule = match kind {
            ActorKind::EventBased => QUEUED,
            ActorKind::Blocking => RUNNING,
        };
        Self {
            inner: Arc::new(ActorInner {
                id,
                kind,
                hidden,
                mailbox: Mailbox::new(id),
                schedule: AtomicU8::new(schedule),
                state: Mutex::new(ActorState::Initializing),
                runner: Mutex::new(None),
                exit: Mutex::new(ExitState::default()),
                system,
            }),
        }
    }

    pub fn id(&self) -> ActorId {
        self.inner.id
    }

    pub fn kind(&self) -> ActorKind {
        self.inner.kind
    }

    pub fn state(&self) -> ActorState {
        *self.inner.state.lock()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == ActorState::Terminated
    }

    /// Exit reason once terminated
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.inner.exit.lock().reason
    }

    /// Messages waiting in the mailbox (held messages excluded)
    pub fn mailbox_len(&self) -> usize {
        self.inner.mailbox.len()
    }

    /// Send an anonymous normal-priority message
    pub fn send(&self, values: impl IntoValues) -> bool {
        self.enqueue(Message::new(values))
    }

    /// Send an anonymous high-priority message
    pub fn send_urgent(&self, values: impl IntoValues) -> bool {
        self.enqueue(Message::with_header(
            Header {
                priority: Priority::High,
                ..Header::default()
            },
            values.into_values(),
        ))
    }

    /// Deliver a prepared message
    ///
    /// Returns `false` when the actor has terminated and the message went to
    /// dead letters.
    pub fn enqueue(&self, message: Message) -> bool {
        if !message.is_signal() {
            self.inner.system.metrics().record_message_priority(message.priority());
        }
        let result = self.inner.mailbox.enqueue(message);
        if result.became_non_empty {
            self.wake();
        }
        !result.redirected
    }

    /// Ask the actor to exit; trappable unless `reason` is `Kill`
    pub fn exit(&self, reason: ExitReason) -> bool {
        self.enqueue(Message::exit(None, reason))
    }

    /// Terminate the actor unconditionally
    pub fn kill(&self) -> bool {
        self.exit(ExitReason::Kill)
    }

    /// Run `callback` once with the exit reason; immediately if already dead
    pub fn on_exit(&self, callback: impl FnOnce(ExitReason) + Send + 'static) {
        self.attach(Attachable::Callback(Box::new(callback)));
    }

    pub(crate) fn system(&self) -> &ActorSystem {
        &self.inner.system
    }

    pub(crate) fn mailbox(&self) -> &Mailbox {
        &self.inner.mailbox
    }

    pub(crate) fn is_hidden(&self) -> bool {
        self.inner.hidden
    }

    pub(crate) fn set_state(&self, state: ActorState) {
        let mut current = self.inner.state.lock();
        if *current != ActorState::Terminated {
            *current = state;
        }
    }

    pub(crate) fn install_runner(&self, runner: Box<dyn Runnable>) {
        *self.inner.runner.lock() = Some(runner);
    }

    pub(crate) fn schedule_state(&self) -> u8 {
        self.inner.schedule.load(Ordering::Acquire)
    }

    pub(crate) fn set_schedule_state(&self, state: u8) {
        self.inner.schedule.store(state, Ordering::Release);
    }

    /// Claim the schedule token; only the winner may queue the actor
    pub(crate) fn try_claim(&self) -> bool {
        self.inner
            .schedule
            .compare_exchange(IDLE, QUEUED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn wake(&self) {
        if self.inner.kind == ActorKind::EventBased && self.try_claim() {
            self.inner.system.scheduler().schedule(self.clone());
        }
    }

    /// Run one quantum; drops the runner once the actor terminates
    pub(crate) fn resume(&self, quantum: usize) -> ResumeResult {
        let mut runner = self.inner.runner.lock();
        let result = match runner.as_mut() {
            Some(runner) => runner.resume(self, quantum),
            None => ResumeResult::Terminated,
        };
        if result == ResumeResult::Terminated {
            *runner = None;
        }
        result
    }

    /// Drop the runner of an actor that will never be scheduled again
    ///
    /// Skipped if a worker is still inside the runner.
    pub(crate) fn discard_runner(&self) {
        let runner = self.inner.runner.try_lock().and_then(|mut runner| runner.take());
        drop(runner);
    }

    /// Handle that does not keep the actor alive
    pub(crate) fn downgrade(&self) -> WeakActorRef {
        WeakActorRef {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// `watcher` receives `[DOWN, Actor(id), Reason(r)]` when this actor exits
    pub(crate) fn add_monitor(&self, watcher: &ActorRef) {
        self.attach(Attachable::Monitor(watcher.clone()));
    }

    pub(crate) fn remove_monitor(&self, watcher: ActorId) {
        self.inner
            .exit
            .lock()
            .attached
            .retain(|a| !matches!(a, Attachable::Monitor(w) if w.id() == watcher));
    }

    /// One side of a link; `peer` receives an exit signal when this actor exits
    pub(crate) fn add_link(&self, peer: &ActorRef) {
        self.attach(Attachable::Link(peer.clone()));
    }

    pub(crate) fn remove_link(&self, peer: ActorId) {
        self.inner
            .exit
            .lock()
            .attached
            .retain(|a| !matches!(a, Attachable::Link(p) if p.id() == peer));
    }

    fn attach(&self, attachable: Attachable) {
        let mut exit = self.inner.exit.lock();
        match exit.reason {
            Some(reason) => {
                drop(exit);
                self.notify(attachable, reason);
            }
            None => exit.attached.push(attachable),
        }
    }

    fn notify(&self, attachable: Attachable, reason: ExitReason) {
        let id = self.id();
        match attachable {
            Attachable::Monitor(watcher) => {
                watcher.enqueue(Message::with_header(
                    Header {
                        sender: Some(id),
                        ..Header::default()
                    },
                    vec![Value::Atom(atoms::DOWN), Value::Actor(id), Value::Reason(reason)],
                ));
            }
            Attachable::Link(peer) => {
                peer.enqueue(Message::exit(Some(id), reason));
            }
            Attachable::Callback(callback) => callback(reason),
        }
    }

    /// Common termination path for both actor kinds
    ///
    /// `held` are messages the actor skipped and still owned.
    pub(crate) fn finalize(&self, reason: ExitReason, held: Vec<Message>) {
        let already_terminated = {
            let mut state = self.inner.state.lock();
            let already_terminated = *state == ActorState::Terminated;
            *state = ActorState::Terminated;
            already_terminated
        };

        let system = &self.inner.system;
        let sink: Arc<dyn DeadLetterSink> = system.dead_letters();
        if already_terminated {
            // A receive loop that lost the race against shutdown still owns these
            for message in held {
                sink.deliver(self.id(), message);
            }
            return;
        }

        let drained = self.inner.mailbox.close(Arc::clone(&sink));
        let held_count = held.len();
        for message in held {
            sink.deliver(self.id(), message);
        }

        system.correlator().cancel_origin(self.id());
        system.correlator().fail_target(self.id());

        let attached = {
            let mut exit = self.inner.exit.lock();
            exit.reason = Some(reason);
            std::mem::take(&mut exit.attached)
        };
        for attachable in attached {
            self.notify(attachable, reason);
        }

        system.registry().unregister_actor(self.id());
        system.metrics().record_actor_stopped();

        if reason.is_normal() {
            debug!(actor_id = %self.id(), drained, held = held_count, "Actor terminated");
        } else {
            info!(
                actor_id = %self.id(),
                reason = %reason,
                drained,
                held = held_count,
                "Actor terminated"
            );
        }
    }
}

/// Non-owning actor handle, used by timers
#[derive(Clone)]
pub(crate) struct WeakActorRef {
    inner: Weak<ActorInner>,
}

impl WeakActorRef {
    pub(crate) fn upgrade(&self) -> Option<ActorRef> {
        self.inner.upgrade().map(|inner| ActorRef { inner })
    }
}

impl PartialEq for ActorRef {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for ActorRef {}

impl Hash for ActorRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRef")
            .field("id", &self.id())
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.id(), f)
    }
}
