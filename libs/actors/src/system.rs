//! Actor System
//!
//! The `ActorSystem` ties the runtime together: registry, request
//! correlator, timer thread, worker pool, dead letters and metrics. It is a
//! cheap `Clone` handle; every actor and every handler context carries one,
//! so there are no process globals and several systems can coexist.
//!
//! Call [`ActorSystem::shutdown`] when done. Actors hold the system handle,
//! so dropping the last external handle does not stop the worker threads.

use crate::actor::{ActorKind, ActorRef};
use crate::behavior::{panic_message, Behavior};
use crate::blocking::ScopedActor;
use crate::cell::EventCell;
use crate::context::Context;
use crate::correlator::{Correlator, ResponseFuture};
use crate::dead_letter::DeadLetters;
use crate::error::{ActorError, ExitReason, Result};
use crate::mailbox::DeadLetterSink;
use crate::message::{Correlation, Header, IntoValues, Message, Priority, RequestId};
use crate::registry::{ActorId, ActorRegistry};
use crate::scheduler::Scheduler;
use crate::snapshot::Snapshot;
use crate::timer::Timer;
use crate::value::Value;
use actor_config::RuntimeConfig;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Thread name prefix for workers and the timer
const THREAD_PREFIX: &str = "actors";

/// System-wide metrics
#[derive(Debug, Default)]
pub struct SystemMetrics {
    pub actors_spawned: AtomicU64,
    pub actors_stopped: AtomicU64,
    pub messages_processed: AtomicU64,
    pub total_processing_time_ns: AtomicU64,

    // Mailbox metrics
    pub high_priority_messages: AtomicU64,
    pub normal_priority_messages: AtomicU64,
    pub skipped_messages: AtomicU64,
    pub dead_letters: AtomicU64,

    // Failure metrics
    pub guard_failures: AtomicU64,
    pub handler_failures: AtomicU64,

    // Request metrics
    pub requests_issued: AtomicU64,
    pub requests_timed_out: AtomicU64,

    // Scheduler metrics
    pub quanta_run: AtomicU64,
    pub total_quantum_time_ns: AtomicU64,
}

impl SystemMetrics {
    pub fn record_actor_spawned(&self) {
        self.actors_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_actor_stopped(&self) {
        self.actors_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_handled(&self, duration: Duration) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        self.total_processing_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn avg_processing_time_ns(&self) -> f64 {
        let count = self.messages_processed.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let total = self.total_processing_time_ns.load(Ordering::Relaxed);
        total as f64 / count as f64
    }

    /// Record message priority
    pub fn record_message_priority(&self, priority: Priority) {
        match priority {
            Priority::High => self.high_priority_messages.fetch_add(1, Ordering::Relaxed),
            Priority::Normal => self.normal_priority_messages.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// A message matched no behavior entry and was held
    pub fn record_skipped(&self) {
        self.skipped_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_guard_failure(&self) {
        self.guard_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_letters.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_issued(&self) {
        self.requests_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_timeout(&self) {
        self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// One scheduling quantum of an event-based actor
    pub fn record_quantum(&self, duration: Duration) {
        self.quanta_run.fetch_add(1, Ordering::Relaxed);
        self.total_quantum_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Get metrics snapshot
    pub fn snapshot(&self) -> SystemStats {
        let quanta_run = self.quanta_run.load(Ordering::Relaxed);
        let avg_quantum_time_ns = if quanta_run == 0 {
            0.0
        } else {
            self.total_quantum_time_ns.load(Ordering::Relaxed) as f64 / quanta_run as f64
        };

        SystemStats {
            actors_spawned: self.actors_spawned.load(Ordering::Relaxed),
            actors_stopped: self.actors_stopped.load(Ordering::Relaxed),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            avg_processing_time_ns: self.avg_processing_time_ns(),
            high_priority_messages: self.high_priority_messages.load(Ordering::Relaxed),
            normal_priority_messages: self.normal_priority_messages.load(Ordering::Relaxed),
            skipped_messages: self.skipped_messages.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
            guard_failures: self.guard_failures.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            requests_issued: self.requests_issued.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            quanta_run,
            avg_quantum_time_ns,
        }
    }
}

/// Point-in-time copy of [`SystemMetrics`]
#[derive(Debug, Clone, PartialEq)]
pub struct SystemStats {
    pub actors_spawned: u64,
    pub actors_stopped: u64,
    pub messages_processed: u64,
    pub avg_processing_time_ns: f64,
    pub high_priority_messages: u64,
    pub normal_priority_messages: u64,
    pub skipped_messages: u64,
    pub dead_letters: u64,
    pub guard_failures: u64,
    pub handler_failures: u64,
    pub requests_issued: u64,
    pub requests_timed_out: u64,
    pub quanta_run: u64,
    pub avg_quantum_time_ns: f64,
}

/// Core actor system managing actor lifecycles and routing
pub struct ActorSystem {
    /// System ID for debugging
    system_id: Arc<str>,

    config: Arc<RuntimeConfig>,

    /// Live actors and names
    registry: Arc<ActorRegistry>,

    /// Pending requests
    correlator: Arc<Correlator>,

    /// Request deadlines and receive timeouts
    timer: Arc<Timer>,

    /// Worker pool for event-based actors
    scheduler: Arc<Scheduler>,

    dead_letters: Arc<DeadLetters>,

    /// System-wide metrics
    metrics: Arc<SystemMetrics>,

    shutting_down: Arc<AtomicBool>,
}

impl Clone for ActorSystem {
    fn clone(&self) -> Self {
        Self {
            system_id: Arc::clone(&self.system_id),
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            correlator: Arc::clone(&self.correlator),
            timer: Arc::clone(&self.timer),
            scheduler: Arc::clone(&self.scheduler),
            dead_letters: Arc::clone(&self.dead_letters),
            metrics: Arc::clone(&self.metrics),
            shutting_down: Arc::clone(&self.shutting_down),
        }
    }
}

impl ActorSystem {
    /// Start a system: validates `config`, then starts the timer thread and
    /// the worker pool
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ActorError::configuration(e.to_string()))?;

        let system_id: Arc<str> = format!("system-{}", Uuid::new_v4()).into();
        let metrics = Arc::new(SystemMetrics::default());
        let timer = Arc::new(Timer::start(THREAD_PREFIX).map_err(|e| {
            ActorError::configuration(format!("failed to start timer thread: {}", e))
        })?);
        let scheduler = Arc::new(
            Scheduler::start(
                THREAD_PREFIX,
                config.scheduler.worker_count(),
                config.scheduler.quantum,
                Arc::clone(&metrics),
            )
            .map_err(|e| {
                timer.shutdown();
                ActorError::configuration(format!("failed to start worker threads: {}", e))
            })?,
        );
        let correlator = Arc::new(Correlator::new(Arc::clone(&timer), Arc::clone(&metrics)));
        let dead_letters = Arc::new(DeadLetters::new(
            &config.dead_letters,
            Arc::clone(&correlator),
            Arc::clone(&metrics),
        ));

        info!(
            system_id = %system_id,
            workers = scheduler.worker_count(),
            quantum = scheduler.quantum(),
            "Actor system started"
        );

        Ok(Self {
            system_id,
            config: Arc::new(config),
            registry: Arc::new(ActorRegistry::new()),
            correlator,
            timer,
            scheduler,
            dead_letters,
            metrics,
            shutting_down: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Start a system with the default configuration
    pub fn with_defaults() -> Result<Self> {
        Self::new(RuntimeConfig::default())
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Get system metrics
    pub fn metrics(&self) -> &SystemMetrics {
        &self.metrics
    }

    pub fn dead_letters(&self) -> Arc<DeadLetters> {
        Arc::clone(&self.dead_letters)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub(crate) fn timer(&self) -> &Timer {
        &self.timer
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub(crate) fn registry(&self) -> &ActorRegistry {
        &self.registry
    }

    /// Spawn a stateless event-based actor
    ///
    /// `init` runs on a worker before the first message and returns the
    /// initial behavior.
    pub fn spawn<F>(&self, init: F) -> ActorRef
    where
        F: FnOnce(&mut Context<'_, ()>) -> Behavior<()> + Send + 'static,
    {
        self.spawn_with((), move |_, ctx| init(ctx))
    }

    /// Spawn an event-based actor owning `state`
    pub fn spawn_with<S, F>(&self, state: S, init: F) -> ActorRef
    where
        S: Send + 'static,
        F: FnOnce(&mut S, &mut Context<'_, S>) -> Behavior<S> + Send + 'static,
    {
        let actor = ActorRef::new(ActorKind::EventBased, self.clone(), false);
        actor.install_runner(Box::new(EventCell::new(state, Box::new(init))));
        self.registry.register_actor(actor.clone());
        self.metrics.record_actor_spawned();

        if self.is_shutting_down() {
            warn!(actor_id = %actor.id(), "Spawn during shutdown; terminating immediately");
            actor.finalize(ExitReason::UserShutdown, Vec::new());
            actor.discard_runner();
            return actor;
        }

        debug!(actor_id = %actor.id(), "Spawned event-based actor");
        self.scheduler.schedule(actor.clone());
        actor
    }

    /// Spawn an event-based actor whose state is restored from `bytes`
    pub fn spawn_restored<S, F>(&self, bytes: &[u8], init: F) -> Result<ActorRef>
    where
        S: Snapshot + Send + 'static,
        F: FnOnce(&mut S, &mut Context<'_, S>) -> Behavior<S> + Send + 'static,
    {
        let state = S::restore(bytes)?;
        Ok(self.spawn_with(state, init))
    }

    /// Run `f` as a blocking actor on a dedicated thread
    ///
    /// The actor terminates when `f` returns: normally on `Ok`, with
    /// `UnhandledException` on `Err` or a panic, or with the exit reason it
    /// received while receiving.
    pub fn spawn_blocking<F>(&self, f: F) -> Result<ActorRef>
    where
        F: FnOnce(&mut ScopedActor) -> Result<()> + Send + 'static,
    {
        let actor = ActorRef::new(ActorKind::Blocking, self.clone(), false);
        self.registry.register_actor(actor.clone());
        self.metrics.record_actor_spawned();

        let id = actor.id();
        let mut scoped = ScopedActor::new(actor.clone());
        thread::Builder::new()
            .name(format!("{}-blocking-{}", THREAD_PREFIX, id.as_u64()))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&mut scoped)));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => scoped.fail(&error),
                    Err(payload) => {
                        scoped.fail(&ActorError::handler(id, panic_message(payload.as_ref())))
                    }
                }
            })
            .map_err(|e| ActorError::handler(id, format!("failed to spawn thread: {}", e)))?;

        debug!(actor_id = %id, "Spawned blocking actor");
        Ok(actor)
    }

    /// Blocking actor bound to the calling thread
    ///
    /// Hidden: it does not count towards [`ActorSystem::running_actors`].
    pub fn scoped(&self) -> ScopedActor {
        let actor = ActorRef::new(ActorKind::Blocking, self.clone(), true);
        self.registry.register_actor(actor.clone());
        self.metrics.record_actor_spawned();
        ScopedActor::new(actor)
    }

    /// Send a request from outside any actor
    ///
    /// The returned future resolves to the response, or to `RequestTimeout`,
    /// `TargetUnreachable` or `RequestCancelled`.
    pub fn request(
        &self,
        target: &ActorRef,
        values: impl IntoValues,
        timeout: Duration,
    ) -> ResponseFuture {
        self.request_direct(None, target, values.into_values(), timeout)
    }

    /// [`ActorSystem::request`] with the configured default timeout
    pub fn request_default(&self, target: &ActorRef, values: impl IntoValues) -> ResponseFuture {
        self.request(target, values, self.config.requests.default_timeout())
    }

    pub(crate) fn request_direct(
        &self,
        origin: Option<ActorId>,
        target: &ActorRef,
        values: Vec<Value>,
        timeout: Duration,
    ) -> ResponseFuture {
        let request_id = self.correlator.next_id();
        let future = self
            .correlator
            .register_direct(request_id, origin, target.id(), timeout);
        self.dispatch_request(origin, request_id, target, values);
        future
    }

    pub(crate) fn request_into_mailbox(
        &self,
        origin: &ActorRef,
        target: &ActorRef,
        values: Vec<Value>,
        timeout: Duration,
    ) -> RequestId {
        let request_id = self.correlator.next_id();
        self.correlator
            .register_mailbox(request_id, origin, target.id(), timeout);
        self.dispatch_request(Some(origin.id()), request_id, target, values);
        request_id
    }

    fn dispatch_request(
        &self,
        origin: Option<ActorId>,
        request_id: RequestId,
        target: &ActorRef,
        values: Vec<Value>,
    ) {
        if self.is_shutting_down() {
            self.correlator.fail(request_id, ActorError::SystemShutdown);
            return;
        }
        let message = Message::with_header(
            Header {
                sender: origin,
                correlation: Correlation::Request(request_id),
                ..Header::default()
            },
            values,
        );
        // A dead target routes the request through dead letters, which fail it
        if !target.enqueue(message) {
            debug!(request_id = %request_id, target = %target.id(), "Request sent to terminated actor");
        }
    }

    /// Resolve request `request_id` with a response from `responder`
    pub(crate) fn respond(&self, responder: ActorId, request_id: RequestId, values: Vec<Value>) -> bool {
        let response = Message::with_header(
            Header {
                sender: Some(responder),
                correlation: Correlation::Response(request_id),
                ..Header::default()
            },
            values,
        );
        self.correlator.route_response(request_id, response)
    }

    /// Answer `message`: through the correlator for requests, otherwise as a
    /// plain message to its sender
    pub(crate) fn reply(&self, responder: ActorId, message: &Message, values: Vec<Value>) {
        if let Some(request_id) = message.request_id() {
            self.respond(responder, request_id, values);
            return;
        }
        match message.sender() {
            Some(sender) => {
                let reply = Message::with_header(
                    Header {
                        sender: Some(responder),
                        ..Header::default()
                    },
                    values,
                );
                self.deliver(sender, reply);
            }
            None => debug!(actor_id = %responder, "Dropping reply to anonymous message"),
        }
    }

    /// Deliver `message` to the actor with `id`
    ///
    /// Unknown or terminated actors route the message to dead letters.
    pub fn deliver(&self, id: ActorId, message: Message) -> bool {
        match self.registry.find_actor(id) {
            Some(actor) => actor.enqueue(message),
            None => {
                self.dead_letters.deliver(id, message);
                false
            }
        }
    }

    /// Live actor by id
    pub fn lookup(&self, id: ActorId) -> Option<ActorRef> {
        self.registry.find_actor(id)
    }

    /// Bind `name` to `actor`; the binding is removed when the actor exits
    pub fn register(&self, name: impl Into<String>, actor: &ActorRef) -> Option<ActorRef> {
        self.registry.register_name(name, actor)
    }

    pub fn unregister(&self, name: &str) -> Option<ActorRef> {
        self.registry.unregister_name(name)
    }

    pub fn whereis(&self, name: &str) -> Option<ActorRef> {
        self.registry.whereis(name)
    }

    /// Running actors, excluding scoped actors
    pub fn running_actors(&self) -> usize {
        self.registry.running_count()
    }

    /// Block until every non-scoped actor has terminated
    pub fn await_all_actors_done(&self, timeout: Duration) -> bool {
        self.registry.await_all_done(timeout)
    }

    /// Kill all actors and stop the runtime threads
    ///
    /// Waits up to `shutdown.timeout_ms` for actors to terminate; the rest
    /// are terminated with `UserShutdown`. Pending requests fail with
    /// `SystemShutdown`. Idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let started = Instant::now();
        info!(system_id = %self.system_id, actors = self.registry.total_actors(), "Shutting down actor system");

        for actor in self.registry.list_actors() {
            actor.kill();
        }
        if !self.registry.await_all_done(self.config.shutdown.timeout()) {
            warn!(
                system_id = %self.system_id,
                remaining = self.registry.running_count(),
                "Actors still running after shutdown timeout"
            );
        }

        let cancelled = self.correlator.cancel_all();
        self.scheduler.shutdown();
        self.timer.shutdown();

        for actor in self.registry.list_actors() {
            actor.finalize(ExitReason::UserShutdown, Vec::new());
            actor.discard_runner();
        }

        info!(
            system_id = %self.system_id,
            cancelled_requests = cancelled,
            dead_letters = self.dead_letters.count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Actor system stopped"
        );
    }
}

impl std::fmt::Debug for ActorSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorSystem")
            .field("system_id", &self.system_id)
            .field("registry", &self.registry)
            .field("pending_requests", &self.correlator.pending_count())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::Reply;
    use actor_config::SchedulerConfig;

    fn system() -> ActorSystem {
        ActorSystem::new(RuntimeConfig {
            scheduler: SchedulerConfig {
                worker_threads: Some(2),
                quantum: 8,
            },
            ..RuntimeConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_system_metrics() {
        let metrics = SystemMetrics::default();
        assert_eq!(metrics.avg_processing_time_ns(), 0.0);

        metrics.record_message_handled(Duration::from_nanos(100));
        metrics.record_message_handled(Duration::from_nanos(300));
        assert_eq!(metrics.avg_processing_time_ns(), 200.0);

        metrics.record_message_priority(Priority::High);
        metrics.record_message_priority(Priority::Normal);
        metrics.record_message_priority(Priority::Normal);
        let stats = metrics.snapshot();
        assert_eq!(stats.messages_processed, 2);
        assert_eq!(stats.high_priority_messages, 1);
        assert_eq!(stats.normal_priority_messages, 2);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.scheduler.quantum = 0;
        let error = ActorSystem::new(config).unwrap_err();
        assert_eq!(error.category(), "configuration");
    }

    #[test]
    fn test_system_id_format() {
        let system = system();
        assert!(system.system_id().starts_with("system-"));
        assert_eq!(system.scheduler().worker_count(), 2);
        system.shutdown();
    }

    #[test]
    fn test_spawn_and_shutdown() {
        let system = system();
        let actor = system.spawn(|_ctx| Behavior::new().on(|_, _, (_n,): (i64,)| Reply::none()));
        assert_eq!(system.running_actors(), 1);
        assert_eq!(system.lookup(actor.id()), Some(actor.clone()));

        system.shutdown();
        assert!(actor.is_terminated());
        assert_eq!(system.running_actors(), 0);
        assert!(system.lookup(actor.id()).is_none());
        assert_eq!(system.metrics().snapshot().actors_stopped, 1);

        // Idempotent
        system.shutdown();
    }

    #[test]
    fn test_deliver_to_unknown_actor_is_dead_letter() {
        let system = system();
        assert!(!system.deliver(ActorId::from_raw(u64::MAX), Message::new((1i64,))));
        assert_eq!(system.dead_letters().count(), 1);
        system.shutdown();
    }

    #[test]
    fn test_requests_fail_after_shutdown() {
        let system = system();
        let actor = system.spawn(|_ctx| Behavior::new().on(|_, _, (n,): (i64,)| Reply::value(n)));
        system.shutdown();

        let result = system.request(&actor, (1i64,), Duration::from_millis(50)).wait();
        assert!(result.is_err());
    }

    #[test]
    fn test_resolved_requests_release_timers() {
        let system = system();
        let hour = Duration::from_secs(3600);
        let echo = system.spawn(move |_ctx| {
            Behavior::new()
                .on(|_, _, (n,): (i64,)| Reply::value(n))
                .after(hour, |_, _| Ok(()))
        });

        for n in 0..1000i64 {
            let response = system.request(&echo, (n,), hour).wait().unwrap();
            assert_eq!(response.get_as::<i64>(0).unwrap(), n);
        }

        assert_eq!(system.correlator().pending_count(), 0);
        // At most the receive timeout of the idle echo actor
        assert!(system.timer().pending() <= 1);
        system.shutdown();
    }

    #[test]
    fn test_late_finalize_sends_held_messages_to_dead_letters() {
        let system = system();
        let scoped = system.scoped();
        let actor = scoped.actor_ref().clone();
        actor.finalize(ExitReason::Kill, Vec::new());

        // A request the receive loop was still holding when shutdown won
        let request_id = system.correlator().next_id();
        let future = system
            .correlator()
            .register_direct(request_id, None, actor.id(), Duration::from_secs(5));
        let held = Message::new((1i64,)).with_correlation(Correlation::Request(request_id));
        actor.finalize(ExitReason::UserShutdown, vec![held]);

        assert_eq!(system.dead_letters().count(), 1);
        assert_eq!(
            future.wait(),
            Err(ActorError::TargetUnreachable { target: actor.id() })
        );
        assert_eq!(actor.exit_reason(), Some(ExitReason::Kill));
        drop(scoped);
        system.shutdown();
    }

    #[test]
    fn test_scoped_actor_is_hidden() {
        let system = system();
        let scoped = system.scoped();
        assert_eq!(system.running_actors(), 0);
        assert!(system.lookup(scoped.id()).is_some());

        let id = scoped.id();
        drop(scoped);
        assert!(system.lookup(id).is_none());
        system.shutdown();
    }
}
