//! Behaviors
//!
//! A behavior is an ordered list of entries, each a [`Pattern`] with an
//! optional guard and a handler. Applying a behavior to a message runs the
//! handler of the first entry whose pattern accepts the message and whose
//! guard passes. An `others` entry is always tried last. A message that no
//! entry accepts is *skipped*: the caller holds it and retries it after the
//! next handled message.
//!
//! ```ignore
//! let counter = Behavior::new()
//!     .on_atom(atoms::ADD, |total: &mut i64, _ctx, (n,): (i64,)| {
//!         *total += n;
//!         Reply::value(*total)
//!     })
//!     .on_atom(atoms::GET, |total, _ctx, ()| Reply::value(*total))
//!     .after(Duration::from_secs(5), |_, ctx| {
//!         ctx.quit(ExitReason::Normal);
//!         Ok(())
//!     });
//! ```

use crate::atom::Atom;
use crate::context::Context;
use crate::error::{ActorError, ExitReason};
use crate::message::{FromMessage, IntoValues, Message};
use crate::value::{Value, ValueType};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use tracing::warn;

/// Handler return value
pub type HandlerResult = Result<Reply, ActorError>;

/// What a handler produced
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Nothing to send back; a request still receives an empty response
    None,
    /// Sent back to the sender, as the response if the message was a request
    Values(Vec<Value>),
    /// The handler declined the message; it is held like an unmatched one
    Skip,
}

impl Reply {
    pub fn none() -> HandlerResult {
        Ok(Reply::None)
    }

    pub fn value(value: impl Into<Value>) -> HandlerResult {
        Ok(Reply::Values(vec![value.into()]))
    }

    pub fn values(values: impl IntoValues) -> HandlerResult {
        Ok(Reply::Values(values.into_values()))
    }

    pub fn skip() -> HandlerResult {
        Ok(Reply::Skip)
    }
}

/// Result of applying a behavior to one message
#[derive(Debug)]
pub enum MatchOutcome {
    /// An entry matched and its handler ran exactly once
    Handled(HandlerResult),
    /// No entry matched or the handler skipped
    Skipped,
}

/// Single element test
#[derive(Debug, Clone, PartialEq)]
pub enum Matcher {
    /// Any value with this tag
    Type(ValueType),
    /// Exactly this value
    Exact(Value),
    /// Any value
    Any,
}

impl Matcher {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Matcher::Type(ty) => value.value_type() == *ty,
            Matcher::Exact(expected) => value == expected,
            Matcher::Any => true,
        }
    }
}

/// Element-wise message pattern
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pattern {
    elements: Vec<Matcher>,
    /// Accept any number of trailing values
    rest: bool,
}

impl Pattern {
    pub fn new(elements: Vec<Matcher>) -> Self {
        Self {
            elements,
            rest: false,
        }
    }

    /// Pattern accepting exactly the element types of `T`
    pub fn of<T: FromMessage>() -> Self {
        Self::new(Self::matchers_for::<T>())
    }

    /// Pattern accepting `tag` followed by the element types of `T`
    pub fn tagged<T: FromMessage>(tag: Atom) -> Self {
        let mut elements = vec![Matcher::Exact(Value::Atom(tag))];
        elements.extend(Self::matchers_for::<T>());
        Self::new(elements)
    }

    /// Also accept trailing values after the listed elements
    pub fn with_rest(mut self) -> Self {
        self.rest = true;
        self
    }

    pub fn matches(&self, values: &[Value]) -> bool {
        let arity_ok = if self.rest {
            values.len() >= self.elements.len()
        } else {
            values.len() == self.elements.len()
        };
        arity_ok
            && self
                .elements
                .iter()
                .zip(values)
                .all(|(matcher, value)| matcher.matches(value))
    }

    fn matchers_for<T: FromMessage>() -> Vec<Matcher> {
        T::signature()
            .into_iter()
            .map(|ty| ty.map(Matcher::Type).unwrap_or(Matcher::Any))
            .collect()
    }
}

pub(crate) type Handler<S> =
    Box<dyn FnMut(&mut S, &mut Context<'_, S>, &Message) -> HandlerResult + Send>;

type Guard = Box<dyn Fn(&Message) -> bool + Send>;

type TimeoutHandler<S> =
    Box<dyn FnMut(&mut S, &mut Context<'_, S>) -> Result<(), ActorError> + Send>;

struct Entry<S> {
    pattern: Pattern,
    guard: Option<Guard>,
    handler: Handler<S>,
}

enum TimeoutAction<S> {
    Handler(TimeoutHandler<S>),
    Exit,
}

struct ReceiveTimeout<S> {
    duration: Duration,
    action: TimeoutAction<S>,
}

/// Outcome of a behavior receive timeout
#[derive(Debug)]
pub(crate) enum TimeoutOutcome {
    Handled(Result<(), ActorError>),
    Exit(ExitReason),
    /// The behavior has no timeout
    Unset,
}

/// Ordered message handlers over actor state `S`
pub struct Behavior<S> {
    entries: Vec<Entry<S>>,
    fallback: Option<Handler<S>>,
    timeout: Option<ReceiveTimeout<S>>,
}

impl<S> Default for Behavior<S> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            fallback: None,
            timeout: None,
        }
    }
}

impl<S: 'static> Behavior<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle messages whose elements unpack into `T`
    pub fn on<T, F>(self, mut handler: F) -> Self
    where
        T: FromMessage + 'static,
        F: FnMut(&mut S, &mut Context<'_, S>, T) -> HandlerResult + Send + 'static,
    {
        self.push(
            Pattern::of::<T>(),
            None,
            Box::new(move |state, ctx, msg| {
                let args = msg.unpack::<T>()?;
                handler(state, ctx, args)
            }),
        )
    }

    /// Like [`Behavior::on`], only if `guard` accepts the unpacked elements
    pub fn on_if<T, G, F>(self, guard: G, mut handler: F) -> Self
    where
        T: FromMessage + 'static,
        G: Fn(&T) -> bool + Send + 'static,
        F: FnMut(&mut S, &mut Context<'_, S>, T) -> HandlerResult + Send + 'static,
    {
        self.push(
            Pattern::of::<T>(),
            Some(Box::new(move |msg: &Message| {
                msg.unpack::<T>().map(|args| guard(&args)).unwrap_or(false)
            })),
            Box::new(move |state, ctx, msg| {
                let args = msg.unpack::<T>()?;
                handler(state, ctx, args)
            }),
        )
    }

    /// Handle messages tagged with `tag`; the handler receives the remaining
    /// elements as `T`
    pub fn on_atom<T, F>(self, tag: Atom, mut handler: F) -> Self
    where
        T: FromMessage + 'static,
        F: FnMut(&mut S, &mut Context<'_, S>, T) -> HandlerResult + Send + 'static,
    {
        self.push(
            Pattern::tagged::<T>(tag),
            None,
            Box::new(move |state, ctx, msg| {
                let args = T::from_values(&msg.values()[1..])?;
                handler(state, ctx, args)
            }),
        )
    }

    /// Guarded [`Behavior::on_atom`]
    pub fn on_atom_if<T, G, F>(self, tag: Atom, guard: G, mut handler: F) -> Self
    where
        T: FromMessage + 'static,
        G: Fn(&T) -> bool + Send + 'static,
        F: FnMut(&mut S, &mut Context<'_, S>, T) -> HandlerResult + Send + 'static,
    {
        self.push(
            Pattern::tagged::<T>(tag),
            Some(Box::new(move |msg: &Message| {
                T::from_values(&msg.values()[1..])
                    .map(|args| guard(&args))
                    .unwrap_or(false)
            })),
            Box::new(move |state, ctx, msg| {
                let args = T::from_values(&msg.values()[1..])?;
                handler(state, ctx, args)
            }),
        )
    }

    /// Handle messages accepted by a hand-built pattern
    pub fn on_pattern<F>(self, pattern: Pattern, handler: F) -> Self
    where
        F: FnMut(&mut S, &mut Context<'_, S>, &Message) -> HandlerResult + Send + 'static,
    {
        self.push(pattern, None, Box::new(handler))
    }

    /// Catch-all entry, tried after every other entry
    pub fn others<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut S, &mut Context<'_, S>, &Message) -> HandlerResult + Send + 'static,
    {
        self.fallback = Some(Box::new(handler));
        self
    }

    /// Run `handler` when no message is handled for `duration`
    pub fn after<F>(mut self, duration: Duration, handler: F) -> Self
    where
        F: FnMut(&mut S, &mut Context<'_, S>) -> Result<(), ActorError> + Send + 'static,
    {
        self.timeout = Some(ReceiveTimeout {
            duration,
            action: TimeoutAction::Handler(Box::new(handler)),
        });
        self
    }

    /// Terminate with `ExitReason::ReceiveTimeout` when no message is
    /// handled for `duration`
    pub fn timeout_exit(mut self, duration: Duration) -> Self {
        self.timeout = Some(ReceiveTimeout {
            duration,
            action: TimeoutAction::Exit,
        });
        self
    }

    fn push(mut self, pattern: Pattern, guard: Option<Guard>, handler: Handler<S>) -> Self {
        self.entries.push(Entry {
            pattern,
            guard,
            handler,
        });
        self
    }
}

impl<S> Behavior<S> {
    /// No entries, no fallback and no timeout
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.fallback.is_none() && self.timeout.is_none()
    }

    /// Number of entries including the fallback
    pub fn len(&self) -> usize {
        self.entries.len() + usize::from(self.fallback.is_some())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.as_ref().map(|t| t.duration)
    }

    /// Dispatch `message` to the first accepting entry
    ///
    /// Guard panics count as a non-match. Handler panics become
    /// `HandlerException` errors.
    pub fn apply(&mut self, state: &mut S, ctx: &mut Context<'_, S>, message: &Message) -> MatchOutcome {
        let actor = ctx.id();
        let values = message.values();

        let mut selected = None;
        for (index, entry) in self.entries.iter().enumerate() {
            if !entry.pattern.matches(values) {
                continue;
            }
            if let Some(guard) = &entry.guard {
                match panic::catch_unwind(AssertUnwindSafe(|| guard(message))) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(payload) => {
                        let error = ActorError::MatchGuardFailure {
                            entry: index,
                            message: panic_message(payload.as_ref()),
                        };
                        warn!(actor_id = %actor, error = %error, "Guard panicked, treating as no match");
                        ctx.system().metrics().record_guard_failure();
                        continue;
                    }
                }
            }
            selected = Some(index);
            break;
        }

        let handler = match selected {
            Some(index) => &mut self.entries[index].handler,
            None => match self.fallback.as_mut() {
                Some(fallback) => fallback,
                None => return MatchOutcome::Skipped,
            },
        };

        let result = match panic::catch_unwind(AssertUnwindSafe(|| handler(state, ctx, message))) {
            Ok(result) => result,
            Err(payload) => Err(ActorError::handler(actor, panic_message(payload.as_ref()))),
        };
        match result {
            Ok(Reply::Skip) => MatchOutcome::Skipped,
            other => MatchOutcome::Handled(other),
        }
    }

    /// Run the receive timeout action
    pub(crate) fn handle_timeout(&mut self, state: &mut S, ctx: &mut Context<'_, S>) -> TimeoutOutcome {
        let actor = ctx.id();
        match self.timeout.as_mut().map(|t| &mut t.action) {
            None => TimeoutOutcome::Unset,
            Some(TimeoutAction::Exit) => TimeoutOutcome::Exit(ExitReason::ReceiveTimeout),
            Some(TimeoutAction::Handler(handler)) => {
                match panic::catch_unwind(AssertUnwindSafe(|| handler(state, ctx))) {
                    Ok(result) => TimeoutOutcome::Handled(result),
                    Err(payload) => TimeoutOutcome::Handled(Err(ActorError::handler(
                        actor,
                        panic_message(payload.as_ref()),
                    ))),
                }
            }
        }
    }
}

impl<S> fmt::Debug for Behavior<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Behavior")
            .field("entries", &self.entries.len())
            .field("fallback", &self.fallback.is_some())
            .field("timeout", &self.timeout())
            .finish()
    }
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorKind, ActorRef};
    use crate::atom::atoms;
    use crate::context::Effects;
    use crate::system::ActorSystem;

    struct Harness {
        system: ActorSystem,
        actor: ActorRef,
    }

    impl Harness {
        fn new() -> Self {
            let system = ActorSystem::with_defaults().unwrap();
            let actor = ActorRef::new(ActorKind::Blocking, system.clone(), true);
            Self { system, actor }
        }

        fn apply<S>(&self, behavior: &mut Behavior<S>, state: &mut S, msg: &Message) -> MatchOutcome {
            let mut effects = Effects::default();
            let mut ctx = Context::new(&self.actor, Some(msg), &mut effects);
            behavior.apply(state, &mut ctx, msg)
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.system.shutdown();
        }
    }

    fn handled_values(outcome: MatchOutcome) -> Vec<Value> {
        match outcome {
            MatchOutcome::Handled(Ok(Reply::Values(values))) => values,
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_pattern_matching() {
        let pattern = Pattern::new(vec![
            Matcher::Exact(Value::Atom(atoms::PUT)),
            Matcher::Type(ValueType::Str),
            Matcher::Any,
        ]);
        assert!(pattern.matches(&[Value::Atom(atoms::PUT), Value::from("k"), Value::I64(1)]));
        assert!(!pattern.matches(&[Value::Atom(atoms::GET), Value::from("k"), Value::I64(1)]));
        assert!(!pattern.matches(&[Value::Atom(atoms::PUT), Value::from("k")]));

        let open = Pattern::new(vec![Matcher::Exact(Value::Atom(atoms::PUT))]).with_rest();
        assert!(open.matches(&[Value::Atom(atoms::PUT), Value::I64(1), Value::I64(2)]));
        assert!(!open.matches(&[]));
    }

    #[test]
    fn test_first_match_wins() {
        let harness = Harness::new();
        let mut behavior = Behavior::new()
            .on(|_: &mut (), _ctx, (n,): (i64,)| Reply::value(n * 10))
            .on(|_: &mut (), _ctx, (n,): (i64,)| Reply::value(n * 100));

        for _ in 0..3 {
            let outcome = harness.apply(&mut behavior, &mut (), &Message::new((2i64,)));
            assert_eq!(handled_values(outcome), vec![Value::I64(20)]);
        }
    }

    #[test]
    fn test_typed_tag_entries_and_skip() {
        let harness = Harness::new();
        let mut behavior = Behavior::new()
            .on_atom(atoms::ADD, |total: &mut i64, _ctx, (n,): (i64,)| {
                *total += n;
                Reply::value(*total)
            })
            .on_atom(atoms::GET, |total: &mut i64, _ctx, ()| Reply::value(*total));
        let mut total = 0i64;

        harness.apply(&mut behavior, &mut total, &Message::new((atoms::ADD, 5i64)));
        let outcome = harness.apply(&mut behavior, &mut total, &Message::new((atoms::GET,)));
        assert_eq!(handled_values(outcome), vec![Value::I64(5)]);

        // Wrong element type under a known tag is not a match
        let outcome = harness.apply(&mut behavior, &mut total, &Message::new((atoms::ADD, "5")));
        assert!(matches!(outcome, MatchOutcome::Skipped));
    }

    #[test]
    fn test_others_is_tried_last() {
        let harness = Harness::new();
        let mut behavior = Behavior::new()
            .others(|_: &mut (), _ctx, _msg| Reply::value("fallback"))
            .on(|_: &mut (), _ctx, (_,): (i64,)| Reply::value("typed"));

        let outcome = harness.apply(&mut behavior, &mut (), &Message::new((1i64,)));
        assert_eq!(handled_values(outcome), vec![Value::from("typed")]);
        let outcome = harness.apply(&mut behavior, &mut (), &Message::new(("x",)));
        assert_eq!(handled_values(outcome), vec![Value::from("fallback")]);
    }

    #[test]
    fn test_guards_select_entries() {
        let harness = Harness::new();
        let mut behavior = Behavior::new()
            .on_if(|(n,): &(i64,)| *n < 0, |_: &mut (), _ctx, _: (i64,)| Reply::value("negative"))
            .on(|_: &mut (), _ctx, _: (i64,)| Reply::value("other"));

        let outcome = harness.apply(&mut behavior, &mut (), &Message::new((-1i64,)));
        assert_eq!(handled_values(outcome), vec![Value::from("negative")]);
        let outcome = harness.apply(&mut behavior, &mut (), &Message::new((1i64,)));
        assert_eq!(handled_values(outcome), vec![Value::from("other")]);
    }

    #[test]
    fn test_panicking_guard_is_a_non_match() {
        let harness = Harness::new();
        let mut behavior = Behavior::new()
            .on_if(
                |_: &(i64,)| -> bool { panic!("bad guard") },
                |_: &mut (), _ctx, _: (i64,)| Reply::value("guarded"),
            )
            .on(|_: &mut (), _ctx, _: (i64,)| Reply::value("next"));

        let outcome = harness.apply(&mut behavior, &mut (), &Message::new((1i64,)));
        assert_eq!(handled_values(outcome), vec![Value::from("next")]);
        assert_eq!(harness.system.metrics().snapshot().guard_failures, 1);
    }

    #[test]
    fn test_handler_panic_becomes_exception() {
        let harness = Harness::new();
        let mut behavior = Behavior::new().on(|_: &mut (), _ctx, _: (i64,)| -> HandlerResult {
            panic!("handler blew up")
        });

        match harness.apply(&mut behavior, &mut (), &Message::new((1i64,))) {
            MatchOutcome::Handled(Err(ActorError::HandlerException { message, .. })) => {
                assert_eq!(message, "handler blew up");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_explicit_skip_counts_as_unmatched() {
        let harness = Harness::new();
        let mut behavior = Behavior::new().on(|_: &mut (), _ctx, _: (i64,)| Reply::skip());
        let outcome = harness.apply(&mut behavior, &mut (), &Message::new((1i64,)));
        assert!(matches!(outcome, MatchOutcome::Skipped));
    }

    #[test]
    fn test_empty_behavior() {
        let behavior: Behavior<()> = Behavior::new();
        assert!(behavior.is_empty());
        let timed = Behavior::<()>::new().timeout_exit(Duration::from_millis(5));
        assert!(!timed.is_empty());
        assert_eq!(timed.timeout(), Some(Duration::from_millis(5)));
    }
}
