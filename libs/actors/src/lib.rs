//! Actor Runtime Core
//!
//! Mailboxes, behavior dispatch, request/response correlation and a
//! cooperative scheduler for in-process actors.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── ActorSystem ─────────────────────────────┐
//! │                                                                      │
//! │  ActorRef ──enqueue──► Mailbox ──► receive loop ──► Behavior         │
//! │     │                 (signals,    (intercept,      (first match     │
//! │     │                  high,        skip/hold,       wins)           │
//! │     │                  normal)      become)                          │
//! │     ▼                                                                │
//! │  Scheduler (worker pool)     Correlator (pending requests)           │
//! │  Timer (deadlines)           Registry   DeadLetters   SystemMetrics  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Event-based actors run on the worker pool and give up their worker after
//! a quantum of messages. Blocking actors (`ScopedActor`) own a thread and
//! block in `receive`.
//!
//! # Example
//!
//! ```rust,no_run
//! use actor_core::{atoms, ActorSystem, Behavior, Reply};
//! use std::time::Duration;
//!
//! let system = ActorSystem::with_defaults().expect("valid default config");
//! let pong = system.spawn(|_ctx| {
//!     Behavior::new().on_atom(atoms::PING, |_, _, ()| Reply::value(atoms::PONG))
//! });
//!
//! let response = system
//!     .request(&pong, (atoms::PING,), Duration::from_millis(100))
//!     .wait()
//!     .expect("pong");
//! assert_eq!(response.get_as::<actor_core::Atom>(0).unwrap(), atoms::PONG);
//! system.shutdown();
//! ```

pub mod actor;
pub mod atom;
pub mod behavior;
pub mod blocking;
mod cell;
pub mod context;
pub mod correlator;
pub mod dead_letter;
pub mod error;
pub mod mailbox;
pub mod message;
pub mod registry;
pub mod scheduler;
pub mod snapshot;
pub mod system;
pub mod timer;
pub mod value;

pub use actor::{ActorKind, ActorRef, ActorState};
pub use atom::{atom, atoms, Atom};
pub use behavior::{Behavior, HandlerResult, MatchOutcome, Matcher, Pattern, Reply};
pub use blocking::ScopedActor;
pub use context::{Context, PendingRequest, ResponsePromise};
pub use correlator::ResponseFuture;
pub use dead_letter::{DeadLetter, DeadLetters};
pub use error::{ActorError, ExitReason, Result};
pub use mailbox::{DeadLetterSink, Mailbox};
pub use message::{Correlation, FromMessage, Header, IntoValues, Message, Priority, RequestId, SystemSignal};
pub use registry::{ActorId, ActorRegistry};
pub use snapshot::Snapshot;
pub use system::{ActorSystem, SystemMetrics, SystemStats};
pub use value::{FromValue, Value, ValueType};

pub use actor_config::RuntimeConfig;
