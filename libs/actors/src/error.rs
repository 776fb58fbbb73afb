//! Actor Runtime Error Types
//!
//! Error taxonomy for the dispatch core. Most variants are recovered locally
//! (guard failures, closed mailboxes, timeouts, unreachable targets); only
//! `HandlerException` escalates and terminates the actor.

use crate::registry::ActorId;
use crate::message::RequestId;
use crate::value::ValueType;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Main runtime error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActorError {
    /// A behavior guard panicked; treated as a non-match
    #[error("Match guard failure in entry {entry}: {message}")]
    MatchGuardFailure { entry: usize, message: String },

    /// A handler returned an error or panicked; terminates the actor
    #[error("Handler exception in {actor}: {message}")]
    HandlerException { actor: ActorId, message: String },

    /// Enqueue on a closed mailbox; the message went to dead letters
    #[error("Mailbox of {actor} is closed")]
    MailboxClosed { actor: ActorId },

    /// No response arrived before the request deadline
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout { request_id: RequestId, timeout_ms: u64 },

    /// The request target terminated or never existed
    #[error("Target {target} is unreachable")]
    TargetUnreachable { target: ActorId },

    /// The requester terminated or the system shut down before resolution
    #[error("Request {request_id} was cancelled")]
    RequestCancelled { request_id: RequestId },

    /// A bounded receive elapsed without a matching message
    #[error("Receive timed out after {timeout_ms}ms")]
    ReceiveTimeout { timeout_ms: u64 },

    /// A blocking actor was told to exit while receiving
    #[error("Actor {actor} terminated: {reason}")]
    Terminated { actor: ActorId, reason: ExitReason },

    /// A message element did not have the expected type
    #[error("Type mismatch at index {index}: expected {expected}, found {found}")]
    TypeMismatch {
        index: usize,
        expected: ValueType,
        found: ValueType,
    },

    /// A message had the wrong number of elements
    #[error("Arity mismatch: expected {expected} values, found {found}")]
    Arity { expected: usize, found: usize },

    /// Atom text was too long or contained unsupported characters
    #[error("Invalid atom '{text}': {reason}")]
    InvalidAtom { text: String, reason: String },

    /// Actor state could not be encoded or decoded
    #[error("Snapshot error: {message}")]
    Snapshot { message: String },

    /// Invalid runtime configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The actor system is shutting down
    #[error("Actor system is shutting down")]
    SystemShutdown,
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, ActorError>;

impl ActorError {
    /// Create a handler exception
    pub fn handler(actor: ActorId, message: impl Into<String>) -> Self {
        Self::HandlerException {
            actor,
            message: message.into(),
        }
    }

    /// Create a snapshot error
    pub fn snapshot(message: impl Into<String>) -> Self {
        Self::Snapshot {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Error category for structured logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::MatchGuardFailure { .. } => "guard",
            Self::HandlerException { .. } => "handler",
            Self::MailboxClosed { .. } => "mailbox",
            Self::RequestTimeout { .. } | Self::RequestCancelled { .. } => "request",
            Self::TargetUnreachable { .. } => "unreachable",
            Self::ReceiveTimeout { .. } => "receive",
            Self::Terminated { .. } => "terminated",
            Self::TypeMismatch { .. } | Self::Arity { .. } | Self::InvalidAtom { .. } => "message",
            Self::Snapshot { .. } => "snapshot",
            Self::Configuration { .. } => "configuration",
            Self::SystemShutdown => "shutdown",
        }
    }

    /// Whether the runtime recovers from this error without terminating an actor
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::HandlerException { .. })
    }
}

/// Why an actor terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    /// Regular exit; not propagated through links
    Normal,
    /// Unconditional kill; cannot be trapped
    Kill,
    /// Stopped by system shutdown
    UserShutdown,
    /// A handler failed
    UnhandledException,
    /// A bounded receive elapsed
    ReceiveTimeout,
    /// Application defined reason
    User(u32),
}

impl ExitReason {
    pub fn is_normal(self) -> bool {
        self == ExitReason::Normal
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal => write!(f, "normal"),
            ExitReason::Kill => write!(f, "kill"),
            ExitReason::UserShutdown => write!(f, "user_shutdown"),
            ExitReason::UnhandledException => write!(f, "unhandled_exception"),
            ExitReason::ReceiveTimeout => write!(f, "receive_timeout"),
            ExitReason::User(code) => write!(f, "user({})", code),
        }
    }
}
