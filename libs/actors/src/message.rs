//! Actor Messages
//!
//! A message is an immutable, reference-counted tuple of [`Value`]s plus a
//! header (sender, correlation, priority). Cloning a message only bumps a
//! reference count, so the same payload can sit in several mailboxes (e.g. a
//! broadcast) or in the dead letter log at once.

use crate::error::{ActorError, ExitReason, Result};
use crate::registry::ActorId;
use crate::value::{FromValue, Value, ValueType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Correlation token of a synchronous request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Request/response tagging of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Correlation {
    #[default]
    None,
    /// The sender awaits a response tagged with this id
    Request(RequestId),
    /// Answer to the request with this id
    Response(RequestId),
}

/// Delivery class of a user message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    #[default]
    Normal,
    /// Overtakes all normal messages in the receiving mailbox
    High,
}

/// Message metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub sender: Option<ActorId>,
    pub correlation: Correlation,
    pub priority: Priority,
}

/// Runtime control messages; they never reach user behaviors directly
#[derive(Debug, Clone, PartialEq)]
pub enum SystemSignal {
    /// Exit request or link propagation. `ExitReason::Kill` always terminates.
    Exit {
        from: Option<ActorId>,
        reason: ExitReason,
    },
    /// Behavior timeout tick; stale generations are ignored
    ReceiveTimeout { generation: u64 },
    /// A request issued by this actor failed before a response arrived
    RequestFailed {
        request_id: RequestId,
        error: ActorError,
    },
}

#[derive(Debug, PartialEq)]
enum Payload {
    Values(Vec<Value>),
    Signal(SystemSignal),
}

#[derive(Debug, PartialEq)]
struct MessageData {
    header: Header,
    payload: Payload,
}

/// Immutable shared message
#[derive(Clone, PartialEq)]
pub struct Message(Arc<MessageData>);

impl Message {
    /// Create an anonymous normal-priority message
    pub fn new(values: impl IntoValues) -> Self {
        Self::with_header(Header::default(), values.into_values())
    }

    pub fn with_header(header: Header, values: Vec<Value>) -> Self {
        Self(Arc::new(MessageData {
            header,
            payload: Payload::Values(values),
        }))
    }

    /// Create a system signal message
    pub fn signal(signal: SystemSignal) -> Self {
        Self(Arc::new(MessageData {
            header: Header::default(),
            payload: Payload::Signal(signal),
        }))
    }

    /// Create the exit signal used by kill/link propagation
    pub fn exit(from: Option<ActorId>, reason: ExitReason) -> Self {
        Self::signal(SystemSignal::Exit { from, reason })
    }

    /// Copy of this message with a different header
    pub fn rebuild(&self, header: Header) -> Self {
        let payload = match &self.0.payload {
            Payload::Values(values) => Payload::Values(values.clone()),
            Payload::Signal(signal) => Payload::Signal(signal.clone()),
        };
        Self(Arc::new(MessageData { header, payload }))
    }

    pub fn with_sender(&self, sender: Option<ActorId>) -> Self {
        self.rebuild(Header {
            sender,
            ..self.0.header
        })
    }

    pub fn with_priority(&self, priority: Priority) -> Self {
        self.rebuild(Header {
            priority,
            ..self.0.header
        })
    }

    pub fn with_correlation(&self, correlation: Correlation) -> Self {
        self.rebuild(Header {
            correlation,
            ..self.0.header
        })
    }

    pub fn header(&self) -> &Header {
        &self.0.header
    }

    pub fn sender(&self) -> Option<ActorId> {
        self.0.header.sender
    }

    pub fn priority(&self) -> Priority {
        self.0.header.priority
    }

    pub fn correlation(&self) -> Correlation {
        self.0.header.correlation
    }

    /// Request id if this message awaits a response
    pub fn request_id(&self) -> Option<RequestId> {
        match self.0.header.correlation {
            Correlation::Request(id) => Some(id),
            _ => None,
        }
    }

    /// Request id if this message is a response
    pub fn response_id(&self) -> Option<RequestId> {
        match self.0.header.correlation {
            Correlation::Response(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_signal(&self) -> bool {
        matches!(self.0.payload, Payload::Signal(_))
    }

    pub fn as_signal(&self) -> Option<&SystemSignal> {
        match &self.0.payload {
            Payload::Signal(signal) => Some(signal),
            Payload::Values(_) => None,
        }
    }

    /// Message elements; empty for signals
    pub fn values(&self) -> &[Value] {
        match &self.0.payload {
            Payload::Values(values) => values,
            Payload::Signal(_) => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values().get(index)
    }

    /// Typed access to a single element
    pub fn get_as<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self.get(index).ok_or(ActorError::Arity {
            expected: index + 1,
            found: self.len(),
        })?;
        T::from_value(value).ok_or_else(|| ActorError::TypeMismatch {
            index,
            expected: T::value_type().unwrap_or(ValueType::Unit),
            found: value.value_type(),
        })
    }

    /// Unpack all elements into a typed tuple
    pub fn unpack<T: FromMessage>(&self) -> Result<T> {
        T::from_values(self.values())
    }

    /// Number of strong references to the payload
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Whether two handles share the same payload allocation
    pub fn ptr_eq(&self, other: &Message) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Message");
        dbg.field("sender", &self.0.header.sender)
            .field("correlation", &self.0.header.correlation)
            .field("priority", &self.0.header.priority);
        match &self.0.payload {
            Payload::Values(values) => dbg.field("values", values),
            Payload::Signal(signal) => dbg.field("signal", signal),
        };
        dbg.finish()
    }
}

/// Conversion into message elements
pub trait IntoValues {
    fn into_values(self) -> Vec<Value>;
}

impl IntoValues for Vec<Value> {
    fn into_values(self) -> Vec<Value> {
        self
    }
}

impl IntoValues for () {
    fn into_values(self) -> Vec<Value> {
        Vec::new()
    }
}

/// Typed unpacking of a whole message
pub trait FromMessage: Sized {
    /// Element tags in order; `None` entries match any value
    fn signature() -> Vec<Option<ValueType>>;

    fn from_values(values: &[Value]) -> Result<Self>;
}

impl FromMessage for () {
    fn signature() -> Vec<Option<ValueType>> {
        Vec::new()
    }

    fn from_values(values: &[Value]) -> Result<Self> {
        if values.is_empty() {
            Ok(())
        } else {
            Err(ActorError::Arity {
                expected: 0,
                found: values.len(),
            })
        }
    }
}

fn extract<T: FromValue>(values: &[Value], index: usize) -> Result<T> {
    let value = &values[index];
    T::from_value(value).ok_or_else(|| ActorError::TypeMismatch {
        index,
        expected: T::value_type().unwrap_or(ValueType::Unit),
        found: value.value_type(),
    })
}

macro_rules! impl_tuples {
    ($len:expr; $($name:ident : $idx:tt),+) => {
        impl<$($name: Into<Value>),+> IntoValues for ($($name,)+) {
            fn into_values(self) -> Vec<Value> {
                vec![$(self.$idx.into()),+]
            }
        }

        impl<$($name: FromValue),+> FromMessage for ($($name,)+) {
            fn signature() -> Vec<Option<ValueType>> {
                vec![$($name::value_type()),+]
            }

            fn from_values(values: &[Value]) -> Result<Self> {
                if values.len() != $len {
                    return Err(ActorError::Arity {
                        expected: $len,
                        found: values.len(),
                    });
                }
                Ok(($(extract::<$name>(values, $idx)?,)+))
            }
        }
    };
}

impl_tuples!(1; A: 0);
impl_tuples!(2; A: 0, B: 1);
impl_tuples!(3; A: 0, B: 1, C: 2);
impl_tuples!(4; A: 0, B: 1, C: 2, D: 3);
impl_tuples!(5; A: 0, B: 1, C: 2, D: 3, E: 4);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{atom, atoms};

    #[test]
    fn test_tuple_packing_and_unpacking() {
        let msg = Message::new((atoms::PUT, 42i64, "key"));
        assert_eq!(msg.len(), 3);
        let (tag, value, key): (crate::atom::Atom, i64, String) = msg.unpack().unwrap();
        assert_eq!(tag, atoms::PUT);
        assert_eq!(value, 42);
        assert_eq!(key, "key");
    }

    #[test]
    fn test_unpack_reports_mismatch() {
        let msg = Message::new((atom("x"), 1i64));
        let err = msg.unpack::<(crate::atom::Atom, String)>().unwrap_err();
        assert_eq!(
            err,
            ActorError::TypeMismatch {
                index: 1,
                expected: ValueType::Str,
                found: ValueType::I64
            }
        );
        assert!(matches!(
            msg.unpack::<(crate::atom::Atom,)>(),
            Err(ActorError::Arity { expected: 1, found: 2 })
        ));
    }

    #[test]
    fn test_messages_share_payload() {
        let msg = Message::new((1i64,));
        let copy = msg.clone();
        assert!(msg.ptr_eq(&copy));
        assert_eq!(msg.ref_count(), 2);

        // Header changes build a new message and leave the original untouched
        let urgent = msg.with_priority(Priority::High);
        assert!(!urgent.ptr_eq(&msg));
        assert_eq!(msg.priority(), Priority::Normal);
        assert_eq!(urgent.priority(), Priority::High);
        assert_eq!(urgent.values(), msg.values());
    }

    #[test]
    fn test_signals_have_no_values() {
        let msg = Message::exit(None, ExitReason::Kill);
        assert!(msg.is_signal());
        assert!(msg.values().is_empty());
        assert_eq!(
            msg.as_signal(),
            Some(&SystemSignal::Exit {
                from: None,
                reason: ExitReason::Kill
            })
        );
    }

    #[test]
    fn test_correlation_accessors() {
        let id = RequestId::from_raw(9);
        let request = Message::new(()).with_correlation(Correlation::Request(id));
        assert_eq!(request.request_id(), Some(id));
        assert_eq!(request.response_id(), None);
        let response = request.with_correlation(Correlation::Response(id));
        assert_eq!(response.response_id(), Some(id));
    }
}
