//! Actor Registry
//!
//! Process-unique actor ids plus id and name lookup for live actors. Also
//! tracks how many counted actors are still running so that callers can wait
//! for the system to drain.

use crate::actor::ActorRef;
use crate::timer::deadline_after;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

static NEXT_ACTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Unique actor identifier
///
/// Allocated from a process-wide counter and never reused while the process
/// lives, so a stale id can only ever resolve to "not found".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(u64);

impl ActorId {
    /// Allocate the next id
    pub fn next() -> Self {
        Self(NEXT_ACTOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Rebuild an id received from an external layer
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor-{}", self.0)
    }
}

/// Registry of live actors
#[derive(Default)]
pub struct ActorRegistry {
    /// Live actors by id
    actors: DashMap<ActorId, ActorRef>,

    /// Named actors
    names: DashMap<String, ActorRef>,

    /// Running actors that count towards `await_all_done`
    running: Mutex<usize>,
    all_done: Condvar,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly spawned actor
    pub fn register_actor(&self, actor: ActorRef) {
        debug!(actor_id = %actor.id(), "Registering actor");
        if !actor.is_hidden() {
            *self.running.lock() += 1;
        }
        self.actors.insert(actor.id(), actor);
    }

    /// Remove a terminated actor and every name bound to it
    pub fn unregister_actor(&self, id: ActorId) -> Option<ActorRef> {
        let (_, actor) = match self.actors.remove(&id) {
            Some(entry) => entry,
            None => {
                warn!(actor_id = %id, "Attempted to unregister unknown actor");
                return None;
            }
        };
        self.names.retain(|_, named| named.id() != id);

        if !actor.is_hidden() {
            let mut running = self.running.lock();
            *running = running.saturating_sub(1);
            if *running == 0 {
                self.all_done.notify_all();
            }
        }
        debug!(actor_id = %id, "Unregistered actor");
        Some(actor)
    }

    /// Find a live actor by id
    pub fn find_actor(&self, id: ActorId) -> Option<ActorRef> {
        self.actors.get(&id).map(|entry| entry.value().clone())
    }

    /// Bind `name` to `actor`, returning the previous binding
    ///
    /// Binding a terminated actor is ignored.
    pub fn register_name(&self, name: impl Into<String>, actor: &ActorRef) -> Option<ActorRef> {
        let name = name.into();
        if actor.is_terminated() {
            warn!(actor_id = %actor.id(), name = %name, "Refusing to name a terminated actor");
            return None;
        }
        debug!(actor_id = %actor.id(), name = %name, "Registering actor name");
        self.names.insert(name, actor.clone())
    }

    pub fn unregister_name(&self, name: &str) -> Option<ActorRef> {
        self.names.remove(name).map(|(_, actor)| actor)
    }

    /// Find a named actor
    pub fn whereis(&self, name: &str) -> Option<ActorRef> {
        self.names.get(name).map(|entry| entry.value().clone())
    }

    /// Snapshot of all live actors
    pub fn list_actors(&self) -> Vec<ActorRef> {
        self.actors.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn total_actors(&self) -> usize {
        self.actors.len()
    }

    /// Number of running, non-hidden actors
    pub fn running_count(&self) -> usize {
        *self.running.lock()
    }

    /// Block until no counted actor is running or `timeout` elapses
    pub fn await_all_done(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        let mut running = self.running.lock();
        while *running > 0 {
            match deadline {
                Some(deadline) => {
                    if self.all_done.wait_until(&mut running, deadline).timed_out() {
                        return *running == 0;
                    }
                }
                None => self.all_done.wait(&mut running),
            }
        }
        true
    }
}

impl fmt::Debug for ActorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRegistry")
            .field("actors", &self.actors.len())
            .field("names", &self.names.len())
            .field("running", &self.running_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let a = ActorId::next();
        let b = ActorId::next();
        assert!(b > a);
        assert_eq!(ActorId::from_raw(a.as_u64()), a);
        assert_eq!(ActorId::from_raw(42).to_string(), "actor-42");
    }

    #[test]
    fn test_await_all_done_with_nothing_running() {
        let registry = ActorRegistry::new();
        assert_eq!(registry.running_count(), 0);
        assert!(registry.await_all_done(Duration::from_millis(1)));
        assert!(registry.find_actor(ActorId::from_raw(u64::MAX)).is_none());
        assert!(registry.unregister_actor(ActorId::from_raw(u64::MAX)).is_none());
    }
}
