//! Actor state snapshots
//!
//! Any serde type can be captured to bytes and restored, e.g. to respawn an
//! actor with [`ActorSystem::spawn_restored`](crate::ActorSystem::spawn_restored).

use crate::error::{ActorError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// State that can be captured and restored
pub trait Snapshot: Sized {
    fn snapshot(&self) -> Result<Vec<u8>>;
    fn restore(bytes: &[u8]) -> Result<Self>;
}

impl<T> Snapshot for T
where
    T: Serialize + DeserializeOwned,
{
    fn snapshot(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ActorError::snapshot(e.to_string()))
    }

    fn restore(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| ActorError::snapshot(e.to_string()))
    }
}
