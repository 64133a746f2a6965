mod evictor;
mod queue;

use crate::identity::Identity;
use crate::store::StoreError;
use crate::strategy::Cookie;

use std::sync::Arc;

use thiserror::Error;

pub const DEFAULT_EVICTOR_CAPACITY: usize = 10;

#[derive(Error, Debug)]
pub enum ActivateError {
    #[error("no such servant")]
    NotFound,
    #[error("store")]
    Store(#[from] StoreError),
}

/// Application-side lifecycle down-calls, always invoked with the evictor's
/// structural lock released.
///
/// A store-backed activator loads state in `instantiate` and writes it back
/// in `persist` (through a [`crate::store::Gateway`]); an in-memory-only
/// activator keeps the default no-op `persist`.
pub trait Activator: Send + Sync {
    type Servant: Send + Sync;

    /// Construct or load the servant for `identity`.
    fn instantiate(&self, identity: &Identity) -> Result<Self::Servant, ActivateError>;

    /// Write the servant's current state back to the store. Called for
    /// dirty entries before they are removed from the cache.
    fn persist(&self, _identity: &Identity, _servant: &Self::Servant) -> Result<(), StoreError> {
        Ok(())
    }

    /// Release resources once the entry is finally evicted. Runs after any
    /// required save-back.
    fn retire(&self, _identity: &Identity, _servant: Arc<Self::Servant>, _cookie: &Cookie) {}
}

pub use evictor::{Evictor, EvictorError};
pub use queue::{EvictionQueue, SlotId};
