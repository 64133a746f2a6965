//! Servant eviction cache for persistent-object RPC dispatch.
//!
//! A bounded, in-memory working set of request-handler instances
//! ("servants") whose authoritative state lives in a transactional
//! key-value store. The dispatch layer borrows a servant with
//! [`cache::Evictor::locate`], invokes the operation with no cache lock
//! held, and returns it with [`cache::Evictor::finished`]; the evictor
//! decides which idle servants to drop and writes dirty state back through
//! a [`store::Gateway`] first.

pub mod cache;
pub mod config;
pub mod identity;
pub mod store;
pub mod strategy;
