//! Shared store abstraction used by the cross-process bus.
//!
//! A store provides pattern pub/sub plus a time-scored sorted set for history.
//! [`MemorySharedStore`] is always available; [`RedisStore`] requires the
//! `redis` feature.

mod trait_def;
mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use trait_def::{
    ConnectionEvent, ConnectionEventSender, ConnectionRole, SharedStore, StoreMessage,
    glob_matches,
};
pub use memory::MemorySharedStore;

#[cfg(feature = "redis")]
pub use redis::RedisStore;
