//! # Infrastructure Adapters
//!
//! Implementations of the [`CounterStore`](crate::counter_store::CounterStore)
//! interface.

pub mod memory_counter_store;

#[cfg(feature = "redis")]
pub mod redis_counter_store;

pub use memory_counter_store::InMemoryCounterStore;

#[cfg(feature = "redis")]
pub use redis_counter_store::RedisCounterStore;
