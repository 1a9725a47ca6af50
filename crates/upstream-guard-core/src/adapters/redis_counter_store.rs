//! # Redis Counter Store
//!
//! Counter store shared by every process instance through Redis.
//!
//! Increments run as a Lua script so that `INCR` and the "expire only when
//! created" rule apply atomically on the server.

use crate::counter_store::{CounterStore, CounterStoreError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{debug, info};

/// Increment and apply the window expiry when the key is new.
///
/// A key that somehow lost its expiry (PTTL -1) gets one again so a counter
/// can never outlive its window indefinitely.
const INCREMENT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 or redis.call('PTTL', KEYS[1]) == -1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return current
"#;

/// Counter store backed by a Redis server
///
/// Cheap to clone; clones share one multiplexed, auto-reconnecting
/// connection.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    increment_script: redis::Script,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore").finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1:6379/0`).
    ///
    /// # Errors
    ///
    /// Returns [`CounterStoreError::Unavailable`] if the URL is invalid or the
    /// initial connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self, CounterStoreError> {
        let client = redis::Client::open(url).map_err(|e| unavailable(&e))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| unavailable(&e))?;

        info!("Connected to Redis counter store");

        Ok(Self {
            connection,
            increment_script: redis::Script::new(INCREMENT_SCRIPT),
        })
    }
}

fn unavailable(e: &redis::RedisError) -> CounterStoreError {
    CounterStoreError::Unavailable {
        message: e.to_string(),
    }
}

fn map_command_error(key: &str, e: redis::RedisError) -> CounterStoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
        return unavailable(&e);
    }

    match e.kind() {
        redis::ErrorKind::TypeError | redis::ErrorKind::ResponseError => {
            CounterStoreError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }
        }
        _ => unavailable(&e),
    }
}

// Redis treats a zero PX as an error; round sub-millisecond TTLs up.
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CounterStoreError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_command_error(key, e))?;
        Ok(value)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), CounterStoreError> {
        let mut conn = self.connection.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_command_error(key, e))?;
        Ok(())
    }

    async fn increment(
        &self,
        key: &str,
        ttl_if_created: Duration,
    ) -> Result<u64, CounterStoreError> {
        let mut conn = self.connection.clone();
        let value: u64 = self
            .increment_script
            .key(key)
            .arg(ttl_millis(ttl_if_created))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_command_error(key, e))?;

        debug!(key, value, "Incremented counter");
        Ok(value)
    }
}

#[cfg(test)]
#[path = "redis_counter_store_tests.rs"]
mod tests;
