//! Redis-backed [`SharedStore`].
//!
//! Uses a `ConnectionManager`, which multiplexes every request over one
//! connection and transparently reconnects after a connection drop. Commands
//! are issued with millisecond TTL variants (`SET .. PX`, `PEXPIRE`) so windows
//! and record lifetimes are not rounded to whole seconds.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use tracing::{debug, info, instrument};

use super::{SharedStore, StoreError, StoreResult};

/// Deletes KEYS[1] only while it still holds ARGV[1].
const RELEASE_IF_OWNER: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// INCR KEYS[1], then PEXPIRE it by ARGV[1] ms if it has no TTL.
const INCREMENT_IN_WINDOW: &str = r#"
local count = redis.call("INCR", KEYS[1])
if redis.call("PTTL", KEYS[1]) == -1 then
    redis.call("PEXPIRE", KEYS[1], ARGV[1])
end
return count
"#;

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// `host:port` of the Redis server
    pub host: String,
    /// Logical database index
    pub db: i64,
    /// Optional password (AUTH)
    pub password: Option<String>,
    /// Upper bound for the initial connect and PING
    pub connect_timeout: Duration,
}

impl RedisConfig {
    /// Render the connection URL understood by the `redis` crate.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}/{}", password, self.host, self.db),
            None => format!("redis://{}/{}", self.host, self.db),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "redis:6379".to_string(),
            db: 0,
            password: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Production store over Redis.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    release: Script,
    window: Script,
}

impl RedisStore {
    /// Connect and verify the server answers a PING within the connect timeout.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the URL is invalid or the server
    /// cannot be reached, and `StoreError::Timeout` if it does not answer in time.
    #[instrument(skip(config), fields(host = %config.host, db = config.db))]
    pub async fn connect(config: &RedisConfig) -> StoreResult<Self> {
        let client = Client::open(config.url()).map_err(unavailable)?;

        let conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(config.connect_timeout))?
            .map_err(unavailable)?;

        let store = Self {
            conn,
            release: Script::new(RELEASE_IF_OWNER),
            window: Script::new(INCREMENT_IN_WINDOW),
        };

        tokio::time::timeout(config.connect_timeout, store.ping())
            .await
            .map_err(|_| StoreError::Timeout(config.connect_timeout))??;

        info!("Connected to Redis");
        Ok(store)
    }
}

fn unavailable(e: RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        debug!(key, acquired = reply.is_some(), "SET NX");
        Ok(reply.is_some())
    }

    async fn delete_if_equal(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(deleted > 0)
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(applied == 1)
    }

    async fn increment_in_window(&self, key: &str, window: Duration) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let count: i64 = self
            .window
            .key(key)
            .arg(millis(window))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(count)
    }

    async fn list_push_front(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _len: i64 = redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("LTRIM")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let items: Vec<Vec<u8>> = redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(items)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
