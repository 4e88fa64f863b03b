//! Redis-backed cache.
//!
//! Uses one multiplexed async connection shared by every clone. Values are
//! stored as plain strings (`SET key value PX ttl`), so entries written here
//! are readable by any other service sharing the same key layout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::{info, instrument};

use super::{CacheError, CacheStore};

#[derive(Clone)]
pub struct RedisCache {
    client: Arc<redis::Client>,
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache").finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379`).
    #[instrument(skip(redis_url), err)]
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        info!("redis cache connected");
        Ok(Self {
            client: Arc::new(client),
            conn,
        })
    }

    /// Round-trip a `PING`.
    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    pub fn client(&self) -> &redis::Client {
        &self.client
    }
}

/// `PX 0` is rejected by Redis, so sub-millisecond TTLs round up to 1ms.
fn px_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn set_command(key: &str, value: String, ttl: Option<Duration>) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);
    if let Some(ttl) = ttl {
        cmd.arg("PX").arg(px_millis(ttl));
    }
    cmd
}

fn map_redis_error(e: redis::RedisError) -> CacheError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        CacheError::Connection(e.to_string())
    } else {
        CacheError::Command(e.to_string())
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = set_command(key, value, ttl)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_clamped_to_one_millisecond() {
        assert_eq!(px_millis(Duration::ZERO), 1);
        assert_eq!(px_millis(Duration::from_micros(300)), 1);
        assert_eq!(px_millis(Duration::from_secs(300)), 300_000);
    }

    #[test]
    fn set_carries_px_only_with_ttl() {
        let with_ttl = set_command("k", "v".into(), Some(Duration::ZERO)).get_packed_command();
        assert_eq!(
            with_ttl,
            b"*5\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n$2\r\nPX\r\n$1\r\n1\r\n".to_vec()
        );

        let forever = set_command("k", "v".into(), None).get_packed_command();
        assert_eq!(forever, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n".to_vec());
    }

    #[test]
    fn transport_failures_map_to_connection_errors() {
        let refused = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(map_redis_error(refused), CacheError::Connection(_)));

        let wrong_type = redis::RedisError::from((redis::ErrorKind::TypeError, "not a string"));
        assert!(matches!(map_redis_error(wrong_type), CacheError::Command(_)));
    }
}
