use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use trawl_core::error::AppError;
use trawl_core::store::SharedStore;

use crate::config::RedisConfig;

fn store_err(e: redis::RedisError) -> AppError {
    AppError::Store(e.to_string())
}

/// BLPOP timeout in seconds, or `None` for a non-blocking sweep.
///
/// BLPOP treats 0 as "wait forever" and some servers truncate fractions
/// below a millisecond to 0, so anything shorter than 1ms never blocks.
fn blocking_timeout(timeout: Duration) -> Option<f64> {
    (timeout >= Duration::from_millis(1)).then(|| timeout.as_secs_f64())
}

/// [`SharedStore`] backed by a Redis server.
///
/// Ordinary commands share one multiplexed connection. Blocking pops hold
/// a connection of their own for the whole wait, taken from a small pool
/// of idle ones, so they never stall other commands.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    blocking: Arc<Mutex<Vec<MultiplexedConnection>>>,
}

impl RedisStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self, AppError> {
        Self::open(&config.url).await
    }

    pub async fn open(url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(url)
            .map_err(|e| AppError::Config(format!("Invalid REDIS_URL: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::Store(format!("Failed to connect: {e}")))?;
        tracing::debug!("Connected to Redis");

        Ok(Self {
            client,
            conn,
            blocking: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Round-trip a PING.
    pub async fn ping(&self) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, AppError> {
        let idle = self
            .blocking
            .lock()
            .map_err(|_| AppError::Store("blocking connection pool poisoned".into()))?
            .pop();
        match idle {
            Some(conn) => Ok(conn),
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(store_err),
        }
    }

    fn checkin_blocking(&self, conn: MultiplexedConnection) {
        if let Ok(mut idle) = self.blocking.lock() {
            idle.push(conn);
        }
    }
}

impl SharedStore for RedisStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value)
            .await
            .map_err(store_err)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.conn.clone();
        conn.hget(key, field).await.map_err(store_err)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, AppError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.hdel(key, field).await.map_err(store_err)?;
        Ok(removed > 0)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, AppError> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(key).await.map_err(store_err)?;
        Ok(map.into_iter().collect())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(key, value).await.map_err(store_err)
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<u64, AppError> {
        let mut conn = self.conn.clone();
        // A count of 0 removes every occurrence.
        conn.lrem(key, 0, value).await.map_err(store_err)
    }

    async fn llen(&self, key: &str) -> Result<u64, AppError> {
        let mut conn = self.conn.clone();
        conn.llen(key).await.map_err(store_err)
    }

    async fn blpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, AppError> {
        if keys.is_empty() {
            return Ok(None);
        }

        let Some(wait_secs) = blocking_timeout(timeout) else {
            let mut conn = self.conn.clone();
            for key in keys {
                let popped: Option<String> = conn.lpop(key, None).await.map_err(store_err)?;
                if let Some(value) = popped {
                    return Ok(Some((key.clone(), value)));
                }
            }
            return Ok(None);
        };

        let mut conn = self.checkout_blocking().await?;
        let popped = conn
            .blpop::<_, Option<(String, String)>>(keys, wait_secs)
            .await
            .map_err(store_err)?;
        self.checkin_blocking(conn);
        Ok(popped)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, member).await.map_err(store_err)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, AppError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.srem(key, member).await.map_err(store_err)?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, AppError> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(store_err)
    }
}
