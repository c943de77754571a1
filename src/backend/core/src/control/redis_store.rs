//! Redis-backed control store.

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::info;

use super::ControlStore;
use crate::config::RedisConfig;
use crate::error::{ErrorCode, QueueError, Result};

/// `SET` guarded by the current value, atomic on the server.
const REPLACE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

/// Control store on a Redis server, keys namespaced by `key_prefix`.
pub struct RedisControlStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisControlStore {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            QueueError::with_internal(
                ErrorCode::ControlStoreConnectionFailed,
                "Failed to create Redis client",
                e.to_string(),
            )
        })?;

        let store = Self {
            client,
            key_prefix: config.key_prefix.clone(),
        };

        let mut conn = store.get_conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(|e| {
            QueueError::with_internal(
                ErrorCode::ControlStoreConnectionFailed,
                "Redis ping failed",
                e.to_string(),
            )
        })?;

        info!(url = %config.url, "Redis control store connected");
        Ok(store)
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client.get_multiplexed_async_connection().await.map_err(|e| {
            QueueError::with_internal(
                ErrorCode::ControlStoreConnectionFailed,
                "Failed to get Redis connection",
                e.to_string(),
            )
        })
    }

    fn full_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }
}

#[async_trait]
impl ControlStore for RedisControlStore {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.get_conn().await?;
        let value: Option<String> = conn.get(self.full_key(key)).await?;
        Ok(value)
    }

    async fn write(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        conn.set::<_, _, ()>(self.full_key(key), value).await?;
        Ok(())
    }

    async fn replace(&self, key: &str, expected: &str, value: &str) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let replaced: i64 = redis::Script::new(REPLACE_SCRIPT)
            .key(self.full_key(key))
            .arg(expected)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(replaced == 1)
    }

    async fn has(&self, key: &str) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let exists: bool = conn.exists(self.full_key(key)).await?;
        Ok(exists)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let deleted: i64 = conn.del(self.full_key(key)).await?;
        Ok(deleted > 0)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

impl std::fmt::Debug for RedisControlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisControlStore").field("key_prefix", &self.key_prefix).finish()
    }
}
