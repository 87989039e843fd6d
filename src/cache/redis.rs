//! Redis-backed cache.
//!
//! Uses a connection manager so a single handle can be shared across request
//! tasks; reconnects are handled internally.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::cache::Cache;
use crate::error::CacheError;

/// Startup ping allowance, generous to let connections spin up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    /// Connect to `addr` (e.g. `redis://127.0.0.1:6379`) and verify the
    /// server answers a PING before returning.
    pub async fn connect(addr: &str) -> Result<Self, CacheError> {
        let client =
            redis::Client::open(addr).map_err(|e| CacheError::Backend(e.to_string()))?;
        let mut manager = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        let ping = async {
            let pong: String = redis::cmd("PING")
                .query_async(&mut manager)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?;
            Ok::<String, CacheError>(pong)
        };
        tokio::time::timeout(CONNECT_TIMEOUT, ping)
            .await
            .map_err(|_| CacheError::Backend(format!("timed out pinging redis at {}", addr)))??;

        Ok(Self { manager })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut manager = self.manager.clone();
        // a redis nil reply decodes to None, which is an ordinary miss
        let value: Option<Vec<u8>> = manager
            .get(key)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut manager = self.manager.clone();
        match ttl {
            Some(ttl) if !ttl.is_zero() => {
                let () = manager
                    .set_ex(key, value, ttl.as_secs().max(1))
                    .await
                    .map_err(|e| CacheError::Backend(e.to_string()))?;
            }
            _ => {
                let () = manager
                    .set(key, value)
                    .await
                    .map_err(|e| CacheError::Backend(e.to_string()))?;
            }
        }
        Ok(())
    }
}
