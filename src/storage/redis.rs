use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use crate::error::AppResult;

const CATALOG_PREFIX: &str = "catalog:";

#[derive(Clone)]
pub struct RedisClient {
    conn: MultiplexedConnection,
}

impl RedisClient {
    pub async fn new(url: &str) -> AppResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    // Catalog cache
    pub async fn get_cached<T: DeserializeOwned>(&self, name: &str) -> AppResult<Option<T>> {
        let mut conn = self.conn.clone();
        let key = format!("{}{}", CATALOG_PREFIX, name);
        let value: Option<String> = conn.get(&key).await?;

        match value {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(parsed) => Ok(Some(parsed)),
                Err(e) => {
                    tracing::warn!("Discarding unreadable cache entry {}: {}", key, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub async fn set_cached<T: Serialize>(
        &self,
        name: &str,
        value: &T,
        ttl: Duration,
    ) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let key = format!("{}{}", CATALOG_PREFIX, name);
        let raw = serde_json::to_string(value).map_err(anyhow::Error::from)?;
        let _: () = conn.set_ex(&key, raw, ttl.as_secs()).await?;
        Ok(())
    }

    /// Drops every cached catalog entry.
    pub async fn invalidate_catalog(&self) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", CATALOG_PREFIX);
        let keys: Vec<String> = conn.keys(&pattern).await?;
        if !keys.is_empty() {
            let _: () = conn.del(keys).await?;
        }
        Ok(())
    }
}
