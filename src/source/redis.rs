use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use deadpool::managed::PoolConfig;
use deadpool_redis::{Config as RedisPoolConfig, Connection, Pool, PoolError, Runtime};
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::errors::{LimiterError, Result};
use crate::metrics;
use crate::source::{Source, SourceError};

/// Connection settings for the sharded Redis deployment, loaded from
/// environment variables.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// One URL per shard (e.g., "redis://ratelimits-1:6379").
    pub shard_urls: Vec<String>,

    /// Maximum number of pooled connections per shard.
    pub max_connections: usize,

    /// Upper bound on any single command, pool checkout included.
    pub command_timeout: Duration,
}

impl RedisConfig {
    pub fn from_env() -> Self {
        Self {
            shard_urls: std::env::var("REDIS_SHARD_URLS")
                .map(|urls| parse_shard_urls(&urls))
                .unwrap_or_else(|_| vec!["redis://localhost:6379".to_string()]),

            max_connections: std::env::var("REDIS_MAX_CONN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50),

            command_timeout: Duration::from_secs(
                std::env::var("REDIS_COMMAND_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(2),
            ),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            shard_urls: vec!["redis://localhost:6379".to_string()],
            max_connections: 50,
            command_timeout: Duration::from_secs(2),
        }
    }
}

/// Split a comma-separated shard URL list, dropping blanks.
fn parse_shard_urls(urls: &str) -> Vec<String> {
    urls.split(',')
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .collect()
}

/// Source backed by sharded Redis: one connection pool per shard, with keys
/// placed by a stable hash so every service replica agrees on ownership.
pub struct RedisSource {
    shards: Vec<Pool>,
    command_timeout: Duration,
}

impl RedisSource {
    /// Build a pool per shard and verify each one responds to PING.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        if config.shard_urls.is_empty() {
            return Err(LimiterError::Configuration(
                "at least one Redis shard URL is required".to_string(),
            ));
        }

        info!("Connecting to {} Redis shard(s)...", config.shard_urls.len());

        let mut shards = Vec::with_capacity(config.shard_urls.len());
        for url in &config.shard_urls {
            let mut cfg = RedisPoolConfig::from_url(url.clone());
            cfg.pool = Some(PoolConfig::new(config.max_connections));

            let pool = cfg.create_pool(Some(Runtime::Tokio1)).map_err(|e| {
                LimiterError::Configuration(format!("failed to create pool for {url}: {e}"))
            })?;
            shards.push(pool);
        }

        let source = Self {
            shards,
            command_timeout: config.command_timeout,
        };

        debug!("Testing Redis shard connectivity...");
        source.ping().await?;
        info!("All Redis shards reachable");

        Ok(source)
    }

    /// Index of the shard that owns `bucket_key`. SHA-256 rather than the
    /// std hasher: placement must be identical across processes and Rust
    /// versions, or replicas would read and write different shards.
    fn shard_index(&self, bucket_key: &str) -> usize {
        let digest = Sha256::digest(bucket_key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % self.shards.len() as u64) as usize
    }

    async fn checkout(&self, shard: usize) -> std::result::Result<Connection, SourceError> {
        self.shards[shard].get().await.map_err(classify_pool_error)
    }

    /// Bound `op` by the per-command deadline and record its latency under
    /// the `call` label.
    async fn timed<T, F>(&self, call: &str, op: F) -> std::result::Result<T, SourceError>
    where
        F: Future<Output = std::result::Result<T, SourceError>>,
    {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.command_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::DeadlineExceeded(format!(
                "{call} exceeded {:?}",
                self.command_timeout
            ))),
        };

        match &result {
            Ok(_) => metrics::record_source_call(call, "success", start.elapsed()),
            Err(err) => metrics::record_source_call(call, err.result_label(), start.elapsed()),
        }
        result
    }

    /// Group `keys` by owning shard, preserving per-shard order.
    fn group_by_shard<'k>(&self, keys: impl Iterator<Item = &'k str>) -> Vec<Vec<&'k str>> {
        let mut groups: Vec<Vec<&str>> = vec![Vec::new(); self.shards.len()];
        for key in keys {
            groups[self.shard_index(key)].push(key);
        }
        groups
    }
}

#[async_trait::async_trait]
impl Source for RedisSource {
    async fn get(&self, bucket_key: &str) -> std::result::Result<i64, SourceError> {
        let shard = self.shard_index(bucket_key);
        self.timed("get", async {
            let mut conn = self.checkout(shard).await?;
            let tat: Option<i64> = conn.get(bucket_key).await.map_err(classify_redis_error)?;
            tat.ok_or(SourceError::NotFound)
        })
        .await
    }

    async fn set(&self, bucket_key: &str, tat: i64) -> std::result::Result<(), SourceError> {
        let shard = self.shard_index(bucket_key);
        self.timed("set", async {
            let mut conn = self.checkout(shard).await?;
            let _: () = conn
                .set(bucket_key, tat)
                .await
                .map_err(classify_redis_error)?;
            Ok(())
        })
        .await
    }

    async fn batch_get(
        &self,
        bucket_keys: &[String],
    ) -> std::result::Result<HashMap<String, i64>, SourceError> {
        self.timed("batchget", async {
            let mut tats = HashMap::with_capacity(bucket_keys.len());
            let groups = self.group_by_shard(bucket_keys.iter().map(String::as_str));

            for (shard, keys) in groups.iter().enumerate() {
                if keys.is_empty() {
                    continue;
                }
                let mut pipe = redis::pipe();
                for key in keys {
                    pipe.get(*key);
                }

                let mut conn = self.checkout(shard).await?;
                let values: Vec<Option<i64>> = pipe
                    .query_async(&mut conn)
                    .await
                    .map_err(classify_redis_error)?;

                for (key, value) in keys.iter().zip(values) {
                    // Missing keys are silently omitted.
                    if let Some(tat) = value {
                        tats.insert((*key).to_string(), tat);
                    }
                }
            }
            Ok(tats)
        })
        .await
    }

    async fn batch_set(
        &self,
        tats: &HashMap<String, i64>,
    ) -> std::result::Result<(), SourceError> {
        self.timed("batchset", async {
            let groups = self.group_by_shard(tats.keys().map(String::as_str));

            for (shard, keys) in groups.iter().enumerate() {
                if keys.is_empty() {
                    continue;
                }
                let mut pipe = redis::pipe();
                for key in keys {
                    pipe.set(*key, tats[*key]).ignore();
                }

                let mut conn = self.checkout(shard).await?;
                let _: () = pipe
                    .query_async(&mut conn)
                    .await
                    .map_err(classify_redis_error)?;
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, bucket_key: &str) -> std::result::Result<(), SourceError> {
        let shard = self.shard_index(bucket_key);
        self.timed("delete", async {
            let mut conn = self.checkout(shard).await?;
            // DEL reports how many keys existed; success either way.
            let _: i64 = conn.del(bucket_key).await.map_err(classify_redis_error)?;
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> std::result::Result<(), SourceError> {
        self.timed("ping", async {
            for (shard, pool) in self.shards.iter().enumerate() {
                let mut conn = pool.get().await.map_err(classify_pool_error)?;
                let response: String = redis::cmd("PING")
                    .query_async(&mut conn)
                    .await
                    .map_err(classify_redis_error)?;
                if response != "PONG" {
                    return Err(SourceError::Server(format!(
                        "unexpected PING response from shard {shard}: {response}"
                    )));
                }
            }
            Ok(())
        })
        .await
    }
}

fn classify_redis_error(err: redis::RedisError) -> SourceError {
    match err.kind() {
        redis::ErrorKind::IoError => SourceError::Timeout(err.to_string()),
        redis::ErrorKind::TypeError => SourceError::Unknown(err.to_string()),
        _ => SourceError::Server(err.to_string()),
    }
}

fn classify_pool_error(err: PoolError) -> SourceError {
    match err {
        PoolError::Backend(backend) => classify_redis_error(backend),
        PoolError::Timeout(_) => {
            SourceError::Timeout("connection pool checkout timed out".to_string())
        }
        other => SourceError::Unknown(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lazy_source(shard_count: usize) -> RedisSource {
        let shards = (0..shard_count)
            .map(|i| {
                RedisPoolConfig::from_url(format!("redis://shard-{i}:6379"))
                    .create_pool(Some(Runtime::Tokio1))
                    .unwrap()
            })
            .collect();
        RedisSource {
            shards,
            command_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn shard_urls_parse_from_csv() {
        assert_eq!(
            parse_shard_urls("redis://a:6379, redis://b:6379,"),
            vec!["redis://a:6379", "redis://b:6379"]
        );
        assert!(parse_shard_urls("").is_empty());
    }

    #[test]
    fn shard_placement_is_stable_and_in_range() {
        let source = lazy_source(4);

        for i in 0..64 {
            let key = format!("new_orders_per_account:{i}");
            let shard = source.shard_index(&key);
            assert!(shard < 4);
            assert_eq!(shard, source.shard_index(&key));
        }

        // A healthy hash should not funnel every key to one shard.
        let hit: std::collections::HashSet<usize> = (0..64)
            .map(|i| source.shard_index(&format!("new_orders_per_account:{i}")))
            .collect();
        assert!(hit.len() > 1);
    }

    #[test]
    fn classification_covers_the_taxonomy() {
        let io = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(matches!(classify_redis_error(io), SourceError::Timeout(_)));

        let server = redis::RedisError::from((redis::ErrorKind::ResponseError, "boom"));
        assert!(matches!(
            classify_redis_error(server),
            SourceError::Server(_)
        ));

        let parse = redis::RedisError::from((redis::ErrorKind::TypeError, "not an int"));
        assert!(matches!(
            classify_redis_error(parse),
            SourceError::Unknown(_)
        ));
    }
}
