use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::metrics;
use crate::source::{Source, SourceError};

/// In-memory source for tests and single-process deployments. Shares the
/// Redis source's semantics: missing keys are `NotFound`, sets overwrite,
/// deletes succeed regardless of prior existence.
#[derive(Debug, Default)]
pub struct InMemorySource {
    tats: DashMap<String, i64>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Source for InMemorySource {
    async fn get(&self, bucket_key: &str) -> Result<i64, SourceError> {
        let start = Instant::now();
        match self.tats.get(bucket_key) {
            Some(tat) => {
                metrics::record_source_call("get", "success", start.elapsed());
                Ok(*tat)
            }
            None => {
                metrics::record_source_call("get", "notFound", start.elapsed());
                Err(SourceError::NotFound)
            }
        }
    }

    async fn set(&self, bucket_key: &str, tat: i64) -> Result<(), SourceError> {
        let start = Instant::now();
        self.tats.insert(bucket_key.to_string(), tat);
        metrics::record_source_call("set", "success", start.elapsed());
        Ok(())
    }

    async fn batch_get(&self, bucket_keys: &[String]) -> Result<HashMap<String, i64>, SourceError> {
        let start = Instant::now();
        let tats = bucket_keys
            .iter()
            .filter_map(|key| self.tats.get(key).map(|tat| (key.clone(), *tat)))
            .collect();
        metrics::record_source_call("batchget", "success", start.elapsed());
        Ok(tats)
    }

    async fn batch_set(&self, tats: &HashMap<String, i64>) -> Result<(), SourceError> {
        let start = Instant::now();
        for (key, tat) in tats {
            self.tats.insert(key.clone(), *tat);
        }
        metrics::record_source_call("batchset", "success", start.elapsed());
        Ok(())
    }

    async fn delete(&self, bucket_key: &str) -> Result<(), SourceError> {
        let start = Instant::now();
        self.tats.remove(bucket_key);
        metrics::record_source_call("delete", "success", start.elapsed());
        Ok(())
    }

    async fn ping(&self) -> Result<(), SourceError> {
        metrics::record_source_call("ping", "success", Duration::ZERO);
        Ok(())
    }
}
