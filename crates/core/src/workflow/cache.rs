use crate::canonical::canonical_json;
use crate::types::JobType;
use anyhow::Result;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Fingerprint of a job's type and configuration (SHA-256 over canonical JSON).
///
/// Field insertion order in `config` never changes the result.
pub fn fingerprint(job_type: &JobType, config: &serde_json::Value) -> String {
    let keyed = serde_json::json!({
        "type": job_type.as_str(),
        "config": config,
    });
    hex::encode(Sha256::digest(canonical_json(&keyed).as_bytes()))
}

/// Best-effort store of job results keyed by fingerprint.
///
/// Errors are logged by the engine and never fail a job.
#[async_trait::async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, fingerprint: &str) -> Result<Option<serde_json::Value>>;

    async fn put(&self, fingerprint: &str, output: &serde_json::Value) -> Result<()>;
}

/// Process-local result cache
#[derive(Default)]
pub struct InMemoryResultCache {
    entries: RwLock<HashMap<String, serde_json::Value>>,
}

impl InMemoryResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl ResultCache for InMemoryResultCache {
    async fn get(&self, fingerprint: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.entries.read().await.get(fingerprint).cloned())
    }

    async fn put(&self, fingerprint: &str, output: &serde_json::Value) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(fingerprint.to_string(), output.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_ignores_field_order() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"lr": 0.01, "layers": [64, 32], "opt": {"name": "adam", "beta": 0.9}}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"opt": {"beta": 0.9, "name": "adam"}, "layers": [64, 32], "lr": 0.01}"#).unwrap();
        let train = JobType::custom("train");
        assert_eq!(fingerprint(&train, &a), fingerprint(&train, &b));
        assert_eq!(fingerprint(&train, &a).len(), 64);
    }

    #[test]
    fn test_fingerprint_depends_on_type_and_values() {
        let config = json!({"lr": 0.01});
        assert_ne!(
            fingerprint(&JobType::custom("train"), &config),
            fingerprint(&JobType::custom("evaluate"), &config)
        );
        assert_ne!(
            fingerprint(&JobType::custom("train"), &config),
            fingerprint(&JobType::custom("train"), &json!({"lr": 0.02}))
        );
    }

    #[tokio::test]
    async fn test_in_memory_cache() {
        let cache = InMemoryResultCache::new();
        assert!(cache.get("k").await.unwrap().is_none());
        cache.put("k", &json!({"accuracy": 0.9})).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(json!({"accuracy": 0.9})));
        assert_eq!(cache.len().await, 1);
    }
}
