//! Result cache
//!
//! Memoizes expensive deterministic functions (page fetches, per-URL
//! summaries) in the shared key-value store. Keys are a stable hash of the
//! function name plus the canonical JSON of its arguments; values are the
//! serialized return. The cache fails open: a store error on read falls
//! through to compute, a store error on write still returns the computed
//! value.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::kv::KvStore;

/// Whether a lookup was served from the store or computed fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
}

/// Canonicalize a JSON value: object keys sorted recursively, arrays kept
/// in order. Two structurally equal values always render identically.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap_or_default());
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Cache key: `{fn_name}:{sha256(fn_name + canonical args)[..16]}`.
pub fn cache_key(fn_name: &str, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fn_name.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_json(args).as_bytes());
    let hash = hasher.finalize();
    format!("cache:{}:{}", fn_name, hex::encode(&hash[..16]))
}

/// Content-addressed cache over the shared key-value store.
#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn KvStore>,
    ttl_secs: u64,
}

impl ResultCache {
    pub fn new(store: Arc<dyn KvStore>, ttl_secs: u64) -> Self {
        Self { store, ttl_secs }
    }

    /// Look up `(fn_name, args)`; on miss run `compute`, store the result
    /// with the configured TTL, and return it.
    pub async fn get_or_compute<T, F, Fut>(&self, fn_name: &str, args: &Value, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (value, _) = self
            .get_or_compute_with_outcome(fn_name, args, compute)
            .await?;
        Ok(value)
    }

    /// Like [`get_or_compute`](Self::get_or_compute), also reporting whether
    /// the value came from the store. Callers use this to account token
    /// usage only for fresh computations.
    pub async fn get_or_compute_with_outcome<T, F, Fut>(
        &self,
        fn_name: &str,
        args: &Value,
        compute: F,
    ) -> Result<(T, CacheOutcome)>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = cache_key(fn_name, args);

        match self.store.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    tracing::debug!(key = %key, "Cache hit");
                    return Ok((value, CacheOutcome::Hit));
                }
                Err(e) => {
                    // A value that no longer deserializes is treated as absent
                    tracing::warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache read failed, computing");
            }
        }

        let value = compute().await?;

        match serde_json::to_string(&value) {
            Ok(raw) => {
                if let Err(e) = self.store.set_with_ttl(&key, &raw, self.ttl_secs).await {
                    tracing::warn!(key = %key, error = %e, "Cache write failed");
                }
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache value not serializable");
            }
        }

        Ok((value, CacheOutcome::Miss))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory_pool;
    use crate::kv::SqliteKv;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn cache() -> ResultCache {
        let kv = SqliteKv::new(memory_pool().await.unwrap());
        ResultCache::new(Arc::new(kv), 3600)
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"d": 2, "c": 3}});
        let b = json!({"a": {"c": 3, "d": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn test_cache_key_stable_under_key_order() {
        let k1 = cache_key("summarize", &json!({"url": "https://x", "query": "q"}));
        let k2 = cache_key("summarize", &json!({"query": "q", "url": "https://x"}));
        assert_eq!(k1, k2);

        let k3 = cache_key("fetch", &json!({"url": "https://x", "query": "q"}));
        assert_ne!(k1, k3);
    }

    #[tokio::test]
    async fn test_compute_exactly_once_within_ttl() {
        let cache = cache().await;
        let calls = AtomicU32::new(0);
        let args = json!({"url": "https://example.com"});

        for _ in 0..3 {
            let value: String = cache
                .get_or_compute("summarize", &args, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("a summary".to_string())
                })
                .await
                .unwrap();
            assert_eq!(value, "a summary");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_outcome_reports_hit_and_miss() {
        let cache = cache().await;
        let args = json!({"q": 1});

        let (_, outcome) = cache
            .get_or_compute_with_outcome("f", &args, || async { Ok(7u32) })
            .await
            .unwrap();
        assert_eq!(outcome, CacheOutcome::Miss);

        let (value, outcome) = cache
            .get_or_compute_with_outcome("f", &args, || async { Ok(99u32) })
            .await
            .unwrap();
        assert_eq!(outcome, CacheOutcome::Hit);
        // First successful compute wins within TTL
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_compute_error_propagates_and_is_not_cached() {
        let cache = cache().await;
        let args = json!({"q": 2});

        let result: Result<u32> = cache
            .get_or_compute("f", &args, || async {
                Err(crate::Error::Other("boom".into()))
            })
            .await;
        assert!(result.is_err());

        let (value, outcome) = cache
            .get_or_compute_with_outcome("f", &args, || async { Ok(5u32) })
            .await
            .unwrap();
        assert_eq!(outcome, CacheOutcome::Miss);
        assert_eq!(value, 5);
    }
}
