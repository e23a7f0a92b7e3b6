use dashmap::DashMap;
use fisiorag_core::model::{now_ms, Classification};
use fisiorag_core::telemetry::{events, Event, EventOutcome, EventSink};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Stable, content-addressed key: identical chunk content under the same
/// classifier version always maps to the same digest, across workers.
pub fn classification_digest(content: &str, classifier_version: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(classifier_version.to_le_bytes());
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub digest: String,
    pub result: Classification,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
}

impl CacheEntry {
    fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at_ms
    }
}

/// Key-value backend behind the classification cache. Kept as a trait so a
/// remote store can replace the in-process map; every error is survivable.
pub trait CacheBackend: Send + Sync {
    fn get(&self, digest: &str) -> Result<Option<CacheEntry>, CacheError>;
    fn put(&self, entry: CacheEntry) -> Result<(), CacheError>;
    fn remove(&self, digest: &str) -> Result<bool, CacheError>;
    fn clear(&self) -> Result<usize, CacheError>;
    fn len(&self) -> Result<usize, CacheError>;
}

#[derive(Default)]
pub struct InMemoryCacheBackend {
    entries: DashMap<String, CacheEntry>,
}

impl CacheBackend for InMemoryCacheBackend {
    fn get(&self, digest: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.get(digest).map(|entry| entry.clone()))
    }

    fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        self.entries.insert(entry.digest.clone(), entry);
        Ok(())
    }

    fn remove(&self, digest: &str) -> Result<bool, CacheError> {
        Ok(self.entries.remove(digest).is_some())
    }

    fn clear(&self) -> Result<usize, CacheError> {
        let count = self.entries.len();
        self.entries.clear();
        Ok(count)
    }

    fn len(&self) -> Result<usize, CacheError> {
        Ok(self.entries.len())
    }
}

/// Backend that always fails; exercises the fail-open path in tests.
pub struct FailingCacheBackend;

impl CacheBackend for FailingCacheBackend {
    fn get(&self, _digest: &str) -> Result<Option<CacheEntry>, CacheError> {
        Err(CacheError::Backend("connection refused".to_string()))
    }

    fn put(&self, _entry: CacheEntry) -> Result<(), CacheError> {
        Err(CacheError::Backend("connection refused".to_string()))
    }

    fn remove(&self, _digest: &str) -> Result<bool, CacheError> {
        Err(CacheError::Backend("connection refused".to_string()))
    }

    fn clear(&self) -> Result<usize, CacheError> {
        Err(CacheError::Backend("connection refused".to_string()))
    }

    fn len(&self) -> Result<usize, CacheError> {
        Err(CacheError::Backend("connection refused".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup {
    pub hit: bool,
    pub result: Option<Classification>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f32,
    pub errors: u64,
    pub size: usize,
}

/// Content-addressed cache of classifier outputs. Fail-open: a broken
/// backend degrades every lookup to a miss and every put to a no-op while
/// the error counter climbs; classification itself keeps running.
pub struct ClassificationCache {
    backend: Arc<dyn CacheBackend>,
    enabled: bool,
    max_ttl_seconds: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    sink: Option<Arc<dyn EventSink>>,
}

impl ClassificationCache {
    pub fn new(backend: Arc<dyn CacheBackend>, enabled: bool, max_ttl_seconds: u64) -> Self {
        Self {
            backend,
            enabled,
            max_ttl_seconds: max_ttl_seconds.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            sink: None,
        }
    }

    pub fn in_memory(enabled: bool, max_ttl_seconds: u64) -> Self {
        Self::new(Arc::new(InMemoryCacheBackend::default()), enabled, max_ttl_seconds)
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, digest: &str) -> CacheLookup {
        if !self.enabled {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return CacheLookup {
                hit: false,
                result: None,
            };
        }

        match self.backend.get(digest) {
            Ok(Some(entry)) if !entry.is_expired(now_ms()) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                CacheLookup {
                    hit: true,
                    result: Some(entry.result),
                }
            }
            Ok(Some(expired)) => {
                // Expired entries read as misses; eviction is best-effort.
                let _ = self.backend.remove(&expired.digest);
                self.misses.fetch_add(1, Ordering::Relaxed);
                CacheLookup {
                    hit: false,
                    result: None,
                }
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                CacheLookup {
                    hit: false,
                    result: None,
                }
            }
            Err(err) => {
                self.record_failure("get", &err);
                CacheLookup {
                    hit: false,
                    result: None,
                }
            }
        }
    }

    pub fn put(&self, digest: &str, result: Classification, ttl_seconds: u64) {
        if !self.enabled {
            return;
        }

        let ttl = ttl_seconds.min(self.max_ttl_seconds).max(1);
        let now = now_ms();
        let entry = CacheEntry {
            digest: digest.to_string(),
            result,
            created_at_ms: now,
            expires_at_ms: now + (ttl as i64) * 1000,
        };

        if let Err(err) = self.backend.put(entry) {
            self.record_failure("put", &err);
        }
    }

    pub fn invalidate(&self, digest: &str) -> Result<bool, CacheError> {
        self.backend.remove(digest)
    }

    pub fn invalidate_all(&self) -> Result<usize, CacheError> {
        self.backend.clear()
    }

    pub fn metrics(&self) -> CacheMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheMetrics {
            hits,
            misses,
            hit_rate: if lookups > 0 {
                hits as f32 / lookups as f32
            } else {
                0.0
            },
            errors: self.errors.load(Ordering::Relaxed),
            size: self.backend.len().unwrap_or(0),
        }
    }

    fn record_failure(&self, operation: &str, err: &CacheError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(operation, error = %err, "classification cache unavailable, continuing without");
        if let Some(sink) = &self.sink {
            let _ = sink.record(
                Event::new(events::CACHE_FAIL_OPEN, EventOutcome::Degraded)
                    .with_field("operation", operation),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fisiorag_core::model::DocumentStructure;
    use fisiorag_core::telemetry::InMemoryEventSink;
    use models::CLASSIFIER_VERSION;

    fn classification(domain: &str) -> Classification {
        Classification {
            domain: domain.to_string(),
            structure: DocumentStructure::Narrative,
            confidence: 0.9,
            version: CLASSIFIER_VERSION,
        }
    }

    #[test]
    fn digest_depends_on_content_and_version() {
        let a = classification_digest("testo", 1);
        let b = classification_digest("testo", 1);
        let c = classification_digest("testo", 2);
        let d = classification_digest("altro", 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn hit_after_put_and_version_carried() {
        let cache = ClassificationCache::in_memory(true, 3600);
        let digest = classification_digest("contenuto", CLASSIFIER_VERSION);

        assert!(!cache.get(&digest).hit);
        cache.put(&digest, classification("patologia"), 600);

        let lookup = cache.get(&digest);
        assert!(lookup.hit);
        assert_eq!(lookup.result.unwrap().version, CLASSIFIER_VERSION);

        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert!((metrics.hit_rate - 0.5).abs() < 1e-6);
        assert_eq!(metrics.size, 1);
    }

    #[test]
    fn expired_entries_read_as_misses() {
        let backend = Arc::new(InMemoryCacheBackend::default());
        let cache = ClassificationCache::new(backend.clone(), true, 3600);
        let digest = classification_digest("scaduto", CLASSIFIER_VERSION);

        backend
            .put(CacheEntry {
                digest: digest.clone(),
                result: classification("patologia"),
                created_at_ms: now_ms() - 10_000,
                expires_at_ms: now_ms() - 5_000,
            })
            .unwrap();

        assert!(!cache.get(&digest).hit);
        // Best-effort eviction removed the stale row.
        assert_eq!(backend.len().unwrap(), 0);
    }

    #[test]
    fn disabled_cache_always_misses_and_skips_puts() {
        let cache = ClassificationCache::in_memory(false, 3600);
        let digest = classification_digest("off", CLASSIFIER_VERSION);

        cache.put(&digest, classification("patologia"), 600);
        assert!(!cache.get(&digest).hit);
        assert_eq!(cache.metrics().size, 0);
    }

    #[test]
    fn ttl_is_clamped_to_upper_bound() {
        let backend = Arc::new(InMemoryCacheBackend::default());
        let cache = ClassificationCache::new(backend.clone(), true, 60);
        let digest = classification_digest("clamp", CLASSIFIER_VERSION);

        cache.put(&digest, classification("patologia"), 604_800);

        let entry = backend.get(&digest).unwrap().unwrap();
        assert!(entry.expires_at_ms - entry.created_at_ms <= 60_000);
    }

    #[test]
    fn backend_failure_is_fail_open_with_error_counter() {
        let sink = Arc::new(InMemoryEventSink::default());
        let cache = ClassificationCache::new(Arc::new(FailingCacheBackend), true, 3600)
            .with_event_sink(sink.clone());
        let digest = classification_digest("rotto", CLASSIFIER_VERSION);

        cache.put(&digest, classification("patologia"), 600);
        let lookup = cache.get(&digest);
        assert!(!lookup.hit);

        let metrics = cache.metrics();
        assert_eq!(metrics.errors, 2);
        assert!(!sink.events_named(events::CACHE_FAIL_OPEN).unwrap().is_empty());
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = ClassificationCache::in_memory(true, 3600);
        let digest = classification_digest("via", CLASSIFIER_VERSION);

        cache.put(&digest, classification("patologia"), 600);
        assert!(cache.invalidate(&digest).unwrap());
        assert!(!cache.get(&digest).hit);

        cache.put(&digest, classification("patologia"), 600);
        assert_eq!(cache.invalidate_all().unwrap(), 1);
        assert_eq!(cache.metrics().size, 0);
    }
}
