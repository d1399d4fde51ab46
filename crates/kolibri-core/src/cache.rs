//! Runtime caching primitives: the offline response cache and the RAG
//! answer cache.
//!
//! Keys are SHA-256 digests over canonical JSON; opaque byte payloads are
//! collapsed to their SHA-1 hex before keying so identical media hits the
//! same entry without holding the bytes. Both caches prune lazily on reads
//! and are safe to share across request tasks.

use crate::clock::{system_clock, Clock};
use crate::encoders::ModalityInput;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    timestamp: DateTime<Utc>,
}

/// TTL cache for full response payloads keyed by canonical request digests.
pub struct OfflineCache {
    ttl: Duration,
    clock: Clock,
    entries: DashMap<String, CacheEntry>,
}

impl OfflineCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, system_clock())
    }

    pub fn with_clock(ttl: Duration, clock: Clock) -> Self {
        Self {
            ttl,
            clock,
            entries: DashMap::new(),
        }
    }

    pub fn put(&self, key: &str, value: serde_json::Value) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                timestamp: (self.clock)(),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.prune();
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn prune(&self) {
        let now = (self.clock)();
        self.entries
            .retain(|_, entry| now - entry.timestamp <= self.ttl);
    }

    pub fn size(&self) -> usize {
        self.prune();
        self.entries.len()
    }
}

impl Default for OfflineCache {
    fn default() -> Self {
        Self::new(Duration::hours(1))
    }
}

/// Aggregate counters exposed by [`RagCache::stats`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct RagCacheStats {
    pub hits: f64,
    pub misses: f64,
    pub requests: f64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub size: f64,
}

/// Caches retrieval-augmented answers per user and context.
pub struct RagCache {
    inner: OfflineCache,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for RagCache {
    fn default() -> Self {
        Self::new(Duration::minutes(30))
    }
}

impl RagCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, system_clock())
    }

    pub fn with_clock(ttl: Duration, clock: Clock) -> Self {
        Self {
            inner: OfflineCache::with_clock(ttl, clock),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn key(user_id: &str, query: &str, tags: &[String], modalities: &[String], top_k: usize) -> String {
        let tags: BTreeSet<&str> = tags.iter().map(String::as_str).collect();
        let modalities: BTreeSet<&str> = modalities.iter().map(String::as_str).collect();
        let payload = serde_json::json!({
            "user": user_id,
            "query": query,
            "tags": tags,
            "modalities": modalities,
            "top_k": top_k,
        });
        sha256_hex(&payload.to_string())
    }

    pub fn get(
        &self,
        user_id: &str,
        query: &str,
        tags: &[String],
        modalities: &[String],
        top_k: usize,
    ) -> Option<serde_json::Value> {
        let key = Self::key(user_id, query, tags, modalities, top_k);
        match self.inner.get(&key) {
            Some(answer) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(answer)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(
        &self,
        user_id: &str,
        query: &str,
        tags: &[String],
        modalities: &[String],
        top_k: usize,
        answer: serde_json::Value,
    ) {
        let key = Self::key(user_id, query, tags, modalities, top_k);
        self.inner.put(&key, answer);
    }

    pub fn stats(&self) -> RagCacheStats {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        let requests = hits + misses;
        let (hit_rate, miss_rate) = if requests > 0.0 {
            (hits / requests, misses / requests)
        } else {
            (0.0, 0.0)
        };
        RagCacheStats {
            hits,
            misses,
            requests,
            hit_rate,
            miss_rate,
            size: self.inner.size() as f64,
        }
    }
}

/// Canonical offline-cache key over the full request identity.
pub fn offline_cache_key(
    user_id: &str,
    goal: &str,
    modalities: &BTreeMap<String, ModalityInput>,
    transcript: &str,
    tags: &[String],
) -> String {
    let mut sorted_tags: Vec<&str> = tags.iter().map(String::as_str).collect();
    sorted_tags.sort_unstable();
    let canonical_modalities: BTreeMap<&str, serde_json::Value> = modalities
        .iter()
        .map(|(name, input)| (name.as_str(), normalize_cache_value(input)))
        .collect();
    let payload = serde_json::json!({
        "user": user_id,
        "goal": goal,
        "modalities": canonical_modalities,
        "transcript": transcript,
        "tags": sorted_tags,
    });
    sha256_hex(&payload.to_string())
}

/// Collapses a modality input into a canonical JSON value: opaque bytes
/// become their SHA-1 hex, nested collections are normalized recursively.
pub fn normalize_cache_value(input: &ModalityInput) -> serde_json::Value {
    match input {
        ModalityInput::Text(text) => serde_json::json!(text),
        ModalityInput::Audio(samples) => serde_json::json!(samples),
        ModalityInput::Image(bytes) => serde_json::json!(sha1_hex(bytes)),
        ModalityInput::Video(frames) => serde_json::json!(frames
            .iter()
            .map(|frame| sha1_hex(frame))
            .collect::<Vec<_>>()),
        ModalityInput::Sensors(events) => serde_json::json!(events
            .iter()
            .map(|event| {
                serde_json::json!({
                    "source": event.source,
                    "signal_type": event.signal_type,
                    "value": event.value,
                    "timestamp": event.timestamp,
                })
            })
            .collect::<Vec<_>>()),
    }
}

fn sha256_hex(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

fn sha1_hex(bytes: &[u8]) -> String {
    hex::encode(Sha1::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fixed_clock;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::sync::Mutex;

    fn stepping_clock(start: DateTime<Utc>) -> (Clock, Arc<Mutex<DateTime<Utc>>>) {
        let state = Arc::new(Mutex::new(start));
        let view = state.clone();
        let clock: Clock = Arc::new(move || *view.lock().unwrap());
        (clock, state)
    }

    #[test]
    fn offline_cache_evicts_after_ttl() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let (clock, state) = stepping_clock(start);
        let cache = OfflineCache::with_clock(Duration::minutes(5), clock);
        cache.put("answer", serde_json::json!({"text": "cached"}));
        assert_eq!(
            cache.get("answer"),
            Some(serde_json::json!({"text": "cached"}))
        );
        *state.lock().unwrap() = start + Duration::minutes(10);
        assert_eq!(cache.get("answer"), None);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn rag_cache_counts_hits_and_misses() {
        let cache = RagCache::default();
        let tags = vec!["pii".to_string()];
        let modalities = vec!["text".to_string()];
        assert!(cache.get("u", "q", &tags, &modalities, 5).is_none());
        cache.put("u", "q", &tags, &modalities, 5, serde_json::json!({"summary": "s"}));
        assert!(cache.get("u", "q", &tags, &modalities, 5).is_some());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1.0);
        assert_eq!(stats.misses, 1.0);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn rag_cache_key_ignores_tag_order_and_duplicates() {
        let cache = RagCache::default();
        let modalities = vec!["text".to_string()];
        cache.put(
            "u",
            "q",
            &["a".to_string(), "b".to_string()],
            &modalities,
            3,
            serde_json::json!({"summary": "s"}),
        );
        let reordered = vec!["b".to_string(), "a".to_string(), "a".to_string()];
        assert!(cache.get("u", "q", &reordered, &modalities, 3).is_some());
    }

    #[test]
    fn byte_payloads_key_by_digest() {
        let mut left = BTreeMap::new();
        left.insert("image".to_string(), ModalityInput::Image(vec![1, 2, 3]));
        let mut right = BTreeMap::new();
        right.insert("image".to_string(), ModalityInput::Image(vec![1, 2, 3]));
        let tags = vec![];
        assert_eq!(
            offline_cache_key("u", "g", &left, "", &tags),
            offline_cache_key("u", "g", &right, "", &tags)
        );
        let mut other = BTreeMap::new();
        other.insert("image".to_string(), ModalityInput::Image(vec![9, 9, 9]));
        assert_ne!(
            offline_cache_key("u", "g", &left, "", &tags),
            offline_cache_key("u", "g", &other, "", &tags)
        );
    }

    #[test]
    fn fixed_clock_never_expires_within_ttl() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let cache = OfflineCache::with_clock(Duration::hours(1), fixed_clock(at));
        cache.put("k", serde_json::json!(1));
        assert!(cache.get("k").is_some());
    }
}
