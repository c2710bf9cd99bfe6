//! TTL response cache for validation calls.
//!
//! The cache is advisory: every failure path degrades to a miss. Entries
//! expire after the configured TTL and the oldest entry is evicted once
//! `max_entries` is reached.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};

use editorial_common::{CheckpointType, ValidationMode, ValidationRequest, ValidationResponse};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    content_hash: String,
    mode: ValidationMode,
    checkpoint: Option<CheckpointType>,
    platform: Option<String>,
    content_type: Option<String>,
}

impl CacheKey {
    pub fn for_request(request: &ValidationRequest) -> Self {
        let digest = Sha256::digest(request.content.as_bytes());
        Self {
            content_hash: format!("{:x}", digest),
            mode: request.mode,
            checkpoint: request.checkpoint,
            platform: request.normalized_platform(),
            content_type: request.normalized_content_type(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.mode,
            self.checkpoint.map(|c| c.as_str()).unwrap_or("-"),
            self.platform.as_deref().unwrap_or("-"),
            self.content_type.as_deref().unwrap_or("-"),
            &self.content_hash[..self.content_hash.len().min(16)]
        )
    }
}

struct CacheEntry {
    response: ValidationResponse,
    inserted_at: Instant,
    hits: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    pub ttl_seconds: u64,
    pub max_entries: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheDumpEntry {
    pub key: String,
    pub mode: ValidationMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointType>,
    pub rule_count: usize,
    pub hits: u64,
    pub age_seconds: f64,
    pub expires_in_seconds: f64,
}

pub struct ResponseCache {
    entries: DashMap<CacheKey, CacheEntry>,
    enabled: bool,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            enabled: true,
            ttl,
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(Duration::ZERO, 1)
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, key: &CacheKey) -> Option<ValidationResponse> {
        if !self.enabled {
            return None;
        }
        let ttl = self.ttl;
        if self
            .entries
            .remove_if(key, |_, entry| entry.inserted_at.elapsed() >= ttl)
            .is_some()
        {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.hits += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.response.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: CacheKey, response: ValidationResponse) {
        if !self.enabled {
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.purge_expired();
            if self.entries.len() >= self.max_entries {
                self.evict_oldest();
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                response,
                inserted_at: Instant::now(),
                hits: 0,
            },
        );
    }

    fn purge_expired(&self) {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
        let removed = before.saturating_sub(self.entries.len());
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().inserted_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest
            && self.entries.remove(&key).is_some()
        {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            enabled: self.enabled,
            entries: self.entries.len(),
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            ttl_seconds: self.ttl.as_secs(),
            max_entries: self.max_entries,
        }
    }

    /// Snapshot of live entries, newest first.
    pub fn dump(&self) -> Vec<CacheDumpEntry> {
        let mut entries: Vec<CacheDumpEntry> = self
            .entries
            .iter()
            .map(|entry| {
                let age = entry.value().inserted_at.elapsed();
                CacheDumpEntry {
                    key: entry.key().to_string(),
                    mode: entry.key().mode,
                    checkpoint: entry.key().checkpoint,
                    rule_count: entry.value().response.rule_count,
                    hits: entry.value().hits,
                    age_seconds: age.as_secs_f64(),
                    expires_in_seconds: self.ttl.saturating_sub(age).as_secs_f64(),
                }
            })
            .collect();
        entries.sort_by(|a, b| a.age_seconds.total_cmp(&b.age_seconds));
        entries
    }

    /// Drop every entry. Returns how many were removed.
    pub fn refresh(&self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(n: usize) -> ValidationResponse {
        let mut r = ValidationResponse::new(ValidationMode::Comprehensive, None, Vec::new());
        r.rule_count = n;
        r
    }

    #[test]
    fn test_key_depends_on_every_dimension() {
        let base =
            ValidationRequest::selective("Hello", Some("linkedin"), CheckpointType::PreWriting);
        let key = CacheKey::for_request(&base);

        let mut other = base.clone();
        other.checkpoint = Some(CheckpointType::PostWriting);
        assert_ne!(key, CacheKey::for_request(&other));

        let mut other = base.clone();
        other.platform = Some("twitter".into());
        assert_ne!(key, CacheKey::for_request(&other));

        let mut other = base.clone();
        other.content = "Hello!".into();
        assert_ne!(key, CacheKey::for_request(&other));

        let mut other = base.clone();
        other.platform = Some(" LINKEDIN".into());
        assert_eq!(key, CacheKey::for_request(&other));
    }

    #[test]
    fn test_hit_after_insert_and_stats() {
        let cache = ResponseCache::new(Duration::from_secs(60), 10);
        let key = CacheKey::for_request(&ValidationRequest::comprehensive("a", None, None));
        assert!(cache.get(&key).is_none());
        cache.insert(key.clone(), response(9));
        assert_eq!(cache.get(&key).unwrap().rule_count, 9);

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = ResponseCache::new(Duration::ZERO, 10);
        let key = CacheKey::for_request(&ValidationRequest::comprehensive("a", None, None));
        cache.insert(key.clone(), response(8));
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_oldest_entry_evicted_at_capacity() {
        let cache = ResponseCache::new(Duration::from_secs(60), 2);
        let keys: Vec<CacheKey> = ["a", "b", "c"]
            .iter()
            .map(|c| CacheKey::for_request(&ValidationRequest::comprehensive(*c, None, None)))
            .collect();
        for key in &keys {
            cache.insert(key.clone(), response(8));
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(cache.get(&keys[0]).is_none());
        assert!(cache.get(&keys[2]).is_some());
        assert_eq!(cache.stats().entries, 2);
    }

    #[test]
    fn test_refresh_and_dump() {
        let cache = ResponseCache::new(Duration::from_secs(60), 10);
        let request =
            ValidationRequest::selective("a", Some("linkedin"), CheckpointType::MidWriting);
        cache.insert(CacheKey::for_request(&request), response(3));
        let dump = cache.dump();
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[0].rule_count, 3);
        assert!(dump[0].key.starts_with("selective:mid-writing:linkedin:-:"));
        assert_eq!(cache.refresh(), 1);
        assert!(cache.dump().is_empty());
    }

    #[test]
    fn test_disabled_cache_never_hits() {
        let cache = ResponseCache::disabled();
        let key = CacheKey::for_request(&ValidationRequest::comprehensive("a", None, None));
        cache.insert(key.clone(), response(8));
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.stats().entries, 0);
    }
}
