//! 阶段结果缓存
//!
//! 按 CacheKey 首字节分 16 片，每片一把锁，避免全局锁争用。
//! 过期判断惰性进行：lookup 时发现 age >= ttl 即视为未命中并删除。
//! 可选的总容量上限跨分片生效：超出时淘汰最早写入的条目。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::llm::{CacheKey, StageResult};

const SHARDS: usize = 16;

#[derive(Debug, Clone)]
struct CacheEntry {
    result: StageResult,
    created_at: Instant,
    ttl: Duration,
    /// 写入序号，容量淘汰按它判断先后
    seq: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

/// 缓存统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
pub struct ResponseCache {
    shards: Vec<Mutex<HashMap<CacheKey, CacheEntry>>>,
    /// 总条目上限
    max_entries: Option<usize>,
    next_seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            max_entries: None,
            next_seq: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// 总容量上限（至少 1）
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries.max(1)),
            ..Self::new()
        }
    }

    pub fn max_entries(&self) -> Option<usize> {
        self.max_entries
    }

    /// 查找未过期的结果；命中时返回 cache_hit = true 的副本
    pub fn lookup(&self, key: &CacheKey) -> Option<StageResult> {
        let now = Instant::now();
        let mut shard = self.shard(key);
        match shard.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                let mut result = entry.result.clone();
                result.cache_hit = true;
                Some(result)
            }
            Some(_) => {
                shard.remove(key);
                self.expired.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// 与 lookup 相同但不计入统计（单飞加锁后的二次确认用）
    pub(crate) fn peek(&self, key: &CacheKey) -> Option<StageResult> {
        let now = Instant::now();
        let shard = self.shard(key);
        shard
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| {
                let mut result = entry.result.clone();
                result.cache_hit = true;
                result
            })
    }

    /// 写入结果；ttl 为 0 时不缓存
    pub fn store(&self, key: CacheKey, result: StageResult, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let entry = CacheEntry {
            result,
            created_at: Instant::now(),
            ttl,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        self.shard(&key).insert(key, entry);

        if let Some(max) = self.max_entries {
            while self.len() > max {
                if !self.evict_oldest() {
                    break;
                }
            }
        }
    }

    /// 淘汰全局最早写入的条目；每次只持有一把分片锁
    fn evict_oldest(&self) -> bool {
        let oldest = self
            .shards
            .iter()
            .enumerate()
            .filter_map(|(i, shard)| {
                let shard = shard.lock().unwrap_or_else(|e| e.into_inner());
                shard
                    .iter()
                    .min_by_key(|(_, entry)| entry.seq)
                    .map(|(k, entry)| (entry.seq, i, k.clone()))
            })
            .min_by_key(|(seq, _, _)| *seq);

        let Some((seq, i, key)) = oldest else {
            return false;
        };
        let mut shard = self.shards[i].lock().unwrap_or_else(|e| e.into_inner());
        // 期间被覆盖写入的条目不再是最旧的，下一轮重新挑选
        if shard.get(&key).is_some_and(|entry| entry.seq == seq) {
            shard.remove(&key);
            tracing::debug!(key = ?key, "evicted oldest cache entry");
        }
        true
    }

    /// 删除单个条目（结果未通过阶段解析时使用）
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.shard(key).remove(key).is_some()
    }

    /// 清理所有已过期条目，返回清理数量
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(|e| e.into_inner());
            let before = shard.len();
            shard.retain(|_, entry| !entry.is_expired(now));
            removed += before - shard.len();
        }
        if removed > 0 {
            self.expired.fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(removed, "purged expired cache entries");
        }
        removed
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    fn shard(&self, key: &CacheKey) -> std::sync::MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.shards[key.shard(SHARDS)]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}
