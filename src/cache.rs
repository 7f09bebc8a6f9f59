use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use hickory_proto::rr::Record;
use lru::LruCache;
use rustc_hash::FxBuildHasher;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub answers: Vec<Record>,
    pub cached_at: Instant,
    /// 秒
    pub ttl: u64,
    pub is_negative: bool,
}

impl CacheEntry {
    #[inline]
    fn is_expired(&self, now: Instant) -> bool {
        match self.cached_at.checked_add(Duration::from_secs(self.ttl)) {
            Some(expires_at) => now >= expires_at,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub negative_hits: u64,
    pub evictions: u64,
}

/// Outcome of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(Vec<Record>),
    /// 负缓存命中：已知该名称无应答
    Negative,
    Miss,
}

/// The cache contract the engine depends on.
pub trait DnsCacheInterface: Send {
    fn get(&mut self, name: &str) -> CacheLookup;
    fn set(&mut self, name: &str, answers: &[Record], ttl: i64);
    /// `ttl` defaults to the configured negative TTL.
    fn set_negative(&mut self, name: &str, ttl: Option<i64>);
    #[allow(dead_code)]
    fn remove(&mut self, name: &str);
    #[allow(dead_code)]
    fn clear(&mut self);
    fn stats(&self) -> CacheStats;
}

pub type SharedCache = Arc<Mutex<dyn DnsCacheInterface>>;

pub fn shared<C: DnsCacheInterface + 'static>(cache: C) -> SharedCache {
    Arc::new(Mutex::new(cache))
}

/// 有界 LRU 缓存，读取时惰性过期。
///
/// 读（命中）与写都会把条目移到最近使用端；满时写入新名称会挤出最久未使用的条目。
#[derive(Debug)]
pub struct DnsCache {
    entries: LruCache<String, CacheEntry, FxBuildHasher>,
    max_ttl: u64,
    negative_ttl: u64,
    hits: u64,
    misses: u64,
    negative_hits: u64,
    evictions: u64,
}

impl DnsCache {
    pub fn new(max_size: i64, max_ttl: i64, negative_ttl: i64) -> Result<Self> {
        if max_size <= 0 {
            bail!("max_size must be greater than 0, got {}", max_size);
        }
        if max_ttl <= 0 {
            bail!("max_ttl must be greater than 0, got {}", max_ttl);
        }
        if negative_ttl <= 0 {
            bail!("negative_ttl must be greater than 0, got {}", negative_ttl);
        }
        let cap = NonZeroUsize::new(usize::try_from(max_size).unwrap_or(usize::MAX))
            .with_context(|| format!("invalid max_size {}", max_size))?;
        Ok(Self {
            entries: LruCache::with_hasher(cap, FxBuildHasher),
            max_ttl: max_ttl as u64,
            negative_ttl: negative_ttl as u64,
            hits: 0,
            misses: 0,
            negative_hits: 0,
            evictions: 0,
        })
    }

    fn get_at(&mut self, name: &str, now: Instant) -> CacheLookup {
        let expired = match self.entries.peek(name) {
            None => {
                self.misses += 1;
                return CacheLookup::Miss;
            }
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            self.entries.pop(name);
            self.misses += 1;
            return CacheLookup::Miss;
        }

        // get 会把条目提升为最近使用
        match self.entries.get(name) {
            Some(entry) if entry.is_negative => {
                self.negative_hits += 1;
                CacheLookup::Negative
            }
            Some(entry) => {
                self.hits += 1;
                CacheLookup::Hit(entry.answers.clone())
            }
            None => CacheLookup::Miss,
        }
    }

    fn normalize_ttl(&self, ttl: i64) -> u64 {
        if ttl <= 0 {
            0
        } else {
            (ttl as u64).min(self.max_ttl)
        }
    }

    fn insert(&mut self, name: &str, answers: Vec<Record>, ttl: u64, is_negative: bool) {
        let entry = CacheEntry {
            answers,
            cached_at: Instant::now(),
            ttl,
            is_negative,
        };
        // push 在覆盖同名条目时也会返回旧值，只有挤出其他名称才算淘汰
        if let Some((evicted, _)) = self.entries.push(name.to_string(), entry) {
            if evicted != name {
                self.evictions += 1;
            }
        }
    }
}

impl DnsCacheInterface for DnsCache {
    fn get(&mut self, name: &str) -> CacheLookup {
        self.get_at(name, Instant::now())
    }

    fn set(&mut self, name: &str, answers: &[Record], ttl: i64) {
        let ttl = self.normalize_ttl(ttl);
        if ttl == 0 {
            return;
        }
        self.insert(name, answers.to_vec(), ttl, false);
    }

    fn set_negative(&mut self, name: &str, ttl: Option<i64>) {
        let ttl = self.normalize_ttl(ttl.unwrap_or(self.negative_ttl as i64));
        if ttl == 0 {
            return;
        }
        self.insert(name, Vec::new(), ttl, true);
    }

    fn remove(&mut self, name: &str) {
        self.entries.pop(name);
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.hits = 0;
        self.misses = 0;
        self.negative_hits = 0;
        self.evictions = 0;
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.len(),
            max_size: self.entries.cap().get(),
            hits: self.hits,
            misses: self.misses,
            negative_hits: self.negative_hits,
            evictions: self.evictions,
        }
    }
}
