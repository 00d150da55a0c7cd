//! Memoized strategy evaluations.
//!
//! Entries are written once and never mutated: a reader holding an
//! `Arc<Option<TradingSignal>>` sees the same value for as long as it keeps it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common::{Result, StrategyKind, TradingSignal};

/// Evaluation identity: the same symbol, bar and strategy always yield the same result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub strategy: StrategyKind,
}

impl CacheKey {
    pub fn new(symbol: impl Into<String>, timestamp: DateTime<Utc>, strategy: StrategyKind) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            strategy,
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    value: Arc<Option<TradingSignal>>,
    inserted_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() > ttl
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug)]
pub struct EvaluationCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EvaluationCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached evaluation if present and not expired
    pub fn get(&self, key: &CacheKey) -> Option<Arc<Option<TradingSignal>>> {
        let entries = self.entries.read().ok()?;
        entries
            .get(key)
            .filter(|entry| !entry.is_expired(self.ttl))
            .map(|entry| Arc::clone(&entry.value))
    }

    /// Return the cached evaluation or compute and insert it.
    ///
    /// `evaluate` runs without holding the lock. If another worker inserted the
    /// same key meanwhile, its entry wins and is returned. Errors are not cached.
    pub fn get_or_insert_with<F>(&self, key: CacheKey, evaluate: F) -> Result<Arc<Option<TradingSignal>>>
    where
        F: FnOnce() -> Result<Option<TradingSignal>>,
    {
        if let Some(value) = self.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let value = Arc::new(evaluate()?);

        let Ok(mut entries) = self.entries.write() else {
            return Ok(value);
        };
        match entries.get(&key) {
            Some(existing) if !existing.is_expired(self.ttl) => Ok(Arc::clone(&existing.value)),
            _ => {
                entries.insert(
                    key,
                    CacheEntry {
                        value: Arc::clone(&value),
                        inserted_at: Instant::now(),
                    },
                );
                Ok(value)
            }
        }
    }

    /// Drop every evaluation of a symbol
    pub fn invalidate_symbol(&self, symbol: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|key, _| key.symbol != symbol);
        }
    }

    /// Drop expired entries
    pub fn purge_expired(&self) {
        if let Ok(mut entries) = self.entries.write() {
            let ttl = self.ttl;
            entries.retain(|_, entry| !entry.is_expired(ttl));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for EvaluationCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}
