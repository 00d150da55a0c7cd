use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use common::{
    AnalysisConfig, Diagnostic, EngineError, Result, RetryPolicy, ScanResult, SignalDirection,
    StrategyKind, TradingSignal,
};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::data::{with_retry, DataProvider, SnapshotWindow};
use crate::notify::SignalNotifier;
use crate::registry::StrategyRegistry;
use crate::strategies::{evaluate_guarded, CacheKey, CacheStats, EvaluationCache, Strategy};

type WorkItem = (String, Arc<dyn Strategy>);

/// Evaluates every (symbol, strategy) pair of a sector universe on a bounded
/// worker pool and aggregates the results into one ordered signal list.
pub struct MarketScanner<P: DataProvider> {
    provider: Arc<P>,
    notifier: Option<Arc<dyn SignalNotifier>>,
    retry: RetryPolicy,
    as_of: Option<DateTime<Utc>>,
    /// Cache plus the config it was built for; a config change starts a fresh cache
    cache: Mutex<Option<(AnalysisConfig, Arc<EvaluationCache>)>>,
}

impl<P: DataProvider> MarketScanner<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self {
            provider,
            notifier: None,
            retry: RetryPolicy::default(),
            as_of: None,
            cache: Mutex::new(None),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn SignalNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Evaluate as of a fixed instant instead of the wall clock
    pub fn with_as_of(mut self, as_of: DateTime<Utc>) -> Self {
        self.as_of = Some(as_of);
        self
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        let guard = self.cache.lock().ok()?;
        guard.as_ref().map(|(_, cache)| cache.stats())
    }

    /// Drop memoized evaluations of a symbol, e.g. after its data was corrected
    pub fn invalidate_symbol(&self, symbol: &str) {
        if let Ok(guard) = self.cache.lock() {
            if let Some((_, cache)) = guard.as_ref() {
                cache.invalidate_symbol(symbol);
            }
        }
    }

    fn cache_for(&self, config: &AnalysisConfig) -> Option<Arc<EvaluationCache>> {
        if !config.enable_caching {
            return None;
        }
        let mut guard = self.cache.lock().ok()?;
        match guard.as_ref() {
            Some((cached_config, cache)) if cached_config == config => {
                cache.purge_expired();
                Some(Arc::clone(cache))
            }
            _ => {
                let cache = Arc::new(EvaluationCache::new(config.cache_ttl()));
                *guard = Some((config.clone(), Arc::clone(&cache)));
                Some(cache)
            }
        }
    }

    /// Scan the given sectors with every registered strategy.
    ///
    /// Failures of single items are recorded as diagnostics; only invalid
    /// configuration and fatal provider errors fail the whole scan.
    pub fn scan(
        &self,
        sectors: &[String],
        registry: &StrategyRegistry,
        config: &AnalysisConfig,
        cancel: &CancellationToken,
    ) -> Result<ScanResult> {
        config.validate()?;
        if sectors.is_empty() {
            return Err(EngineError::Configuration(
                "at least one sector is required".to_string(),
            ));
        }
        if registry.is_empty() {
            return Err(EngineError::Configuration(
                "no strategies registered".to_string(),
            ));
        }

        let started = Instant::now();
        let as_of = self.as_of.unwrap_or_else(Utc::now);
        let lookback = registry.max_lookback().max(1);
        let cache = self.cache_for(config);
        let mut result = ScanResult::default();

        let symbols = self.resolve_universe(sectors, &mut result.diagnostics)?;
        let items: Vec<WorkItem> = symbols
            .iter()
            .flat_map(|symbol| registry.iter().map(move |s| (symbol.clone(), Arc::clone(s))))
            .collect();

        info!(
            sectors = sectors.len(),
            symbols = symbols.len(),
            items = items.len(),
            workers = config.max_concurrent_workers,
            batch_size = config.batch_size,
            "Starting market scan"
        );

        let pool = ThreadPoolBuilder::new()
            .num_threads(config.max_concurrent_workers)
            .thread_name(|i| format!("scan-worker-{}", i))
            .build()
            .map_err(|e| EngineError::Configuration(format!("worker pool: {}", e)))?;

        let mut candidates = Vec::new();

        for (batch_idx, batch) in items.chunks(config.batch_size).enumerate() {
            if cancel.is_cancelled() {
                info!(batch = batch_idx, "Scan cancelled");
                result.cancelled = true;
                break;
            }

            let windows = self.fetch_windows(&pool, batch, as_of, lookback, &mut result.diagnostics)?;

            let outcomes: Vec<(&str, StrategyKind, Result<Option<TradingSignal>>)> =
                pool.install(|| {
                    batch
                        .par_iter()
                        .filter_map(|(symbol, strategy)| {
                            let window = windows.get(symbol.as_str())?;
                            let outcome =
                                evaluate_item(strategy.as_ref(), window, config, cache.as_deref());
                            Some((symbol.as_str(), strategy.kind(), outcome))
                        })
                        .collect()
                });

            debug!(batch = batch_idx, items = outcomes.len(), "Batch evaluated");

            for (symbol, kind, outcome) in outcomes {
                result.items_evaluated += 1;
                match outcome {
                    Ok(Some(signal)) if signal.symbol != symbol => {
                        warn!(signal = %signal.id, item = symbol, "Signal outside the evaluated item");
                        result.diagnostics.push(Diagnostic::OutOfUniverse {
                            signal_id: signal.id,
                            symbol: signal.symbol,
                        });
                    }
                    Ok(Some(signal)) => candidates.push(signal),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(symbol, strategy = %kind, error = %e, "Strategy evaluation failed");
                        result.diagnostics.push(Diagnostic::SkippedItem {
                            symbol: symbol.to_string(),
                            strategy: Some(kind),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        result.signals = aggregate(candidates, config.confidence_threshold);

        if let Some(notifier) = &self.notifier {
            for signal in &result.signals {
                if let Err(e) = notifier.notify(signal) {
                    warn!(signal = %signal.id, error = %e, "Notification failed");
                    result.diagnostics.push(Diagnostic::NotificationFailed {
                        signal_id: signal.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            signals = result.signals.len(),
            evaluated = result.items_evaluated,
            diagnostics = result.diagnostics.len(),
            cancelled = result.cancelled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Market scan complete"
        );

        Ok(result)
    }

    /// Distinct symbols of all sectors; a sector that cannot be listed is skipped
    fn resolve_universe(
        &self,
        sectors: &[String],
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<BTreeSet<String>> {
        let mut symbols = BTreeSet::new();
        for sector in sectors {
            match with_retry(&self.retry, "list_symbols", || self.provider.list_symbols(sector)) {
                Ok(listed) => symbols.extend(listed),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(sector = %sector, error = %e, "Sector listing failed, skipping");
                    diagnostics.push(Diagnostic::SkippedItem {
                        symbol: sector.clone(),
                        strategy: None,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(symbols)
    }

    /// Windows for the distinct symbols of a batch, fetched in parallel
    fn fetch_windows<'a>(
        &self,
        pool: &rayon::ThreadPool,
        batch: &'a [WorkItem],
        as_of: DateTime<Utc>,
        lookback: usize,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<HashMap<&'a str, SnapshotWindow>> {
        let mut symbols: Vec<&str> = batch.iter().map(|(s, _)| s.as_str()).collect();
        symbols.dedup();

        let fetched: Vec<(&str, Result<SnapshotWindow>)> = pool.install(|| {
            symbols
                .par_iter()
                .map(|symbol| {
                    let window = with_retry(&self.retry, "get_snapshot_window", || {
                        self.provider.get_snapshot_window(symbol, as_of, lookback)
                    });
                    (*symbol, window)
                })
                .collect()
        });

        let mut windows = HashMap::with_capacity(fetched.len());
        for (symbol, window) in fetched {
            match window {
                Ok(window) => {
                    windows.insert(symbol, window);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(symbol, error = %e, "Snapshot fetch failed, skipping symbol");
                    diagnostics.push(Diagnostic::SkippedItem {
                        symbol: symbol.to_string(),
                        strategy: None,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(windows)
    }
}

fn evaluate_item(
    strategy: &dyn Strategy,
    window: &SnapshotWindow,
    config: &AnalysisConfig,
    cache: Option<&EvaluationCache>,
) -> Result<Option<TradingSignal>> {
    let (Some(cache), Some(latest)) = (cache, window.latest()) else {
        return evaluate_guarded(strategy, window, config);
    };

    let key = CacheKey::new(window.symbol(), latest.timestamp, strategy.kind());
    let value = cache.get_or_insert_with(key, || evaluate_guarded(strategy, window, config))?;
    Ok(value.as_ref().clone())
}

/// Threshold filter, one signal per symbol, then (confidence desc, symbol asc)
fn aggregate(candidates: Vec<TradingSignal>, threshold: f64) -> Vec<TradingSignal> {
    let mut best: BTreeMap<String, TradingSignal> = BTreeMap::new();

    for signal in candidates {
        if signal.direction == SignalDirection::Hold || signal.confidence < threshold {
            continue;
        }
        match best.get(&signal.symbol) {
            Some(current)
                if current.confidence > signal.confidence
                    || (current.confidence == signal.confidence
                        && current.strategy <= signal.strategy) => {}
            _ => {
                best.insert(signal.symbol.clone(), signal);
            }
        }
    }

    let mut signals: Vec<TradingSignal> = best.into_values().collect();
    signals.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    signals
}
