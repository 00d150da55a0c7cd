use std::sync::Arc;

use common::{Result, StrategyKind};

use crate::strategies::{create_all_strategies, create_strategy, Strategy};

/// Active strategies, one per kind, ordered by kind
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: Vec<Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Registry holding every built-in strategy
    pub fn all() -> Self {
        let mut registry = Self::new();
        for strategy in create_all_strategies() {
            registry.register(strategy);
        }
        registry
    }

    pub fn from_kinds(kinds: &[StrategyKind]) -> Self {
        let mut registry = Self::new();
        for kind in kinds {
            registry.register(create_strategy(*kind));
        }
        registry
    }

    /// Parse a comma-separated list of strategy names
    pub fn from_names(names: &str) -> Result<Self> {
        let kinds = names
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<StrategyKind>>>()?;
        Ok(Self::from_kinds(&kinds))
    }

    /// Add a strategy, replacing any registered strategy of the same kind
    pub fn register(&mut self, strategy: Arc<dyn Strategy>) {
        let kind = strategy.kind();
        match self.strategies.binary_search_by_key(&kind, |s| s.kind()) {
            Ok(idx) => self.strategies[idx] = strategy,
            Err(idx) => self.strategies.insert(idx, strategy),
        }
    }

    pub fn get(&self, kind: StrategyKind) -> Option<&Arc<dyn Strategy>> {
        self.strategies.iter().find(|s| s.kind() == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Strategy>> {
        self.strategies.iter()
    }

    pub fn kinds(&self) -> Vec<StrategyKind> {
        self.strategies.iter().map(|s| s.kind()).collect()
    }

    /// Longest window any registered strategy needs
    pub fn max_lookback(&self) -> usize {
        self.strategies
            .iter()
            .map(|s| s.min_lookback())
            .max()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::all()
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.kinds()).finish()
    }
}
