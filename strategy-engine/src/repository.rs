//! Portfolio persistence, used only at run boundaries.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use common::{EngineError, PortfolioSnapshot, Result};
use tracing::info;

pub trait PortfolioRepository: Send + Sync {
    /// Persist a snapshot and return its id
    fn save(&self, snapshot: &PortfolioSnapshot) -> Result<String>;

    fn load(&self, id: &str) -> Result<PortfolioSnapshot>;
}

fn snapshot_id(snapshot: &PortfolioSnapshot, seq: usize) -> String {
    let base = format!("portfolio-{}", snapshot.as_of.format("%Y%m%dT%H%M%S"));
    if seq == 0 {
        base
    } else {
        format!("{}-{}", base, seq)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRepository {
    snapshots: Mutex<HashMap<String, PortfolioSnapshot>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PortfolioRepository for InMemoryRepository {
    fn save(&self, snapshot: &PortfolioSnapshot) -> Result<String> {
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|_| EngineError::Repository("repository lock poisoned".to_string()))?;

        let mut seq = 0;
        let mut id = snapshot_id(snapshot, seq);
        while snapshots.contains_key(&id) {
            seq += 1;
            id = snapshot_id(snapshot, seq);
        }
        snapshots.insert(id.clone(), snapshot.clone());
        Ok(id)
    }

    fn load(&self, id: &str) -> Result<PortfolioSnapshot> {
        let snapshots = self
            .snapshots
            .lock()
            .map_err(|_| EngineError::Repository("repository lock poisoned".to_string()))?;
        snapshots
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::Repository(format!("no portfolio with id {}", id)))
    }
}

/// One pretty-printed JSON file per snapshot under a directory
#[derive(Debug, Clone)]
pub struct JsonFileRepository {
    dir: PathBuf,
}

impl JsonFileRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

impl PortfolioRepository for JsonFileRepository {
    fn save(&self, snapshot: &PortfolioSnapshot) -> Result<String> {
        let mut seq = 0;
        let mut id = snapshot_id(snapshot, seq);
        while self.path_for(&id).exists() {
            seq += 1;
            id = snapshot_id(snapshot, seq);
        }

        let path = self.path_for(&id);
        let file = File::create(&path)
            .map_err(|e| EngineError::Repository(format!("{}: {}", path.display(), e)))?;
        serde_json::to_writer_pretty(BufWriter::new(file), snapshot)?;

        info!(id = %id, path = %path.display(), "Portfolio saved");
        Ok(id)
    }

    fn load(&self, id: &str) -> Result<PortfolioSnapshot> {
        let path = self.path_for(id);
        let file = File::open(&path)
            .map_err(|e| EngineError::Repository(format!("{}: {}", path.display(), e)))?;
        let snapshot = serde_json::from_reader(BufReader::new(file))?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn snapshot() -> PortfolioSnapshot {
        PortfolioSnapshot {
            cash: 1_234.5,
            positions: BTreeMap::new(),
            realized_pnl: 34.5,
            unrealized_pnl: 0.0,
            total_equity: 1_234.5,
            as_of: Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_in_memory_ids_are_unique() {
        let repo = InMemoryRepository::new();
        let a = repo.save(&snapshot()).unwrap();
        let b = repo.save(&snapshot()).unwrap();

        assert_ne!(a, b);
        assert_eq!(repo.len(), 2);
        assert_eq!(repo.load(&a).unwrap(), snapshot());
        assert!(repo.load("missing").is_err());
    }

    #[test]
    fn test_json_file_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::new(dir.path().join("portfolios")).unwrap();

        let id = repo.save(&snapshot()).unwrap();
        assert_eq!(id, "portfolio-20240301T150000");
        assert!(repo.dir().join(format!("{}.json", id)).exists());
        assert_eq!(repo.load(&id).unwrap(), snapshot());

        let second = repo.save(&snapshot()).unwrap();
        assert_eq!(second, "portfolio-20240301T150000-1");
    }
}
