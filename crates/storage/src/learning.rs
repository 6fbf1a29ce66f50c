//! Self-learning statistics cache.
//!
//! Actual statistics observed by one job run are kept under the set's logical
//! name (`database.set_name`, no job scope) so the next run of the same plan
//! starts from measured figures instead of cost-model guesses.
//!
//! Concurrent jobs writing the same logical name are resolved
//! last-writer-wins; readers never see a torn file because the JSON backend
//! replaces the file atomically.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dqs_common::{DqsError, Result};
use tracing::{debug, warn};

use crate::stats::TableStats;

/// `get(logicalSetName) -> lastActual` / `put(logicalSetName, actual)`.
pub trait LearnedStatistics: Send + Sync {
    fn get(&self, logical_name: &str) -> Option<TableStats>;
    fn put(&self, logical_name: &str, actual: TableStats) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryStatisticsCache {
    entries: Mutex<HashMap<String, TableStats>>,
}

impl InMemoryStatisticsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LearnedStatistics for InMemoryStatisticsCache {
    fn get(&self, logical_name: &str) -> Option<TableStats> {
        self.entries
            .lock()
            .ok()
            .and_then(|m| m.get(logical_name).copied())
    }

    fn put(&self, logical_name: &str, actual: TableStats) -> Result<()> {
        let mut m = self
            .entries
            .lock()
            .map_err(|_| DqsError::InvalidConfig("statistics cache lock poisoned".to_string()))?;
        m.insert(logical_name.to_string(), actual);
        Ok(())
    }
}

/// JSON-file backed cache; the whole map is rewritten on every `put`.
#[derive(Debug)]
pub struct JsonFileStatisticsCache {
    path: PathBuf,
    entries: Mutex<HashMap<String, TableStats>>,
}

impl JsonFileStatisticsCache {
    /// Open `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries: HashMap<String, TableStats> = match fs::read_to_string(&path) {
            Ok(s) => serde_json::from_str(&s).map_err(|e| {
                DqsError::InvalidConfig(format!(
                    "statistics cache {} is not valid json: {e}",
                    path.display()
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(
            path = %path.display(),
            entries = entries.len(),
            operator = "StatisticsCacheOpen",
            "self-learning statistics cache opened"
        );
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn persist(&self, entries: &HashMap<String, TableStats>) -> Result<()> {
        let payload = serde_json::to_vec_pretty(entries)
            .map_err(|e| DqsError::InvalidConfig(format!("encode statistics cache: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl LearnedStatistics for JsonFileStatisticsCache {
    fn get(&self, logical_name: &str) -> Option<TableStats> {
        self.entries
            .lock()
            .ok()
            .and_then(|m| m.get(logical_name).copied())
    }

    fn put(&self, logical_name: &str, actual: TableStats) -> Result<()> {
        let mut m = self
            .entries
            .lock()
            .map_err(|_| DqsError::InvalidConfig("statistics cache lock poisoned".to_string()))?;
        m.insert(logical_name.to_string(), actual);
        if let Err(e) = self.persist(&m) {
            warn!(
                path = %self.path.display(),
                error = %e,
                operator = "StatisticsCachePut",
                "failed to persist self-learning statistics"
            );
            return Err(e);
        }
        Ok(())
    }
}
