use dqs_common::{DqsError, Result, SetIdentifier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;

use crate::provider::{ProvidedStats, StatisticsProvider};
use crate::stats::TableStats;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetDef {
    pub database: String,
    pub set_name: String,
    #[serde(default)]
    pub rows: Option<u64>,
    #[serde(default)]
    pub bytes: Option<u64>,
    /// Figures were counted rather than estimated.
    #[serde(default)]
    pub exact: bool,
}

impl SetDef {
    pub fn identifier(&self) -> SetIdentifier {
        SetIdentifier::new(self.database.clone(), self.set_name.clone())
    }
}

/// In-memory registry of storage-owned sets and their statistics.
#[derive(Debug, Default)]
pub struct Catalog {
    sets: HashMap<SetIdentifier, SetDef>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            sets: HashMap::new(),
        }
    }

    pub fn register_set(&mut self, set: SetDef) {
        self.sets.insert(set.identifier(), set);
    }

    pub fn get(&self, id: &SetIdentifier) -> Result<&SetDef> {
        self.sets
            .get(id)
            .ok_or_else(|| DqsError::Plan(format!("unknown set: {id}")))
    }

    /// Load a JSON array of [`SetDef`].
    pub fn load(path: &str) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let sets: Vec<SetDef> =
            serde_json::from_str(&s).map_err(|e| DqsError::InvalidConfig(e.to_string()))?;
        let mut cat = Catalog::new();
        for set in sets {
            cat.register_set(set);
        }
        Ok(cat)
    }
}

impl StatisticsProvider for Catalog {
    fn get_statistics(&self, set: &SetIdentifier) -> Result<Option<ProvidedStats>> {
        let Some(def) = self.sets.get(set) else {
            return Ok(None);
        };
        match (def.rows, def.bytes) {
            (None, None) => Ok(None),
            (rows, bytes) => Ok(Some(ProvidedStats {
                stats: TableStats::new(rows.unwrap_or(0), bytes.unwrap_or(0)),
                is_actual: def.exact && rows.is_some() && bytes.is_some(),
            })),
        }
    }
}
