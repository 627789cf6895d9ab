//! Isolated per-project memory with three partitions.
//!
//! ShortTerm is scratch space clearable on demand, LongTerm is the persisted
//! partition, Context is session-scoped and never written to disk.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPartition {
    ShortTerm,
    LongTerm,
    Context,
}

impl FromStr for MemoryPartition {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "short_term" => Ok(MemoryPartition::ShortTerm),
            "long_term" => Ok(MemoryPartition::LongTerm),
            "context" => Ok(MemoryPartition::Context),
            _ => Err(format!("Unknown memory partition: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub value: serde_json::Value,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Importance level attached to history events.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_type: String,
    pub data: serde_json::Value,
    pub importance: Importance,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryMetadata {
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub total_entries: usize,
    pub last_accessed: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMemory {
    short_term: HashMap<String, MemoryEntry>,
    long_term: HashMap<String, MemoryEntry>,
    context: HashMap<String, MemoryEntry>,
    history: Vec<HistoryEvent>,
    pub metadata: MemoryMetadata,
}

impl ProjectMemory {
    pub fn new() -> Self {
        let now = chrono::Utc::now();
        Self {
            short_term: HashMap::new(),
            long_term: HashMap::new(),
            context: HashMap::new(),
            history: Vec::new(),
            metadata: MemoryMetadata {
                created_at: now,
                total_entries: 0,
                last_accessed: now,
            },
        }
    }

    fn partition_mut(&mut self, partition: MemoryPartition) -> &mut HashMap<String, MemoryEntry> {
        match partition {
            MemoryPartition::ShortTerm => &mut self.short_term,
            MemoryPartition::LongTerm => &mut self.long_term,
            MemoryPartition::Context => &mut self.context,
        }
    }

    fn partition(&self, partition: MemoryPartition) -> &HashMap<String, MemoryEntry> {
        match partition {
            MemoryPartition::ShortTerm => &self.short_term,
            MemoryPartition::LongTerm => &self.long_term,
            MemoryPartition::Context => &self.context,
        }
    }

    fn touch(&mut self) {
        self.metadata.last_accessed = chrono::Utc::now();
        self.metadata.total_entries =
            self.short_term.len() + self.long_term.len() + self.context.len();
    }

    pub fn put(&mut self, partition: MemoryPartition, key: impl Into<String>, value: serde_json::Value) {
        self.partition_mut(partition).insert(
            key.into(),
            MemoryEntry {
                value,
                updated_at: chrono::Utc::now(),
            },
        );
        self.touch();
    }

    pub fn get(&mut self, partition: MemoryPartition, key: &str) -> Option<serde_json::Value> {
        self.metadata.last_accessed = chrono::Utc::now();
        self.partition(partition).get(key).map(|e| e.value.clone())
    }

    pub fn delete(&mut self, partition: MemoryPartition, key: &str) -> bool {
        let removed = self.partition_mut(partition).remove(key).is_some();
        self.touch();
        removed
    }

    /// Wipe ShortTerm only; other partitions are untouched.
    pub fn clear_short_term(&mut self) -> usize {
        let cleared = self.short_term.len();
        self.short_term.clear();
        self.touch();
        cleared
    }

    pub fn add_history(
        &mut self,
        event_type: impl Into<String>,
        data: serde_json::Value,
        importance: Importance,
    ) {
        self.history.push(HistoryEvent {
            event_type: event_type.into(),
            data,
            importance,
            timestamp: chrono::Utc::now(),
        });
        self.metadata.last_accessed = chrono::Utc::now();
    }

    pub fn history(
        &self,
        event_type: Option<&str>,
        min_importance: Option<Importance>,
        limit: Option<usize>,
    ) -> Vec<&HistoryEvent> {
        let filtered: Vec<&HistoryEvent> = self
            .history
            .iter()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .filter(|e| min_importance.map_or(true, |min| e.importance >= min))
            .collect();

        match limit {
            Some(n) if n < filtered.len() => filtered[filtered.len() - n..].to_vec(),
            _ => filtered,
        }
    }

    /// State persisted to disk: the LongTerm partition, history, and
    /// metadata. ShortTerm and Context are deliberately absent.
    pub fn to_persisted(&self) -> PersistedMemory {
        PersistedMemory {
            long_term: self.long_term.clone(),
            history: self.history.clone(),
            metadata: self.metadata.clone(),
        }
    }

    pub fn restore(persisted: PersistedMemory) -> Self {
        Self {
            short_term: HashMap::new(),
            long_term: persisted.long_term,
            context: HashMap::new(),
            history: persisted.history,
            metadata: persisted.metadata,
        }
    }
}

impl Default for ProjectMemory {
    fn default() -> Self {
        Self::new()
    }
}

/// On-disk layout of a project's memory document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedMemory {
    pub long_term: HashMap<String, MemoryEntry>,
    pub history: Vec<HistoryEvent>,
    pub metadata: MemoryMetadata,
}
