use crate::{RecordStore, dec_backlog, inc_backlog, set_last_flush};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use telemux_core::error::PersistenceError;
use telemux_core::records::{Category, PersistedRecord, SubRecord};

const DEFAULT_RETAIN_PER_CATEGORY: usize = 4096;

#[derive(Default)]
struct Tables {
    next_id: i64,
    rows: BTreeMap<Category, VecDeque<PersistedRecord>>,
}

/// Process-local store for ephemeral runs. Ids are shared across categories
/// and only the newest rows per category are retained.
pub struct MemoryStore {
    retain: usize,
    tables: Mutex<Tables>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAIN_PER_CATEGORY)
    }

    pub fn with_retention(retain: usize) -> Self {
        Self {
            retain: retain.max(1),
            tables: Mutex::new(Tables::default()),
        }
    }

    pub fn len(&self, category: Category) -> usize {
        self.lock().rows.get(&category).map_or(0, VecDeque::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn insert(&self, record: SubRecord) -> Result<PersistedRecord, PersistenceError> {
        inc_backlog();
        let persisted = {
            let mut tables = self.lock();
            tables.next_id += 1;
            let persisted = PersistedRecord {
                id: tables.next_id,
                created_at: Utc::now(),
                record,
            };
            let rows = tables.rows.entry(record.category()).or_default();
            rows.push_back(persisted.clone());
            while rows.len() > self.retain {
                rows.pop_front();
            }
            persisted
        };
        set_last_flush(persisted.created_at);
        dec_backlog();
        Ok(persisted)
    }

    async fn recent(&self, category: Category, limit: usize) -> Result<Vec<PersistedRecord>> {
        let tables = self.lock();
        let Some(rows) = tables.rows.get(&category) else {
            return Ok(Vec::new());
        };
        let skip = rows.len().saturating_sub(limit);
        Ok(rows.iter().skip(skip).cloned().collect())
    }
}
