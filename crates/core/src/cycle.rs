//! Fan-in join for one ingestion cycle.
//!
//! A cycle is created per envelope with the number of sub-records that were
//! routed. Every write completion (success, failure or timeout) is reported
//! to the cycle's own [`CycleJoin`] exactly once; the join yields a
//! [`Completion`] on the report that brings the pending count to zero and
//! never again. Nothing in here is shared between cycles.

use crate::error::PersistenceError;
use crate::records::{ACTUATOR_KEY, Category, PersistedRecord};
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CycleId(u64);

impl CycleId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CycleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cycle-{:x}", self.0)
    }
}

const CYCLE_ID_SEQ_BITS: u64 = 12;
const CYCLE_ID_SEQ_MASK: u64 = (1 << CYCLE_ID_SEQ_BITS) - 1;

#[derive(Default)]
struct IdState {
    last_ms: u64,
    seq: u64,
}

/// Issues cycle ids as `(unix_millis << 12) | seq`, strictly increasing
/// across all ingress sources sharing the generator.
#[derive(Default)]
pub struct CycleIdGenerator {
    state: Mutex<IdState>,
}

impl CycleIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> CycleId {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;

        if now_ms > state.last_ms {
            state.last_ms = now_ms;
            state.seq = 0;
        } else if state.seq >= CYCLE_ID_SEQ_MASK {
            // Sequence space for this millisecond is exhausted (or the clock
            // stepped back); borrow the next millisecond.
            state.last_ms += 1;
            state.seq = 0;
        } else {
            state.seq += 1;
        }

        CycleId((state.last_ms << CYCLE_ID_SEQ_BITS) | state.seq)
    }
}

/// Category to persisted record for one cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregate {
    records: BTreeMap<Category, PersistedRecord>,
}

impl Aggregate {
    pub fn single(record: PersistedRecord) -> Self {
        let mut agg = Self::default();
        agg.records.insert(record.category(), record);
        agg
    }

    pub fn get(&self, category: Category) -> Option<&PersistedRecord> {
        self.records.get(&category)
    }

    pub fn categories(&self) -> impl Iterator<Item = Category> + '_ {
        self.records.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Copy without the records whose id is at or below the floor reported
    /// for their category. Categories without a floor are kept whole.
    pub fn newer_than(&self, floor: impl Fn(Category) -> Option<i64>) -> Aggregate {
        let records = self
            .records
            .iter()
            .filter(|(category, record)| floor(**category).is_none_or(|seen| record.id > seen))
            .map(|(category, record)| (*category, record.clone()))
            .collect();
        Aggregate { records }
    }

    fn insert(&mut self, record: PersistedRecord) -> Option<PersistedRecord> {
        self.records.insert(record.category(), record)
    }

    /// Outbound shape: actuator sides nest under `"actuator"`, every other
    /// category sits at the top level under its envelope key.
    pub fn to_message(&self) -> Value {
        let mut top = Map::new();
        let mut actuator = Map::new();
        for (category, record) in &self.records {
            match category {
                Category::Actuator(side) => {
                    actuator.insert(side.key().to_string(), record.to_json());
                }
                other => {
                    top.insert(other.label().to_string(), record.to_json());
                }
            }
        }
        if !actuator.is_empty() {
            top.insert(ACTUATOR_KEY.to_string(), Value::Object(actuator));
        }
        Value::Object(top)
    }
}

#[derive(Debug)]
pub enum WriteOutcome {
    Persisted(PersistedRecord),
    Failed {
        category: Category,
        error: PersistenceError,
    },
}

#[derive(Debug, PartialEq)]
pub enum Completion {
    /// At least one write succeeded; broadcast this exactly once.
    Broadcast(Aggregate),
    /// Nothing persisted (or nothing routed); retire silently.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CycleError {
    #[error("{cycle}: completion reported after the cycle was retired")]
    AlreadyRetired { cycle: CycleId },
}

#[derive(Debug)]
pub struct CycleJoin {
    id: CycleId,
    expected: usize,
    pending: usize,
    failures: usize,
    accumulated: Aggregate,
    retired: bool,
}

impl CycleJoin {
    pub fn new(id: CycleId, expected: usize) -> Self {
        Self {
            id,
            expected,
            pending: expected,
            failures: 0,
            accumulated: Aggregate::default(),
            retired: false,
        }
    }

    pub fn id(&self) -> CycleId {
        self.id
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Reports one write completion. Returns the completion when this call
    /// drained the pending count.
    pub fn complete_one(&mut self, outcome: WriteOutcome) -> Result<Option<Completion>, CycleError> {
        if self.retired || self.pending == 0 {
            return Err(CycleError::AlreadyRetired { cycle: self.id });
        }
        self.pending -= 1;

        match outcome {
            WriteOutcome::Persisted(record) => {
                let category = record.category();
                if self.accumulated.insert(record).is_some() {
                    // Routing yields one sub-record per category; the later
                    // write wins.
                    log::warn!("{}: {} persisted twice", self.id, category);
                }
            }
            WriteOutcome::Failed { category, error } => {
                self.failures += 1;
                log::warn!("{}: {} not persisted: {}", self.id, category, error);
            }
        }

        Ok(self.check_completion())
    }

    /// Completion check for a cycle that may have routed nothing. A cycle
    /// with outstanding writes returns `None`.
    pub fn check_completion(&mut self) -> Option<Completion> {
        if self.pending > 0 || self.retired {
            return None;
        }
        self.retired = true;
        let accumulated = std::mem::take(&mut self.accumulated);
        if accumulated.is_empty() {
            Some(Completion::Empty)
        } else {
            Some(Completion::Broadcast(accumulated))
        }
    }
}
