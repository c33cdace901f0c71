use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tokio::sync::{oneshot, watch};

use telemux_core::error::PersistenceError;
use telemux_core::records::{Category, PersistedRecord, SubRecord};

/// Key-generating record store. Each `insert` is its own atomic write; the
/// store assigns the identity and timestamp.
#[async_trait]
pub trait RecordStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Connectivity probe, run once before any ingress is accepted.
    async fn ping(&self) -> Result<()>;

    async fn insert(&self, record: SubRecord) -> Result<PersistedRecord, PersistenceError>;

    /// The newest `limit` records of one category, returned oldest first.
    async fn recent(&self, category: Category, limit: usize) -> Result<Vec<PersistedRecord>>;

    /// Stops background writers. Blocking; call outside the async runtime.
    fn close(&self) {}
}

static STORAGE_BACKLOG: AtomicU64 = AtomicU64::new(0);
static LAST_FLUSH_AT_EPOCH: AtomicI64 = AtomicI64::new(0);

static METRICS_CH: OnceCell<(
    watch::Sender<StorageMetrics>,
    watch::Receiver<StorageMetrics>,
)> = OnceCell::new();

fn init_metrics_channel() -> &'static (
    watch::Sender<StorageMetrics>,
    watch::Receiver<StorageMetrics>,
) {
    METRICS_CH.get_or_init(|| {
        let initial = storage_metrics_snapshot();
        watch::channel(initial)
    })
}

pub fn inc_backlog() {
    let _ = STORAGE_BACKLOG.fetch_add(1, Ordering::Relaxed);
    publish_metrics();
}

pub fn dec_backlog() {
    // Saturating: a spurious extra decrement must not wrap the gauge.
    let _ = STORAGE_BACKLOG.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(1))
    });
    publish_metrics();
}

pub fn set_last_flush(t: DateTime<Utc>) {
    LAST_FLUSH_AT_EPOCH.store(t.timestamp(), Ordering::Relaxed);
    publish_metrics();
}

#[derive(Clone, Debug, PartialEq)]
pub struct StorageMetrics {
    pub backlog_count: u64,
    pub last_flush_at: Option<DateTime<Utc>>,
}

fn storage_metrics_snapshot() -> StorageMetrics {
    let secs = LAST_FLUSH_AT_EPOCH.load(Ordering::Relaxed);
    let last = if secs > 0 {
        Utc.timestamp_opt(secs, 0).single()
    } else {
        None
    };
    StorageMetrics {
        backlog_count: STORAGE_BACKLOG.load(Ordering::Relaxed),
        last_flush_at: last,
    }
}

fn publish_metrics() {
    let (tx, _rx) = init_metrics_channel();
    let _ = tx.send(storage_metrics_snapshot());
}

pub fn storage_metrics_watch() -> watch::Receiver<StorageMetrics> {
    let (_tx, rx) = init_metrics_channel();
    rx.clone()
}

/// Requests handled by a backend's dedicated writer thread.
#[derive(Debug)]
pub enum StorageCommand {
    Insert {
        record: SubRecord,
        reply: oneshot::Sender<Result<PersistedRecord, PersistenceError>>,
    },
    Recent {
        category: Category,
        limit: usize,
        reply: oneshot::Sender<Result<Vec<PersistedRecord>>>,
    },
    Ping {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

pub mod memory;
pub mod sqlite3;
