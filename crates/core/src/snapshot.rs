use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::watch;

const HEALTH_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub seq: u64,
    pub mono_ns: u64,
    #[serde(default)]
    pub run_id: Option<String>,
    pub counts: Counts,
    pub subscribers: u64,
    pub storage: StorageInfo,
    pub config: ConfigSummary,
    pub health: Vec<String>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            seq: 0,
            mono_ns: monotonic_ns(),
            run_id: None,
            counts: Counts::default(),
            subscribers: 0,
            storage: StorageInfo::default(),
            config: ConfigSummary::default(),
            health: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub frames_received: u64,
    pub raw_text_frames: u64,
    pub records_rejected: u64,
    pub cycles_started: u64,
    pub cycles_refused: u64,
    pub cycles_broadcast: u64,
    pub cycles_empty: u64,
    pub writes_ok: u64,
    pub writes_failed: u64,
    pub writes_timed_out: u64,
    pub relayed_messages: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    FramesReceived,
    RawTextFrames,
    RecordsRejected,
    CyclesStarted,
    CyclesRefused,
    CyclesBroadcast,
    CyclesEmpty,
    WritesOk,
    WritesFailed,
    WritesTimedOut,
    RelayedMessages,
}

const COUNTER_SLOTS: usize = 11;

impl Counter {
    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub backend: String,
    pub backlog_count: u64,
    pub last_flush_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub replay_limit: usize,
    pub max_inflight_cycles: usize,
    pub write_timeout_ms: u64,
    pub subscriber_queue_capacity: usize,
    pub subscriber_send_timeout_ms: u64,
    pub mqtt_enabled: bool,
}

/// Daemon status, republished on every change so `/v1/stream` watchers see
/// each step.
pub struct SnapshotBus {
    seq: AtomicU64,
    counters: [AtomicU64; COUNTER_SLOTS],
    subscribers: AtomicU64,
    run_id: std::sync::OnceLock<String>,
    storage_tx: watch::Sender<StorageInfo>,
    config_tx: watch::Sender<ConfigSummary>,
    health_tx: watch::Sender<VecDeque<String>>,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
    snapshot_rx: watch::Receiver<Arc<Snapshot>>,
}

impl Default for SnapshotBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotBus {
    pub fn new() -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(Snapshot::empty()));
        Self {
            seq: AtomicU64::new(0),
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            subscribers: AtomicU64::new(0),
            run_id: std::sync::OnceLock::new(),
            storage_tx: watch::Sender::new(StorageInfo::default()),
            config_tx: watch::Sender::new(ConfigSummary::default()),
            health_tx: watch::Sender::new(VecDeque::with_capacity(HEALTH_CAPACITY)),
            snapshot_tx,
            snapshot_rx,
        }
    }

    pub fn set_run_id(&self, run_id: impl Into<String>) {
        let _ = self.run_id.set(run_id.into());
        self.publish();
    }

    pub fn set_config(&self, config: ConfigSummary) {
        self.config_tx.send_replace(config);
        self.publish();
    }

    pub fn set_storage(&self, storage: StorageInfo) {
        self.storage_tx.send_replace(storage);
        self.publish();
    }

    pub fn bump(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        if n == 0 {
            return;
        }
        self.counters[counter.slot()].fetch_add(n, Ordering::Relaxed);
        self.publish();
    }

    pub fn set_subscribers(&self, n: usize) {
        self.subscribers.store(n as u64, Ordering::Relaxed);
        self.publish();
    }

    pub fn push_health(&self, msg: impl Into<String>) {
        let msg = msg.into();
        self.health_tx.send_modify(|buf| {
            if buf.len() >= HEALTH_CAPACITY {
                let _ = buf.pop_front();
            }
            buf.push_back(msg);
        });
        self.publish();
    }

    pub fn current_health(&self) -> Vec<String> {
        self.health_tx.borrow().iter().cloned().collect()
    }

    pub fn counts(&self) -> Counts {
        let get = |c: Counter| self.counters[c.slot()].load(Ordering::Relaxed);
        Counts {
            frames_received: get(Counter::FramesReceived),
            raw_text_frames: get(Counter::RawTextFrames),
            records_rejected: get(Counter::RecordsRejected),
            cycles_started: get(Counter::CyclesStarted),
            cycles_refused: get(Counter::CyclesRefused),
            cycles_broadcast: get(Counter::CyclesBroadcast),
            cycles_empty: get(Counter::CyclesEmpty),
            writes_ok: get(Counter::WritesOk),
            writes_failed: get(Counter::WritesFailed),
            writes_timed_out: get(Counter::WritesTimedOut),
            relayed_messages: get(Counter::RelayedMessages),
        }
    }

    fn publish(&self) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let snap = Snapshot {
            seq,
            mono_ns: monotonic_ns(),
            run_id: self.run_id.get().cloned(),
            counts: self.counts(),
            subscribers: self.subscribers.load(Ordering::Relaxed),
            storage: self.storage_tx.borrow().clone(),
            config: self.config_tx.borrow().clone(),
            health: self.current_health(),
        };
        let _ = self.snapshot_tx.send_replace(Arc::new(snap));
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot_rx.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot_rx.clone()
    }
}

fn monotonic_ns() -> u64 {
    use std::time::SystemTime;
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_reflected_in_published_snapshot() {
        let bus = SnapshotBus::new();
        bus.bump(Counter::CyclesStarted);
        bus.bump(Counter::CyclesStarted);
        bus.add(Counter::WritesOk, 3);
        bus.set_subscribers(2);

        let snap = bus.snapshot();
        assert_eq!(snap.counts.cycles_started, 2);
        assert_eq!(snap.counts.writes_ok, 3);
        assert_eq!(snap.subscribers, 2);
        assert_eq!(snap.seq, 4);
    }

    #[test]
    fn health_log_is_bounded() {
        let bus = SnapshotBus::new();
        for i in 0..(HEALTH_CAPACITY + 5) {
            bus.push_health(format!("event {i}"));
        }
        let health = bus.current_health();
        assert_eq!(health.len(), HEALTH_CAPACITY);
        assert_eq!(health.first().map(String::as_str), Some("event 5"));
    }

    #[test]
    fn watchers_observe_changes() {
        let bus = SnapshotBus::new();
        let mut rx = bus.watch_snapshot();
        rx.mark_unchanged();
        bus.set_storage(StorageInfo {
            backend: "memory".into(),
            backlog_count: 1,
            last_flush_at: None,
        });
        assert!(rx.has_changed().unwrap_or(false));
        assert_eq!(rx.borrow_and_update().storage.backend, "memory");
    }

    #[test]
    fn counter_slots_cover_every_counter() {
        assert_eq!(Counter::RelayedMessages.slot() + 1, COUNTER_SLOTS);
    }
}
