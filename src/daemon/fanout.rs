//! Live subscriber set and the outbound side of a cycle.
//!
//! Every subscriber owns a bounded queue. Publishing never waits on a
//! subscriber: a full or closed queue removes that subscriber and the rest
//! are unaffected. Queue order is publish order, so each subscriber sees
//! broadcasts in the order they were produced or is dropped.

use crate::daemon::snapshot::{Counter, SnapshotBus};
use crate::storage::RecordStore;
use crate::util::logging::{debug, info, warn};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use telemux_core::cycle::{Aggregate, CycleId};
use telemux_core::error::DeliveryError;
use telemux_core::records::Category;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

pub type SubscriberId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(Arc<str>),
    Binary(Arc<[u8]>),
    /// Persisted records, rendered once. The records ride along so a
    /// subscriber can skip the ones its replay already sent.
    Records {
        text: Arc<str>,
        aggregate: Arc<Aggregate>,
    },
}

impl Outbound {
    pub fn records(aggregate: Aggregate) -> Self {
        Outbound::Records {
            text: Arc::from(aggregate.to_message().to_string()),
            aggregate: Arc::new(aggregate),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Outbound::Text(text) | Outbound::Records { text, .. } => Some(&**text),
            Outbound::Binary(_) => None,
        }
    }
}

/// Highest record id per category that a subscriber's replay contained.
///
/// A subscriber is registered before its replay is read, so a cycle that
/// commits in between shows up in both. Live messages are passed through
/// [`ReplayWatermark::filter`] to send each record once.
#[derive(Debug, Default, Clone)]
pub struct ReplayWatermark {
    highest: BTreeMap<Category, i64>,
}

impl ReplayWatermark {
    pub fn from_replay(replay: &[Outbound]) -> Self {
        let mut highest: BTreeMap<Category, i64> = BTreeMap::new();
        for message in replay {
            let Outbound::Records { aggregate, .. } = message else {
                continue;
            };
            for category in aggregate.categories() {
                if let Some(record) = aggregate.get(category) {
                    let seen = highest.entry(category).or_insert(record.id);
                    *seen = (*seen).max(record.id);
                }
            }
        }
        Self { highest }
    }

    pub fn get(&self, category: Category) -> Option<i64> {
        self.highest.get(&category).copied()
    }

    /// Drops already replayed records from a live message. Returns `None`
    /// when nothing new is left. Relayed client messages pass unchanged.
    pub fn filter(&self, message: Outbound) -> Option<Outbound> {
        let Outbound::Records { aggregate, .. } = &message else {
            return Some(message);
        };
        let fresh = aggregate.newer_than(|category| self.get(category));
        if fresh.len() == aggregate.len() {
            Some(message)
        } else if fresh.is_empty() {
            None
        } else {
            Some(Outbound::records(fresh))
        }
    }
}

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    pub queue_capacity: usize,
    pub send_timeout: Duration,
    pub replay_limit: usize,
}

/// Receiving end handed to a connection task. Dropping it closes the queue;
/// the hub notices on the next publish.
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Outbound>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Outbound> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.receiver.try_recv().ok()
    }
}

pub struct FanoutHub {
    config: FanoutConfig,
    next_id: AtomicU64,
    subscribers: Mutex<BTreeMap<SubscriberId, mpsc::Sender<Outbound>>>,
    snapshot_bus: Arc<SnapshotBus>,
}

impl FanoutHub {
    pub fn new(config: FanoutConfig, snapshot_bus: Arc<SnapshotBus>) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(BTreeMap::new()),
            snapshot_bus,
        }
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<SubscriberId, mpsc::Sender<Outbound>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a subscriber. Live messages start queuing immediately.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let live = {
            let mut subscribers = self.lock();
            subscribers.insert(id, tx);
            subscribers.len()
        };
        self.snapshot_bus.set_subscribers(live);
        info!("subscriber {} connected ({} live)", id, live);
        Subscription { id, receiver: rx }
    }

    /// Returns false when the subscriber was already gone.
    pub fn unsubscribe(&self, id: SubscriberId, reason: Option<&DeliveryError>) -> bool {
        let (removed, live) = {
            let mut subscribers = self.lock();
            let removed = subscribers.remove(&id).is_some();
            (removed, subscribers.len())
        };
        if removed {
            self.snapshot_bus.set_subscribers(live);
            match reason {
                Some(reason) => warn!("subscriber {} removed: {}", id, reason),
                None => info!("subscriber {} disconnected ({} live)", id, live),
            }
        }
        removed
    }

    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    /// Queues `message` for every live subscriber except `except`. Returns
    /// how many queues accepted it.
    pub fn publish(&self, message: Outbound, except: Option<SubscriberId>) -> usize {
        let mut delivered = 0;
        let mut dropped = Vec::new();
        let live = {
            let mut subscribers = self.lock();
            for (&id, tx) in subscribers.iter() {
                if Some(id) == except {
                    continue;
                }
                match tx.try_send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => dropped.push((
                        id,
                        DeliveryError::QueueFull {
                            capacity: self.config.queue_capacity,
                        },
                    )),
                    Err(TrySendError::Closed(_)) => dropped.push((id, DeliveryError::Closed)),
                }
            }
            for (id, _) in &dropped {
                subscribers.remove(id);
            }
            subscribers.len()
        };

        if !dropped.is_empty() {
            for (id, reason) in &dropped {
                warn!("subscriber {} removed: {}", id, reason);
            }
            self.snapshot_bus.set_subscribers(live);
        }
        delivered
    }

    pub fn broadcast_cycle(&self, cycle: CycleId, aggregate: Aggregate) -> usize {
        let categories = aggregate.len();
        let delivered = self.publish(Outbound::records(aggregate), None);
        debug!(
            "{}: broadcast {} categories to {} subscribers",
            cycle, categories, delivered
        );
        delivered
    }

    /// Forwards a client message unchanged to every other subscriber.
    pub fn relay(&self, from: SubscriberId, message: Outbound) -> usize {
        self.snapshot_bus.bump(Counter::RelayedMessages);
        self.publish(message, Some(from))
    }
}

/// Builds the replay sent to a new subscriber: per category in
/// [`Category::ALL`] order, the newest `limit` records oldest first, each as
/// its own single-category message.
pub async fn replay_messages(store: &dyn RecordStore, limit: usize) -> Result<Vec<Outbound>> {
    let mut messages = Vec::new();
    if limit == 0 {
        return Ok(messages);
    }
    for category in Category::ALL {
        let records = store
            .recent(category, limit)
            .await
            .with_context(|| format!("reading replay for {category}"))?;
        messages.extend(
            records
                .into_iter()
                .map(|record| Outbound::records(Aggregate::single(record))),
        );
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemux_core::cycle::{Completion, CycleIdGenerator, CycleJoin, WriteOutcome};
    use telemux_core::records::{PersistedRecord, SubRecord};

    fn hub(capacity: usize) -> FanoutHub {
        FanoutHub::new(
            FanoutConfig {
                queue_capacity: capacity,
                send_timeout: Duration::from_millis(100),
                replay_limit: 10,
            },
            Arc::new(SnapshotBus::new()),
        )
    }

    fn text(s: &str) -> Outbound {
        Outbound::Text(Arc::from(s))
    }

    #[test]
    fn publish_preserves_order_per_subscriber() {
        let hub = hub(8);
        let mut sub = hub.subscribe();
        for i in 0..3 {
            hub.publish(text(&i.to_string()), None);
        }
        let got: Vec<String> = std::iter::from_fn(|| sub.try_recv())
            .filter_map(|m| m.as_text().map(str::to_string))
            .collect();
        assert_eq!(got, vec!["0", "1", "2"]);
    }

    #[test]
    fn full_queue_removes_only_that_subscriber() {
        let hub = hub(1);
        let _slow = hub.subscribe();
        let mut fast = hub.subscribe();

        assert_eq!(hub.publish(text("a"), None), 2);
        let _ = fast.try_recv();
        // The slow subscriber never drains and overflows here.
        assert_eq!(hub.publish(text("b"), None), 1);
        assert_eq!(hub.live_count(), 1);
        assert_eq!(fast.try_recv(), Some(text("b")));
    }

    #[test]
    fn dropped_receiver_is_pruned_on_publish() {
        let hub = hub(4);
        let gone = hub.subscribe();
        drop(gone);
        assert_eq!(hub.publish(text("x"), None), 0);
        assert_eq!(hub.live_count(), 0);
    }

    fn stored(id: i64, category: Category) -> PersistedRecord {
        let values = vec![1.0; category.fields().len()];
        PersistedRecord {
            id,
            created_at: Default::default(),
            record: SubRecord::from_values(category, &values).expect("schema arity"),
        }
    }

    fn joined(records: Vec<PersistedRecord>) -> Aggregate {
        let mut join = CycleJoin::new(CycleIdGenerator::new().next_id(), records.len());
        let mut done = None;
        for record in records {
            done = join
                .complete_one(WriteOutcome::Persisted(record))
                .expect("report");
        }
        match done {
            Some(Completion::Broadcast(agg)) => agg,
            other => panic!("expected broadcast, got {other:?}"),
        }
    }

    #[test]
    fn watermark_drops_fully_replayed_cycles() {
        let replay = vec![
            Outbound::records(Aggregate::single(stored(3, Category::Sensor))),
            Outbound::records(Aggregate::single(stored(5, Category::Sensor))),
        ];
        let watermark = ReplayWatermark::from_replay(&replay);
        assert_eq!(watermark.get(Category::Sensor), Some(5));

        let live = Outbound::records(Aggregate::single(stored(5, Category::Sensor)));
        assert_eq!(watermark.filter(live), None);
        let later = Outbound::records(Aggregate::single(stored(6, Category::Sensor)));
        assert!(watermark.filter(later).is_some());
    }

    #[test]
    fn watermark_strips_only_the_replayed_categories() {
        let replay = vec![Outbound::records(Aggregate::single(stored(
            7,
            Category::Sensor,
        )))];
        let watermark = ReplayWatermark::from_replay(&replay);

        let live = Outbound::records(joined(vec![
            stored(7, Category::Sensor),
            stored(8, Category::AggregateStatus),
        ]));
        let kept = watermark.filter(live).expect("status is new");
        let message: serde_json::Value =
            serde_json::from_str(kept.as_text().expect("text")).expect("json");
        assert!(message.get("sensor").is_none());
        assert_eq!(message["aggregate-status"]["id"], 8);
    }

    #[test]
    fn watermark_passes_relayed_messages() {
        let watermark = ReplayWatermark::from_replay(&[Outbound::records(Aggregate::single(
            stored(1, Category::Sensor),
        ))]);
        assert_eq!(watermark.filter(text("hi")), Some(text("hi")));
        assert!(ReplayWatermark::default().get(Category::Sensor).is_none());
    }

    #[test]
    fn unsubscribe_is_idempotent_and_updates_snapshot() {
        let bus = Arc::new(SnapshotBus::new());
        let hub = FanoutHub::new(
            FanoutConfig {
                queue_capacity: 4,
                send_timeout: Duration::from_millis(100),
                replay_limit: 10,
            },
            Arc::clone(&bus),
        );
        let sub = hub.subscribe();
        assert_eq!(bus.snapshot().subscribers, 1);
        assert!(hub.unsubscribe(sub.id(), None));
        assert!(!hub.unsubscribe(sub.id(), Some(&DeliveryError::Closed)));
        assert_eq!(bus.snapshot().subscribers, 0);
    }
}
