//! MQTT ingress. Every publish on the configured topic filter is one frame,
//! decoded and routed exactly like an HTTP submission. Nothing is reported
//! back to the publisher; failures are only logged.
//!
//! The rumqttc event loop only reads the connection and queues payloads.
//! A separate forwarder feeds them to the pipeline and is the one that waits
//! for a cycle slot, so keep-alives keep flowing while the pipeline is
//! saturated.

use crate::daemon::pipeline::{IngestError, IngressSource, Pipeline};
use crate::daemon::server::ShutdownSignal;
use crate::daemon::snapshot::Counter;
use crate::util::config::AppConfig;
use crate::util::logging::{debug, info, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use telemux_core::frame::Frame;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

const REQUEST_CHANNEL_CAPACITY: usize = 64;
const FORWARD_QUEUE_CAPACITY: usize = 256;
const MIN_KEEP_ALIVE_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
    pub queue_capacity: usize,
}

impl BridgeConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            topic: config.mqtt_topic.clone(),
            client_id: config.mqtt_client_id.clone(),
            keep_alive: keep_alive_for(config.write_timeout_ms),
            reconnect_delay: Duration::from_secs(2),
            queue_capacity: FORWARD_QUEUE_CAPACITY,
        }
    }
}

/// Whole seconds, at least twice the write timeout.
fn keep_alive_for(write_timeout_ms: u64) -> Duration {
    let secs = write_timeout_ms.saturating_mul(2).div_ceil(1000);
    Duration::from_secs(secs.max(MIN_KEEP_ALIVE_SECS))
}

#[derive(Debug)]
struct Inbound {
    topic: String,
    payload: Vec<u8>,
}

/// Runs until `shutdown` fires. Connection errors are retried forever; the
/// event loop reconnects on the next poll and the subscription is renewed
/// on every ConnAck.
pub async fn run_bridge(config: BridgeConfig, pipeline: Arc<Pipeline>, shutdown: ShutdownSignal) {
    let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    options.set_keep_alive(config.keep_alive);
    let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
    info!(
        "MQTT bridge connecting to {}:{} for '{}' (keep-alive {:?})",
        config.host, config.port, config.topic, config.keep_alive
    );

    let (queue, pending) = mpsc::channel(config.queue_capacity.max(1));
    let forwarder = tokio::spawn(forward_loop(
        pending,
        Arc::clone(&pipeline),
        shutdown.clone(),
    ));

    let stop = shutdown.wait();
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = &mut stop => {
                let _ = client.disconnect().await;
                break;
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected; subscribing to '{}'", config.topic);
                        if let Err(err) = client.subscribe(config.topic.clone(), QoS::AtLeastOnce).await {
                            warn!("MQTT subscribe to '{}' failed: {}", config.topic, err);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let inbound = Inbound {
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                        };
                        enqueue(&queue, &pipeline, inbound);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(
                            "MQTT connection error: {}; retrying in {:?}",
                            err, config.reconnect_delay
                        );
                        tokio::select! {
                            _ = &mut stop => break,
                            _ = tokio::time::sleep(config.reconnect_delay) => {}
                        }
                    }
                }
            }
        }
    }

    drop(queue);
    if let Err(err) = forwarder.await {
        warn!("MQTT forwarder ended abnormally: {}", err);
    }
    info!("MQTT bridge stopped");
}

/// Never waits. A full queue means the pipeline is far behind; the payload
/// is dropped and counted as a refused cycle.
fn enqueue(queue: &mpsc::Sender<Inbound>, pipeline: &Pipeline, inbound: Inbound) {
    match queue.try_send(inbound) {
        Ok(()) => {}
        Err(TrySendError::Full(inbound)) => {
            pipeline.snapshot_bus().bump(Counter::CyclesRefused);
            warn!(
                "MQTT '{}': forward queue full, dropped {} bytes",
                inbound.topic,
                inbound.payload.len()
            );
        }
        Err(TrySendError::Closed(inbound)) => {
            debug!("MQTT '{}': forwarder gone, dropped payload", inbound.topic);
        }
    }
}

async fn forward_loop(
    mut pending: mpsc::Receiver<Inbound>,
    pipeline: Arc<Pipeline>,
    shutdown: ShutdownSignal,
) {
    let stop = shutdown.wait();
    tokio::pin!(stop);

    loop {
        let inbound = tokio::select! {
            _ = &mut stop => break,
            next = pending.recv() => match next {
                Some(inbound) => inbound,
                None => break,
            },
        };
        tokio::select! {
            _ = &mut stop => break,
            _ = forward_publish(&pipeline, &inbound.topic, &inbound.payload) => {}
        }
    }
    debug!("MQTT forwarder stopped");
}

async fn forward_publish(pipeline: &Arc<Pipeline>, topic: &str, payload: &[u8]) {
    match pipeline
        .submit(Frame::Binary(payload.to_vec()), IngressSource::Bridge)
        .await
    {
        Ok(admission) => debug!("MQTT '{}': {:?}", topic, admission),
        Err(IngestError::NotStructured { text, .. }) => {
            warn!("MQTT '{}': dropped unstructured payload ({} bytes)", topic, text.len())
        }
        Err(err) => warn!("MQTT '{}': dropped payload: {}", topic, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::fanout::{FanoutConfig, FanoutHub};
    use crate::daemon::pipeline::{PipelineConfig, PipelineResources};
    use crate::daemon::snapshot::SnapshotBus;
    use crate::storage::RecordStore;
    use crate::storage::memory::MemoryStore;
    use async_trait::async_trait;
    use telemux_core::error::PersistenceError;
    use telemux_core::records::{Category, PersistedRecord, SubRecord};

    /// Accepts writes and never finishes them.
    struct StuckStore;

    #[async_trait]
    impl RecordStore for StuckStore {
        fn backend_name(&self) -> &'static str {
            "stuck"
        }

        async fn ping(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn insert(&self, _record: SubRecord) -> Result<PersistedRecord, PersistenceError> {
            std::future::pending().await
        }

        async fn recent(
            &self,
            _category: Category,
            _limit: usize,
        ) -> anyhow::Result<Vec<PersistedRecord>> {
            Ok(Vec::new())
        }
    }

    fn pipeline(store: Arc<dyn RecordStore>, max_inflight_cycles: usize) -> Arc<Pipeline> {
        let bus = Arc::new(SnapshotBus::new());
        let fanout = Arc::new(FanoutHub::new(
            FanoutConfig {
                queue_capacity: 8,
                send_timeout: Duration::from_millis(100),
                replay_limit: 10,
            },
            Arc::clone(&bus),
        ));
        Pipeline::new(
            PipelineConfig {
                max_inflight_cycles,
                write_timeout: Duration::from_secs(60),
            },
            PipelineResources {
                store,
                fanout,
                snapshot_bus: bus,
            },
        )
    }

    const SENSOR_PAYLOAD: &[u8] = br#"{"sensor":{"accel_x":0.0,"accel_y":0.0,"accel_z":9.8,"gyro_x":0.0,"gyro_y":0.0,"gyro_z":0.0}}"#;

    #[tokio::test(flavor = "current_thread")]
    async fn publish_payload_runs_a_cycle() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(Arc::clone(&store) as Arc<dyn RecordStore>, 4);

        forward_publish(&pipeline, "telemetry/rig-1", SENSOR_PAYLOAD).await;
        pipeline.wait_idle().await;

        assert_eq!(store.len(Category::Sensor), 1);
        assert_eq!(pipeline.snapshot_bus().snapshot().counts.cycles_broadcast, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unstructured_payload_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(Arc::clone(&store) as Arc<dyn RecordStore>, 4);

        forward_publish(&pipeline, "telemetry/rig-1", b"Hello").await;
        pipeline.wait_idle().await;

        let snapshot = pipeline.snapshot_bus().snapshot();
        assert_eq!(snapshot.counts.raw_text_frames, 1);
        assert_eq!(snapshot.counts.cycles_started, 0);
        assert_eq!(store.len(Category::Sensor), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn forwarder_stops_while_waiting_for_a_slot() {
        let pipeline = pipeline(Arc::new(StuckStore), 1);
        // Occupies the only slot for good.
        pipeline
            .submit(Frame::Binary(SENSOR_PAYLOAD.to_vec()), IngressSource::Bridge)
            .await
            .expect("first cycle");

        let (queue, pending) = mpsc::channel(4);
        let (stop_tx, stop) = ShutdownSignal::new();
        let forwarder = tokio::spawn(forward_loop(pending, Arc::clone(&pipeline), stop));
        enqueue(
            &queue,
            &pipeline,
            Inbound {
                topic: "telemetry/rig-1".into(),
                payload: SENSOR_PAYLOAD.to_vec(),
            },
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!forwarder.is_finished());

        let _ = stop_tx.send(true);
        tokio::time::timeout(Duration::from_secs(1), forwarder)
            .await
            .expect("forwarder observed shutdown")
            .expect("forwarder task");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn full_queue_drops_and_counts() {
        let pipeline = pipeline(Arc::new(MemoryStore::new()), 1);
        let (queue, mut pending) = mpsc::channel(1);
        for n in 0..2 {
            enqueue(
                &queue,
                &pipeline,
                Inbound {
                    topic: format!("telemetry/{n}"),
                    payload: SENSOR_PAYLOAD.to_vec(),
                },
            );
        }
        assert_eq!(pipeline.snapshot_bus().snapshot().counts.cycles_refused, 1);
        assert_eq!(pending.recv().await.map(|i| i.topic), Some("telemetry/0".into()));
    }

    #[test]
    fn keep_alive_outlasts_the_write_timeout() {
        assert_eq!(keep_alive_for(5_000), Duration::from_secs(30));
        assert_eq!(keep_alive_for(45_000), Duration::from_secs(90));
        assert_eq!(keep_alive_for(20_500), Duration::from_secs(41));
    }
}
