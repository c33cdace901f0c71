use crate::daemon::bridge::{BridgeConfig, run_bridge};
use crate::daemon::fanout::{FanoutConfig, FanoutHub};
use crate::daemon::pipeline::{Pipeline, PipelineConfig, PipelineResources};
use crate::daemon::runtime::ThreadRegistry;
use crate::daemon::server::{AppState, ShutdownSignal, serve};
use crate::daemon::snapshot::{ConfigSummary, SnapshotBus, StorageInfo};
use crate::storage::memory::MemoryStore;
use crate::storage::sqlite3::SqliteStore;
use crate::storage::{RecordStore, storage_metrics_watch};
use crate::util::config::{AppConfig, StoreBackendConfig};
use crate::util::logging::{error, info, warn};
use anyhow::{Context, Result, anyhow};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DaemonCoordinator {
    config: AppConfig,
    threads: ThreadRegistry,
}

impl DaemonCoordinator {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            config: config.clone(),
            threads: ThreadRegistry::new(),
        }
    }

    pub fn thread_registry(&self) -> ThreadRegistry {
        self.threads.clone()
    }

    pub fn open_store(&self) -> Result<Arc<dyn RecordStore>> {
        match self.config.store_backend {
            StoreBackendConfig::Sqlite3 => {
                let path = crate::util::paths::sqlite_db(&self.config.workspace_dir);
                let store = SqliteStore::open(&path, &self.threads)
                    .with_context(|| format!("opening SQLite store at {:?}", path))?;
                info!("Using SQLite store at {:?}", path);
                Ok(Arc::new(store))
            }
            StoreBackendConfig::Memory => {
                warn!("Using in-memory store; records will not survive a restart");
                Ok(Arc::new(MemoryStore::new()))
            }
        }
    }

    /// Wires pipeline, fan-out and HTTP state around an opened store.
    pub fn assemble(
        &self,
        store: Arc<dyn RecordStore>,
        snapshot_bus: Arc<SnapshotBus>,
        shutdown: ShutdownSignal,
    ) -> AppState {
        let fanout = Arc::new(FanoutHub::new(
            FanoutConfig {
                queue_capacity: self.config.subscriber_queue_capacity,
                send_timeout: Duration::from_millis(self.config.subscriber_send_timeout_ms),
                replay_limit: self.config.replay_limit,
            },
            Arc::clone(&snapshot_bus),
        ));
        let pipeline = Pipeline::new(
            PipelineConfig::from_app_config(&self.config),
            PipelineResources {
                store: Arc::clone(&store),
                fanout: Arc::clone(&fanout),
                snapshot_bus: Arc::clone(&snapshot_bus),
            },
        );
        AppState {
            pipeline,
            fanout,
            store,
            snapshot_bus,
            shutdown,
        }
    }

    /// Runs the daemon until `shutdown` resolves. Store and listener
    /// failures surface before any ingress is accepted.
    pub async fn run<F>(
        &self,
        store: Arc<dyn RecordStore>,
        snapshot_bus: Arc<SnapshotBus>,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Step A: checking {} store", store.backend_name());
        store
            .ping()
            .await
            .with_context(|| format!("{} store is unreachable", store.backend_name()))?;

        snapshot_bus.set_config(config_summary(&self.config));
        snapshot_bus.set_storage(StorageInfo {
            backend: store.backend_name().to_string(),
            ..StorageInfo::default()
        });

        let listener = TcpListener::bind(&self.config.http_addr)
            .await
            .with_context(|| format!("binding HTTP listener on {}", self.config.http_addr))?;

        let (stop_tx, stop) = ShutdownSignal::new();
        let state = self.assemble(Arc::clone(&store), Arc::clone(&snapshot_bus), stop.clone());
        let pipeline = Arc::clone(&state.pipeline);

        let metrics_task = tokio::spawn(forward_storage_metrics(
            store.backend_name(),
            Arc::clone(&snapshot_bus),
            stop.clone(),
        ));

        let bridge_task = if self.config.mqtt_enabled {
            let bridge = BridgeConfig::from_app_config(&self.config);
            Some(tokio::spawn(run_bridge(bridge, Arc::clone(&pipeline), stop.clone())))
        } else {
            info!("MQTT bridge disabled in configuration");
            None
        };

        let mut server_task = tokio::spawn(serve(listener, state, stop.clone().wait()));
        snapshot_bus.push_health("accepting ingress");
        info!("Step B: daemon running");

        let server_result = tokio::select! {
            _ = shutdown => {
                info!("Step S: shutdown requested");
                let _ = stop_tx.send(true);
                (&mut server_task).await
            }
            res = &mut server_task => {
                error!("HTTP server exited before shutdown was requested");
                let _ = stop_tx.send(true);
                res
            }
        };

        if let Some(task) = bridge_task {
            if let Err(err) = task.await {
                error!("MQTT bridge task failed: {}", err);
            }
        }
        pipeline.drain(DRAIN_TIMEOUT).await;
        if let Err(err) = metrics_task.await {
            error!("Storage metrics task failed: {}", err);
        }
        snapshot_bus.push_health("stopped");
        info!("Step C: daemon stopped");

        match server_result {
            Ok(result) => result,
            Err(err) => Err(anyhow!("HTTP server task failed: {}", err)),
        }
    }
}

pub fn config_summary(config: &AppConfig) -> ConfigSummary {
    ConfigSummary {
        replay_limit: config.replay_limit,
        max_inflight_cycles: config.max_inflight_cycles,
        write_timeout_ms: config.write_timeout_ms,
        subscriber_queue_capacity: config.subscriber_queue_capacity,
        subscriber_send_timeout_ms: config.subscriber_send_timeout_ms,
        mqtt_enabled: config.mqtt_enabled,
    }
}

async fn forward_storage_metrics(
    backend: &'static str,
    snapshot_bus: Arc<SnapshotBus>,
    stop: ShutdownSignal,
) {
    let mut rx = storage_metrics_watch();
    let stop = stop.wait();
    tokio::pin!(stop);
    loop {
        let metrics = rx.borrow_and_update().clone();
        snapshot_bus.set_storage(StorageInfo {
            backend: backend.to_string(),
            backlog_count: metrics.backlog_count,
            last_flush_at: metrics.last_flush_at,
        });
        tokio::select! {
            _ = &mut stop => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}
