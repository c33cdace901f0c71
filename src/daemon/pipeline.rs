//! Ingest pipeline: frame → envelope → sub-records → one cycle of
//! concurrent writes → at most one broadcast.
//!
//! Admission (`ingest`) runs on the submitter's task. Each admitted cycle is
//! then driven to completion by its own task (`persist`), which owns the
//! cycle's [`CycleJoin`](telemux_core::cycle::CycleJoin); nothing about a
//! cycle is shared with any other.

use crate::daemon::fanout::FanoutHub;
use crate::daemon::snapshot::SnapshotBus;
use crate::storage::RecordStore;
use crate::util::logging::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use telemux_core::cycle::CycleIdGenerator;
use tokio::sync::Semaphore;

pub mod ingest;
pub mod persist;
pub mod types;

pub use types::{Admission, CycleReport, IngestError, IngressSource, PipelineConfig};

pub struct PipelineResources {
    pub store: Arc<dyn RecordStore>,
    pub fanout: Arc<FanoutHub>,
    pub snapshot_bus: Arc<SnapshotBus>,
}

pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn RecordStore>,
    fanout: Arc<FanoutHub>,
    snapshot_bus: Arc<SnapshotBus>,
    ids: CycleIdGenerator,
    permits: Arc<Semaphore>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, resources: PipelineResources) -> Arc<Self> {
        let PipelineResources {
            store,
            fanout,
            snapshot_bus,
        } = resources;
        let permits = Arc::new(Semaphore::new(config.max_inflight_cycles.max(1)));
        Arc::new(Self {
            config,
            store,
            fanout,
            snapshot_bus,
            ids: CycleIdGenerator::new(),
            permits,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn snapshot_bus(&self) -> &Arc<SnapshotBus> {
        &self.snapshot_bus
    }

    pub fn inflight(&self) -> usize {
        self.permit_total() - self.permits.available_permits()
    }

    fn permit_total(&self) -> usize {
        self.config.max_inflight_cycles.max(1)
    }

    /// Resolves once no cycle holds a permit.
    pub async fn wait_idle(&self) {
        let all = u32::try_from(self.permit_total()).unwrap_or(u32::MAX);
        if let Ok(permits) = self.permits.acquire_many(all).await {
            drop(permits);
        }
    }

    /// Stops admitting cycles and waits up to `deadline` for the in-flight
    /// ones. Returns false when cycles were still running at the deadline.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let inflight = self.inflight();
        if inflight > 0 {
            info!("Waiting for {} in-flight cycles", inflight);
        }
        let idle = tokio::time::timeout(deadline, self.wait_idle()).await.is_ok();
        self.permits.close();
        if !idle {
            warn!(
                "{} cycles still in flight after {:?}; abandoning them",
                self.inflight(),
                deadline
            );
        }
        idle
    }
}
