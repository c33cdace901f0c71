use crate::daemon::snapshot::Counter;
use crate::util::logging::{debug, error};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use telemux_core::cycle::{Completion, CycleId, CycleJoin, WriteOutcome};
use telemux_core::error::PersistenceError;
use telemux_core::records::SubRecord;

use super::Pipeline;
use super::types::CycleReport;

impl Pipeline {
    /// Drives one cycle: every sub-record is written concurrently, each
    /// completion is folded into the cycle's join, and the join's single
    /// completion decides whether anything is broadcast.
    pub async fn run_cycle(&self, cycle: CycleId, records: Vec<SubRecord>) -> CycleReport {
        self.snapshot_bus.bump(Counter::CyclesStarted);
        let mut report = CycleReport::new(cycle, records.len());
        let mut join = CycleJoin::new(cycle, records.len());
        let mut completion = join.check_completion();

        let mut writes: FuturesUnordered<_> = records
            .into_iter()
            .map(|record| self.persist_one(record))
            .collect();

        while let Some(outcome) = writes.next().await {
            self.count_write(&outcome, &mut report);
            match join.complete_one(outcome) {
                Ok(Some(done)) => completion = Some(done),
                Ok(None) => {}
                Err(err) => error!("{}", err),
            }
        }

        match completion {
            Some(Completion::Broadcast(aggregate)) => {
                report.delivered_to = Some(self.fanout.broadcast_cycle(cycle, aggregate));
                self.snapshot_bus.bump(Counter::CyclesBroadcast);
            }
            Some(Completion::Empty) => {
                debug!("{}: nothing persisted, retired without broadcast", cycle);
                self.snapshot_bus.bump(Counter::CyclesEmpty);
            }
            None => error!("{}: ended with {} writes unaccounted for", cycle, join.pending()),
        }
        report
    }

    /// The write, its identity and the timeout as one future. A write that
    /// outlives the timeout is reported as failed even if the store later
    /// commits it.
    async fn persist_one(&self, record: SubRecord) -> WriteOutcome {
        let category = record.category();
        let limit = self.config.write_timeout;
        match tokio::time::timeout(limit, self.store.insert(record)).await {
            Ok(Ok(persisted)) => WriteOutcome::Persisted(persisted),
            Ok(Err(error)) => WriteOutcome::Failed { category, error },
            Err(_) => WriteOutcome::Failed {
                category,
                error: PersistenceError::TimedOut {
                    after_ms: limit.as_millis() as u64,
                },
            },
        }
    }

    fn count_write(&self, outcome: &WriteOutcome, report: &mut CycleReport) {
        match outcome {
            WriteOutcome::Persisted(record) => {
                self.snapshot_bus.bump(Counter::WritesOk);
                report.persisted.push(record.category());
            }
            WriteOutcome::Failed { category, error } => {
                let counter = match error {
                    PersistenceError::TimedOut { .. } => Counter::WritesTimedOut,
                    _ => Counter::WritesFailed,
                };
                self.snapshot_bus.bump(counter);
                report.failed.push((*category, error.clone()));
            }
        }
    }
}
