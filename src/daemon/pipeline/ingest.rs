use crate::daemon::snapshot::Counter;
use crate::util::logging::{debug, warn};
use std::sync::Arc;
use telemux_core::frame::{Decoded, Frame, decode_frame};
use telemux_core::router::{Routed, route_envelope};
use tokio::sync::{OwnedSemaphorePermit, TryAcquireError};

use super::Pipeline;
use super::types::{Admission, IngestError, IngressSource};

impl Pipeline {
    /// Decodes and routes one frame, then hands the resulting cycle to its
    /// own task. Returns as soon as the cycle is admitted.
    ///
    /// HTTP submissions are refused with [`IngestError::Saturated`] once
    /// `max_inflight_cycles` cycles are running; bridge submissions wait for
    /// a slot instead.
    pub async fn submit(
        self: &Arc<Self>,
        frame: Frame,
        source: IngressSource,
    ) -> Result<Admission, IngestError> {
        self.snapshot_bus.bump(Counter::FramesReceived);
        if self.permits.is_closed() {
            return Err(IngestError::Closed);
        }

        let envelope = match decode_frame(frame) {
            Decoded::Envelope(envelope) => envelope,
            Decoded::RawText(raw) => {
                self.snapshot_bus.bump(Counter::RawTextFrames);
                match &raw.error {
                    Some(err) => warn!("{} frame looked structured but did not parse: {}", source, err),
                    None => debug!("{} frame is raw text ({} bytes)", source, raw.text.len()),
                }
                return Err(IngestError::NotStructured {
                    text: raw.text,
                    cause: raw.error,
                });
            }
        };

        let Routed {
            records,
            rejections,
        } = route_envelope(&envelope);
        if !rejections.is_empty() {
            self.snapshot_bus
                .add(Counter::RecordsRejected, rejections.len() as u64);
            for rejection in &rejections {
                warn!("{} envelope: rejected {}", source, rejection);
            }
        }

        if records.is_empty() {
            let cycle = self.ids.next_id();
            self.run_cycle(cycle, records).await;
            return Ok(Admission::Empty { cycle });
        }

        let permit = self.acquire_permit(source).await?;
        let cycle = self.ids.next_id();
        let expected = records.len();
        debug!("{}: admitted from {} with {} sub-records", cycle, source, expected);

        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            pipeline.run_cycle(cycle, records).await;
        });

        Ok(Admission::Accepted {
            cycle,
            records: expected,
        })
    }

    async fn acquire_permit(
        &self,
        source: IngressSource,
    ) -> Result<OwnedSemaphorePermit, IngestError> {
        let permits = Arc::clone(&self.permits);
        match source {
            IngressSource::Http => match permits.try_acquire_owned() {
                Ok(permit) => Ok(permit),
                Err(TryAcquireError::NoPermits) => {
                    self.snapshot_bus.bump(Counter::CyclesRefused);
                    warn!(
                        "{} envelope refused: {} cycles in flight",
                        source,
                        self.permit_total()
                    );
                    Err(IngestError::Saturated {
                        limit: self.permit_total(),
                    })
                }
                Err(TryAcquireError::Closed) => Err(IngestError::Closed),
            },
            IngressSource::Bridge => permits
                .acquire_owned()
                .await
                .map_err(|_| IngestError::Closed),
        }
    }
}
