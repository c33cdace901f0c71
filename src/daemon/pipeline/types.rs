use std::fmt;
use std::time::Duration;
use telemux_core::cycle::CycleId;
use telemux_core::error::{DecodeError, PersistenceError};
use telemux_core::records::Category;
use thiserror::Error;

use crate::util::config::AppConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IngressSource {
    Http,
    Bridge,
}

impl fmt::Display for IngressSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngressSource::Http => f.write_str("http"),
            IngressSource::Bridge => f.write_str("mqtt"),
        }
    }
}

/// What the submitter learns about an accepted envelope. Persistence and
/// broadcast happen afterwards and are never reported back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted { cycle: CycleId, records: usize },
    /// Envelope routed to nothing; the cycle retired without writes.
    Empty { cycle: CycleId },
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("frame is not a structured envelope")]
    NotStructured {
        text: String,
        #[source]
        cause: Option<DecodeError>,
    },
    #[error("{limit} cycles already in flight")]
    Saturated { limit: usize },
    #[error("pipeline is shutting down")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_inflight_cycles: usize,
    pub write_timeout: Duration,
}

impl PipelineConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            max_inflight_cycles: config.max_inflight_cycles,
            write_timeout: Duration::from_millis(config.write_timeout_ms),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

/// Outcome of one driven cycle, mostly for logs and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle: CycleId,
    pub expected: usize,
    pub persisted: Vec<Category>,
    pub failed: Vec<(Category, PersistenceError)>,
    /// Subscribers that accepted the broadcast; `None` when nothing was sent.
    pub delivered_to: Option<usize>,
}

impl CycleReport {
    pub(crate) fn new(cycle: CycleId, expected: usize) -> Self {
        Self {
            cycle,
            expected,
            persisted: Vec::new(),
            failed: Vec::new(),
            delivered_to: None,
        }
    }

    pub fn broadcast(&self) -> bool {
        self.delivered_to.is_some()
    }
}
