//! Per-item error taxonomy. Every variant here is contained at the scope of
//! one frame, one sub-record or one subscriber; none of them abort a cycle.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("structured parse failed: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingRejection {
    #[error("{category}: payload is not an object")]
    NotAnObject { category: &'static str },
    #[error("{category}: expected at least {expected} fields, found {found}")]
    TooFewFields {
        category: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{category}: field '{field}' is missing or not numeric")]
    NonNumericField {
        category: &'static str,
        field: &'static str,
    },
}

impl RoutingRejection {
    pub fn category(&self) -> &'static str {
        match self {
            RoutingRejection::NotAnObject { category }
            | RoutingRejection::TooFewFields { category, .. }
            | RoutingRejection::NonNumericField { category, .. } => category,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("store write failed: {0}")]
    Store(String),
    #[error("store write timed out after {after_ms}ms")]
    TimedOut { after_ms: u64 },
    #[error("store writer is no longer running")]
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("subscriber connection closed")]
    Closed,
    #[error("subscriber queue full ({capacity} messages)")]
    QueueFull { capacity: usize },
    #[error("subscriber send timed out after {after_ms}ms")]
    TimedOut { after_ms: u64 },
    #[error("transport error: {0}")]
    Transport(String),
}
